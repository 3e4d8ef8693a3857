//! Point-in-time view of the limiter for monitoring.

use serde::{Deserialize, Serialize};

use crate::trigger::GcSignal;

/// Cumulative event counters, reset only by re-attaching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCounters {
    /// Reservations granted.
    pub admitted: u64,
    /// Reservations that had to park before being granted or failing.
    pub waited: u64,
    /// Bounded reservations that expired.
    pub timed_out: u64,
    /// Controller recomputations.
    pub recomputes: u64,
    /// GC start notifications delivered.
    pub gc_start_signals: u64,
    /// GC stop notifications delivered.
    pub gc_stop_signals: u64,
    /// Administrative ceiling overrides.
    pub overrides: u64,
}

/// Snapshot of the limiter, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    /// Device-wide free erase blocks.
    pub free_blocks: u64,
    /// Device capacity in erase blocks.
    pub total_blocks: u64,
    /// Staging buffer capacity in slots.
    pub full_capacity: u64,
    /// Current admission ceiling in slots.
    pub admission_ceiling: u64,
    /// Slots currently reserved.
    pub reserved_count: u64,
    /// Reservations currently parked.
    pub waiters: usize,
    /// Whether the ceiling is an administrative value.
    pub override_active: bool,
    /// Free-block count of full admission (`2^high_pow`).
    pub high_threshold: u64,
    /// Free-block count of closed admission (`2^low_pow`).
    pub low_threshold: u64,
    /// Per-zone healthy threshold.
    pub per_zone_high: u64,
    /// Per-zone starvation threshold.
    pub per_zone_low: u64,
    /// Zones currently flagged as starved.
    pub starved_zones: usize,
    /// Last GC signal delivered.
    pub last_signal: Option<GcSignal>,
    /// Whether the limiter has been shut down.
    pub shut_down: bool,
    /// Cumulative counters.
    pub counters: AdmissionCounters,
}

impl RateLimiterStats {
    /// Slots that could still be reserved without waiting.
    pub fn available(&self) -> u64 {
        self.admission_ceiling.saturating_sub(self.reserved_count)
    }

    /// Renders the snapshot as JSON for tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
