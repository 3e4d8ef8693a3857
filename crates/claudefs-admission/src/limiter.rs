//! The shared rate limiter.
//!
//! One `RateLimiter` is attached per mounted volume and shared by `Arc`
//! between user writers, the flush path, the allocator and the monitoring
//! surface. Lock order: a zone's ledger lock is always dropped before the
//! aggregate lock is taken, and nothing takes a zone lock while holding the
//! aggregate lock.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::info;

use crate::config::{DeviceGeometry, RateLimiterConfig};
use crate::controller::{RateLimiterState, Recompute};
use crate::error::{AdmissionError, AdmissionResult};
use crate::ledger::{ZoneLedger, ZoneSnapshot};
use crate::stats::RateLimiterStats;
use crate::thresholds::Thresholds;
use crate::trigger::GcTrigger;

/// Write admission control and GC hysteresis for one flash volume.
pub struct RateLimiter {
    geometry: DeviceGeometry,
    thresholds: Thresholds,
    zones: ZoneLedger,
    pub(crate) state: Mutex<RateLimiterState>,
    /// Signalled whenever capacity may have become available.
    pub(crate) space: Condvar,
    trigger: Arc<dyn GcTrigger>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("geometry", &self.geometry)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Attaches to a volume, deriving all state from the allocator's live
    /// per-zone free counts. The first GC decision is delivered immediately.
    pub fn attach(
        geometry: DeviceGeometry,
        config: &RateLimiterConfig,
        zone_free: &[u64],
        trigger: Arc<dyn GcTrigger>,
    ) -> AdmissionResult<Self> {
        config.validate()?;
        geometry.validate()?;
        if zone_free.len() != geometry.nr_zones as usize {
            return Err(AdmissionError::InvalidGeometry {
                reason: format!(
                    "{} zone free counts reported for {} zones",
                    zone_free.len(),
                    geometry.nr_zones
                ),
            });
        }

        let thresholds = Thresholds::derive(&geometry, config);
        let zones = ZoneLedger::new(geometry.blocks_per_zone, zone_free)?;
        let state = RateLimiterState::new(
            &thresholds,
            geometry.total_blocks(),
            geometry.buffer_slots,
            zone_free,
        );

        let limiter = Self {
            geometry,
            thresholds,
            zones,
            state: Mutex::new(state),
            space: Condvar::new(),
            trigger,
        };

        {
            let mut state = limiter.state.lock();
            let outcome = state.recompute(&limiter.thresholds, None);
            info!(
                total_blocks = state.total_blocks,
                free_blocks = state.free_blocks,
                buffer_slots = state.full_capacity,
                ceiling = state.admission_ceiling,
                high = limiter.thresholds.high_blocks(),
                low = limiter.thresholds.low_blocks(),
                zone_high = limiter.thresholds.per_zone_high,
                zone_low = limiter.thresholds.per_zone_low,
                "rate limiter attached"
            );
            limiter.publish(&state, outcome);
        }

        Ok(limiter)
    }

    /// Delivers the outcome of a recompute. Called with the aggregate lock held.
    fn publish(&self, _state: &MutexGuard<'_, RateLimiterState>, outcome: Recompute) {
        if let Some(signal) = outcome.signal {
            tracing::debug!(%signal, "GC signal");
            self.trigger.notify(signal);
        }
        if outcome.ceiling_raised {
            self.space.notify_all();
        }
    }

    /// Erase completion in `zone`: one more free block.
    pub fn increment_free(&self, zone: u32) -> AdmissionResult<()> {
        let snapshot = self.zones.increment(zone)?;
        let mut state = self.state.lock();
        state.credit_free();
        self.finish_ledger_update(&mut state, snapshot);
        Ok(())
    }

    /// Block allocation from `zone`: one fewer free block.
    ///
    /// Underflow is judged per zone. Once the zone accepts the allocation
    /// the aggregate follows, even if a concurrent erase completion in the
    /// same zone has not been applied to it yet.
    pub fn decrement_free(&self, zone: u32) -> AdmissionResult<()> {
        let snapshot = self.zones.decrement(zone)?;
        let mut state = self.state.lock();
        state.debit_free();
        self.finish_ledger_update(&mut state, snapshot);
        Ok(())
    }

    fn finish_ledger_update(
        &self,
        state: &mut MutexGuard<'_, RateLimiterState>,
        snapshot: ZoneSnapshot,
    ) {
        let outcome = state.recompute(&self.thresholds, Some(snapshot));
        self.publish(state, outcome);
    }

    /// Recomputes from current counts, dropping any administrative override.
    pub fn recompute(&self) {
        let mut state = self.state.lock();
        let outcome = state.recompute(&self.thresholds, None);
        self.publish(&state, outcome);
    }

    /// Administrative throttle: replaces the ceiling until the next recompute.
    ///
    /// The value is not checked against the hysteresis model or the buffer
    /// size. Reservations already granted are never revoked.
    pub fn set_ceiling(&self, ceiling: u64) {
        let mut state = self.state.lock();
        let previous = state.admission_ceiling;
        state.admission_ceiling = ceiling;
        state.override_active = true;
        state.counters.overrides += 1;
        info!(from = previous, to = ceiling, "admission ceiling overridden");
        if ceiling > previous {
            self.space.notify_all();
        }
    }

    /// Current admission ceiling in slots.
    pub fn admission_ceiling(&self) -> u64 {
        self.state.lock().admission_ceiling
    }

    /// Slots currently reserved.
    pub fn reserved_count(&self) -> u64 {
        self.state.lock().reserved_count
    }

    /// Device-wide free erase blocks.
    pub fn free_blocks(&self) -> u64 {
        self.state.lock().free_blocks
    }

    /// Free erase blocks of one zone.
    pub fn zone_free_blocks(&self, zone: u32) -> AdmissionResult<u64> {
        self.zones.free_blocks(zone)
    }

    /// Free erase blocks of every zone.
    pub fn zone_free_counts(&self) -> Vec<u64> {
        self.zones.free_counts()
    }

    /// Whether `zone` is currently flagged as starved.
    pub fn zone_starved(&self, zone: u32) -> AdmissionResult<bool> {
        if zone >= self.geometry.nr_zones {
            return Err(AdmissionError::UnknownZone {
                zone,
                nr_zones: self.geometry.nr_zones,
            });
        }
        Ok(self.state.lock().zone_starved(zone))
    }

    /// Reservations currently parked.
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Thresholds derived at attach.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Geometry reported at attach.
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Consistent snapshot for monitoring.
    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            free_blocks: state.free_blocks,
            total_blocks: state.total_blocks,
            full_capacity: state.full_capacity,
            admission_ceiling: state.admission_ceiling,
            reserved_count: state.reserved_count,
            waiters: state.queue.len(),
            override_active: state.override_active,
            high_threshold: self.thresholds.high_blocks(),
            low_threshold: self.thresholds.low_blocks(),
            per_zone_high: self.thresholds.per_zone_high,
            per_zone_low: self.thresholds.per_zone_low,
            starved_zones: state.starved_zones(),
            last_signal: state.last_signal,
            shut_down: state.shut_down,
            counters: state.counters.clone(),
        }
    }
}
