//! Power-of-two threshold derivation.
//!
//! Device-wide thresholds are kept as exponents so the mid-band budget is a
//! pure shift of the free-block count. Per-zone thresholds are plain block
//! counts.

use serde::{Deserialize, Serialize};

use crate::config::{DeviceGeometry, RateLimiterConfig};

/// Smallest `p` such that `2^p >= x`. `count_order(0) == count_order(1) == 0`.
pub fn count_order(x: u64) -> u32 {
    if x <= 1 {
        0
    } else {
        64 - (x - 1).leading_zeros()
    }
}

/// Thresholds fixed at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Exponent of the full-admission free-block count.
    pub high_pow: u32,
    /// Exponent of the closed-admission free-block count.
    pub low_pow: u32,
    /// A zone with at least this many free blocks is healthy.
    pub per_zone_high: u64,
    /// A zone with fewer free blocks than this is starved.
    pub per_zone_low: u64,
    /// log2 of the number of windows in the staging buffer.
    pub window_pow: u32,
    /// log2 of the slots per window.
    pub addrs_pow: u32,
}

impl Thresholds {
    /// Derives every threshold from geometry and tuning.
    pub fn derive(geometry: &DeviceGeometry, config: &RateLimiterConfig) -> Self {
        let total = geometry.total_blocks();
        let high_pow = count_order(total / config.high_thrs);
        let low_pow = count_order(total / config.low_thrs);

        let per_zone_high = geometry.blocks_per_zone / config.high_thrs;
        let per_zone_low = (geometry.blocks_per_zone / config.low_thrs).max(config.min_zone_low);

        let window_pow = count_order(geometry.buffer_slots >> config.max_req_addrs_pow);

        Self {
            high_pow,
            low_pow,
            per_zone_high,
            per_zone_low,
            window_pow,
            addrs_pow: config.max_req_addrs_pow,
        }
    }

    /// Free-block count at or above which admission is fully open.
    pub fn high_blocks(&self) -> u64 {
        1u64 << self.high_pow
    }

    /// Free-block count at or below which admission is closed.
    pub fn low_blocks(&self) -> u64 {
        1u64 << self.low_pow
    }

    /// Admission ceiling for a device-wide free-block count.
    ///
    /// Monotone non-decreasing in `free_blocks`; bounded by `full_capacity`.
    pub fn ceiling_for(&self, free_blocks: u64, full_capacity: u64) -> u64 {
        if free_blocks >= self.high_blocks() {
            return full_capacity;
        }
        if free_blocks <= self.low_blocks() {
            return 0;
        }

        let windows = if self.high_pow >= self.window_pow {
            free_blocks >> (self.high_pow - self.window_pow)
        } else {
            free_blocks << (self.window_pow - self.high_pow)
        };
        windows
            .saturating_mul(1u64 << self.addrs_pow)
            .min(full_capacity)
    }

    /// Whether the device-wide count alone calls for reclamation.
    pub fn aggregate_wants_gc(&self, free_blocks: u64) -> bool {
        free_blocks < self.high_blocks()
    }
}
