//! Tuning parameters and device geometry for admission control.
//!
//! Thresholds are expressed as divisors of device capacity: the high band
//! starts at `total_blocks / high_thrs` free blocks and the low band at
//! `total_blocks / low_thrs`, both rounded up to a power of two when the
//! limiter attaches.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, AdmissionResult};

/// Default divisor for the full-admission threshold (50% free).
pub const DEFAULT_HIGH_THRS: u64 = 2;
/// Default divisor for the closed-admission threshold (5% free).
pub const DEFAULT_LOW_THRS: u64 = 20;
/// Lowest value `per_zone_low` may take.
pub const DEFAULT_MIN_ZONE_LOW: u64 = 3;
/// log2 of the maximum number of addresses in one allocation request.
pub const DEFAULT_MAX_REQ_ADDRS_POW: u32 = 6;
/// Largest device the limiter manages; keeps `2^high_pow` within `u64`.
pub const MAX_TOTAL_BLOCKS: u64 = 1 << 63;

/// Tuning parameters for the hysteresis controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Divisor of total blocks giving the full-admission threshold. Default: 2
    pub high_thrs: u64,
    /// Divisor of total blocks giving the closed-admission threshold. Default: 20
    pub low_thrs: u64,
    /// Floor for the per-zone starvation threshold. Default: 3
    pub min_zone_low: u64,
    /// log2 of the slots in one buffer window. Default: 6
    pub max_req_addrs_pow: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            high_thrs: DEFAULT_HIGH_THRS,
            low_thrs: DEFAULT_LOW_THRS,
            min_zone_low: DEFAULT_MIN_ZONE_LOW,
            max_req_addrs_pow: DEFAULT_MAX_REQ_ADDRS_POW,
        }
    }
}

impl RateLimiterConfig {
    /// Checks that the divisors describe a non-empty hysteresis band.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.high_thrs == 0 || self.low_thrs == 0 {
            return Err(AdmissionError::InvalidConfig {
                reason: "threshold divisors must be non-zero".to_string(),
            });
        }
        if self.high_thrs >= self.low_thrs {
            return Err(AdmissionError::InvalidConfig {
                reason: format!(
                    "high_thrs ({}) must be smaller than low_thrs ({})",
                    self.high_thrs, self.low_thrs
                ),
            });
        }
        if self.max_req_addrs_pow >= 32 {
            return Err(AdmissionError::InvalidConfig {
                reason: format!("max_req_addrs_pow {} is too large", self.max_req_addrs_pow),
            });
        }
        Ok(())
    }

    /// Slots in one buffer window.
    pub fn window_slots(&self) -> u64 {
        1u64 << self.max_req_addrs_pow
    }
}

/// Device geometry reported by the allocator at attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    /// Number of independently allocatable zones (LUNs).
    pub nr_zones: u32,
    /// Erase blocks per zone.
    pub blocks_per_zone: u64,
    /// Staging buffer capacity in slots (the unit of reservations).
    pub buffer_slots: u64,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self {
            nr_zones: 4,
            blocks_per_zone: 1024,
            buffer_slots: 4096,
        }
    }
}

impl DeviceGeometry {
    /// Creates a geometry description.
    pub fn new(nr_zones: u32, blocks_per_zone: u64, buffer_slots: u64) -> Self {
        Self {
            nr_zones,
            blocks_per_zone,
            buffer_slots,
        }
    }

    /// Total erase blocks on the device. Saturates on geometries that
    /// [`DeviceGeometry::validate`] rejects.
    pub fn total_blocks(&self) -> u64 {
        self.blocks_per_zone.saturating_mul(u64::from(self.nr_zones))
    }

    /// Rejects geometries the limiter cannot manage.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.nr_zones == 0 {
            return Err(AdmissionError::InvalidGeometry {
                reason: "device has no zones".to_string(),
            });
        }
        if self.blocks_per_zone == 0 {
            return Err(AdmissionError::InvalidGeometry {
                reason: "zones have no blocks".to_string(),
            });
        }
        if self.buffer_slots == 0 {
            return Err(AdmissionError::InvalidGeometry {
                reason: "staging buffer has no slots".to_string(),
            });
        }
        // Every threshold must stay representable as a power of two.
        match self.blocks_per_zone.checked_mul(u64::from(self.nr_zones)) {
            Some(total) if total <= MAX_TOTAL_BLOCKS => Ok(()),
            _ => Err(AdmissionError::InvalidGeometry {
                reason: format!(
                    "{} zones of {} blocks exceed {} blocks",
                    self.nr_zones, self.blocks_per_zone, MAX_TOTAL_BLOCKS
                ),
            }),
        }
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Controller tuning.
    pub limiter: RateLimiterConfig,
    /// Device geometry.
    pub geometry: DeviceGeometry,
}

impl AdmissionConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> AdmissionResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: AdmissionConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| AdmissionError::Parse {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| AdmissionError::Parse {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(AdmissionError::Parse {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates both sections.
    pub fn validate(&self) -> AdmissionResult<()> {
        self.limiter.validate()?;
        self.geometry.validate()
    }
}
