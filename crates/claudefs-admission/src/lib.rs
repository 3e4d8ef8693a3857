#![warn(missing_docs)]

//! ClaudeFS admission control: flash write rate limiting and GC hysteresis
//!
//! This crate decides how much user write traffic may enter the bounded
//! staging buffer of the log-structured flash allocator, and when background
//! reclamation should start or stop. It tracks free erase blocks per zone and
//! device-wide, derives a write budget from power-of-two thresholds, and
//! blocks writers in FIFO order while the budget is exhausted.

pub mod config;
pub mod control;
mod controller;
pub mod error;
mod gate;
pub mod ledger;
pub mod limiter;
pub mod pool;
pub mod stats;
pub mod thresholds;
pub mod trigger;

pub use config::{AdmissionConfig, DeviceGeometry, RateLimiterConfig};
pub use control::{parse_unsigned, status_line, store_ceiling, zone_listing};
pub use error::{AdmissionError, AdmissionResult};
pub use ledger::{ZoneFreeCount, ZoneLedger, ZoneSnapshot};
pub use limiter::RateLimiter;
pub use pool::{BlockAddr, ZonedBlockPool};
pub use stats::{AdmissionCounters, RateLimiterStats};
pub use thresholds::{count_order, Thresholds};
pub use trigger::{ChannelGcTrigger, GcSignal, GcTrigger, NoopGcTrigger, RecordingGcTrigger};
