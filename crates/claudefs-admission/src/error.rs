//! Error types for the admission-control subsystem.

use thiserror::Error;

/// Result type alias for admission-control operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Error variants for admission-control operations.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Tuning parameters are inconsistent.
    #[error("Invalid config: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Device geometry or the initial free counts reported at attach are unusable.
    #[error("Invalid geometry: {reason}")]
    InvalidGeometry {
        /// Description of the problem.
        reason: String,
    },

    /// The zone index is outside the attached device.
    #[error("Unknown zone {zone} (device has {nr_zones} zones)")]
    UnknownZone {
        /// The requested zone index.
        zone: u32,
        /// Number of zones on the device.
        nr_zones: u32,
    },

    /// The reservation can never fit in the staging buffer.
    #[error("Reservation of {requested} slots exceeds buffer capacity {capacity}")]
    RequestTooLarge {
        /// Slots requested.
        requested: u64,
        /// Staging buffer capacity in slots.
        capacity: u64,
    },

    /// A bounded reservation attempt expired before capacity became available.
    #[error("Reservation of {requested} slots timed out after {waited_ms} ms")]
    Timeout {
        /// Slots requested.
        requested: u64,
        /// Time spent waiting in milliseconds.
        waited_ms: u64,
    },

    /// The limiter has been torn down.
    #[error("Admission control is shut down")]
    ShutDown,

    /// A caller bypassed the gate or ledger contract.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Text written to the control surface could not be parsed.
    #[error("Invalid control input {input:?}: {reason}")]
    InvalidControlInput {
        /// The raw input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be decoded.
    #[error("Parse error: {reason}")]
    Parse {
        /// Description of the error.
        reason: String,
    },
}
