//! Error handling for the hybrid cloud simulator.

use thiserror::Error;

/// Result type for simulator operations.
pub type SimResult<T> = Result<T, SimError>;

/// Errors that can occur while building or running a simulation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SimError {
    /// No device of the required class is registered with the broker.
    #[error("No eligible {class} device: {reason}")]
    NoEligibleDevice { class: String, reason: String },

    /// A device name was registered twice.
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),

    /// Device lookup by name failed.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The pool was closed while (or before) the request was waiting.
    #[error("Resource pool closed: {0}")]
    ResourceClosed(String),

    /// A single request can never be satisfied by the pool.
    #[error("Request for {requested} units exceeds capacity {capacity} of pool {pool}")]
    ExceedsCapacity {
        pool: String,
        requested: u64,
        capacity: u64,
    },

    /// More units were returned than are currently held.
    #[error("Release of {amount} units on pool {pool} exceeds the {in_use} units in use")]
    OverRelease { pool: String, amount: u64, in_use: u64 },

    /// Delays, durations and horizons must be finite and non-negative.
    #[error("Invalid simulated time {value}: {reason}")]
    InvalidTime { value: f64, reason: String },

    /// The clock this handle belonged to has been dropped.
    #[error("Simulation clock is no longer running")]
    ClockStopped,

    /// An arrival record in a replayed trace is malformed.
    #[error("Invalid arrival record #{index}: {reason}")]
    InvalidArrival { index: usize, reason: String },

    /// The run would never terminate.
    #[error("Unbounded run: {0}")]
    UnboundedRun(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml_ng::Error),
}

impl SimError {
    /// Shorthand for an invalid-time error.
    pub(crate) fn invalid_time(value: f64, reason: impl Into<String>) -> Self {
        SimError::InvalidTime {
            value,
            reason: reason.into(),
        }
    }

    /// Check if this error stems from configuration rather than runtime state.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SimError::NoEligibleDevice { .. }
                | SimError::DuplicateDevice(_)
                | SimError::UnboundedRun(_)
                | SimError::ConfigError(_)
        )
    }
}
