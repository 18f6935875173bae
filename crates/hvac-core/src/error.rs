//! # Error Types
//!
//! Domain-specific error types for hvac-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  hvac-core errors (this file)                                          │
//! │  └── ValidationError  - unusable snapshots, malformed commands         │
//! │                                                                         │
//! │  hvac-sync errors (separate crate)                                     │
//! │  └── SyncError        - auth, network, remote rejection, config        │
//! │                                                                         │
//! │  Flow: ValidationError → SyncError::Validation → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Validation failures for incoming snapshots and outgoing commands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A snapshot arrived without a usable measured temperature.
    ///
    /// ## When This Occurs
    /// - Push frame carried only a partial payload (setpoint change only)
    /// - Device dropped off the cloud and the API returned a null reading
    /// - Sensor reported NaN
    ///
    /// Derived values (heating/cooling state, comfort band) all depend on
    /// the measured temperature, so the whole snapshot is discarded.
    #[error("Snapshot for {serial} has no current temperature")]
    MissingTemperature { serial: String },

    /// A numeric field is not a finite number.
    #[error("Field {field} must be a finite number, got {value}")]
    NotFinite { field: String, value: f64 },

    /// A command with no fields set.
    #[error("Command for {serial} does not change anything")]
    EmptyCommand { serial: String },

    /// An unknown HVAC mode string.
    #[error("Unknown HVAC mode: '{0}'. Valid options: off, heat, cool, auto, vent, dry")]
    UnknownMode(String),

    /// An unknown fan speed string.
    #[error("Unknown fan speed: '{0}'. Valid options: auto, low, medium, high")]
    UnknownFanSpeed(String),

    /// A device serial was empty.
    #[error("Device serial must not be empty")]
    EmptySerial,
}
