//! # hvac-core: Thermostat Domain Model
//!
//! Pure domain types for the dual-channel sync engine. This crate performs
//! no I/O and spawns no tasks; everything here is deterministic and cheap to
//! test.
//!
//! ## Modules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            hvac-core                                    │
//! │                                                                         │
//! │  types.rs       DeviceSerial, SiteId, HvacMode, FanSpeed,               │
//! │                 UpdateChannel, DeviceState, StateReport                 │
//! │  command.rs     DeviceCommand, CommandFields                            │
//! │  validation.rs  snapshot and command checks                             │
//! │  error.rs       ValidationError                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod error;
pub mod types;
pub mod validation;

pub use command::{CommandFields, DeviceCommand};
pub use error::ValidationError;
pub use types::{
    DeviceSerial, DeviceState, FanSpeed, HvacMode, SiteId, StateReport, UpdateChannel,
    DEFAULT_COOLING_SETPOINT, DEFAULT_HEATING_SETPOINT,
};
pub use validation::validate_command;
