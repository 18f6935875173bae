//! Validation helpers for snapshots and commands.
//!
//! Range checks on setpoints are left to the remote service; it knows the
//! limits of each model and rejects out-of-range commands itself.

use crate::command::DeviceCommand;
use crate::error::ValidationError;
use crate::types::{DeviceSerial, StateReport};

/// Filters out non-finite readings.
pub fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Returns the measured temperature of a report or rejects the report.
pub fn require_temperature(report: &StateReport) -> Result<f64, ValidationError> {
    finite(report.current_temperature).ok_or_else(|| ValidationError::MissingTemperature {
        serial: report.serial.to_string(),
    })
}

/// Checks a command before it is sent.
///
/// Rejects commands that change nothing and setpoints that are NaN or
/// infinite.
pub fn validate_command(
    serial: &DeviceSerial,
    command: &DeviceCommand,
) -> Result<(), ValidationError> {
    if command.is_empty() {
        return Err(ValidationError::EmptyCommand {
            serial: serial.to_string(),
        });
    }

    let setpoints = [
        ("heating_setpoint", command.heating_setpoint),
        ("cooling_setpoint", command.cooling_setpoint),
    ];
    for (field, value) in setpoints {
        if let Some(value) = value {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite {
                    field: field.to_string(),
                    value,
                });
            }
        }
    }

    Ok(())
}
