//! # Device Commands
//!
//! A [`DeviceCommand`] is a partial change request: only the fields that are
//! set are sent to the remote service and applied optimistically.
//!
//! ## Command Lifecycle
//! ```text
//! ┌──────────────┐  validate  ┌──────────────┐  send ok  ┌──────────────────┐
//! │ DeviceCommand│───────────►│ remote call  │──────────►│ apply_to(state)  │
//! └──────────────┘            └──────────────┘           │ origin=Commanded │
//!                                    │ error             └────────┬─────────┘
//!                                    ▼                            │ grace window
//!                             store untouched                     ▼
//!                                                        CommandFields::preserve
//! ```
//!
//! [`CommandFields`] records *which* fields a command touched. While the
//! grace window is open, remote snapshots are merged so those fields keep
//! their commanded values.

use crate::types::{DeviceState, FanSpeed, HvacMode};
use std::time::Instant;

/// Partial change request for one device.
///
/// Setting `mode` to [`HvacMode::Off`] powers the unit down; any other mode
/// powers it up.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceCommand {
    pub mode: Option<HvacMode>,
    pub heating_setpoint: Option<f64>,
    pub cooling_setpoint: Option<f64>,
    pub fan_speed: Option<FanSpeed>,
}

impl DeviceCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: HvacMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_heating_setpoint(mut self, celsius: f64) -> Self {
        self.heating_setpoint = Some(celsius);
        self
    }

    pub fn with_cooling_setpoint(mut self, celsius: f64) -> Self {
        self.cooling_setpoint = Some(celsius);
        self
    }

    pub fn with_fan_speed(mut self, speed: FanSpeed) -> Self {
        self.fan_speed = Some(speed);
        self
    }

    /// Shorthand for `with_mode(HvacMode::Off)`.
    pub fn power_off() -> Self {
        Self::new().with_mode(HvacMode::Off)
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Which fields this command touches.
    pub fn fields(&self) -> CommandFields {
        CommandFields {
            power_mode: self.mode.is_some(),
            heating_setpoint: self.heating_setpoint.is_some(),
            cooling_setpoint: self.cooling_setpoint.is_some(),
            fan_speed: self.fan_speed.is_some(),
        }
    }

    /// Returns the state the device is expected to have once the command
    /// takes effect.
    pub fn apply_to(&self, state: &DeviceState, observed_at: Instant) -> DeviceState {
        let mut next = *state;
        if let Some(mode) = self.mode {
            next.mode = mode;
            next.power_on = mode.is_powered();
        }
        if let Some(sp) = self.heating_setpoint {
            next.heating_setpoint = sp;
        }
        if let Some(sp) = self.cooling_setpoint {
            next.cooling_setpoint = sp;
        }
        if let Some(speed) = self.fan_speed {
            next.fan_speed = speed;
        }
        next.observed_at = observed_at;
        next
    }
}

// =============================================================================
// Command Fields
// =============================================================================

/// Set of fields touched by one or more commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFields {
    /// Power and mode travel together.
    pub power_mode: bool,
    pub heating_setpoint: bool,
    pub cooling_setpoint: bool,
    pub fan_speed: bool,
}

impl CommandFields {
    pub fn is_empty(&self) -> bool {
        !(self.power_mode || self.heating_setpoint || self.cooling_setpoint || self.fan_speed)
    }

    /// Fields touched by either set. Used when a second command lands inside
    /// the grace window of the first.
    pub fn union(self, other: CommandFields) -> CommandFields {
        CommandFields {
            power_mode: self.power_mode || other.power_mode,
            heating_setpoint: self.heating_setpoint || other.heating_setpoint,
            cooling_setpoint: self.cooling_setpoint || other.cooling_setpoint,
            fan_speed: self.fan_speed || other.fan_speed,
        }
    }

    /// Copies the marked fields from `from` onto `onto`, leaving every other
    /// field of `onto` as the remote reported it.
    pub fn preserve(&self, from: &DeviceState, mut onto: DeviceState) -> DeviceState {
        if self.power_mode {
            onto.power_on = from.power_on;
            onto.mode = from.mode;
        }
        if self.heating_setpoint {
            onto.heating_setpoint = from.heating_setpoint;
        }
        if self.cooling_setpoint {
            onto.cooling_setpoint = from.cooling_setpoint;
        }
        if self.fan_speed {
            onto.fan_speed = from.fan_speed;
        }
        onto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateChannel;

    fn heating_state() -> DeviceState {
        DeviceState {
            power_on: true,
            mode: HvacMode::Heat,
            current_temperature: 21.5,
            heating_setpoint: 22.0,
            cooling_setpoint: 25.0,
            auto_setpoint: None,
            fan_speed: FanSpeed::Auto,
            humidity: Some(45.0),
            signal_strength: None,
            connected: true,
            source_channel: UpdateChannel::Pull,
            observed_at: Instant::now(),
        }
    }

    #[test]
    fn test_fields_reflect_set_values() {
        let cmd = DeviceCommand::new()
            .with_mode(HvacMode::Cool)
            .with_cooling_setpoint(23.0);
        let fields = cmd.fields();
        assert!(fields.power_mode);
        assert!(fields.cooling_setpoint);
        assert!(!fields.heating_setpoint);
        assert!(!fields.fan_speed);
        assert!(DeviceCommand::new().is_empty());
    }

    #[test]
    fn test_apply_off_powers_down() {
        let state = heating_state();
        let next = DeviceCommand::power_off().apply_to(&state, Instant::now());
        assert!(!next.power_on);
        assert_eq!(next.mode, HvacMode::Off);
        assert_eq!(next.heating_setpoint, 22.0);
        assert_eq!(next.current_temperature, 21.5);
    }

    #[test]
    fn test_apply_mode_powers_up() {
        let mut state = heating_state();
        state.power_on = false;
        state.mode = HvacMode::Off;
        let next = DeviceCommand::new()
            .with_mode(HvacMode::Dry)
            .apply_to(&state, Instant::now());
        assert!(next.power_on);
        assert_eq!(next.mode, HvacMode::Dry);
    }

    #[test]
    fn test_preserve_keeps_only_commanded_fields() {
        let commanded = DeviceCommand::new()
            .with_mode(HvacMode::Cool)
            .apply_to(&heating_state(), Instant::now());

        let mut remote = heating_state();
        remote.current_temperature = 23.0;
        remote.heating_setpoint = 19.0;

        let merged = CommandFields {
            power_mode: true,
            ..Default::default()
        }
        .preserve(&commanded, remote);

        assert_eq!(merged.mode, HvacMode::Cool);
        assert_eq!(merged.current_temperature, 23.0);
        assert_eq!(merged.heating_setpoint, 19.0);
    }

    #[test]
    fn test_union() {
        let a = DeviceCommand::new().with_fan_speed(FanSpeed::High).fields();
        let b = DeviceCommand::new().with_heating_setpoint(20.0).fields();
        let u = a.union(b);
        assert!(u.fan_speed && u.heating_setpoint);
        assert!(!u.power_mode);
    }
}
