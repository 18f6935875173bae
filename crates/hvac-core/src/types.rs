//! # Domain Types
//!
//! Core domain types shared by every layer of the sync engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  StateReport    │   │  DeviceState    │   │  UpdateChannel  │       │
//! │  │  ─────────────  │──►│  ─────────────  │   │  ─────────────  │       │
//! │  │  every field    │   │  validated,     │   │  Push           │       │
//! │  │  optional       │   │  immutable      │   │  Pull           │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  DeviceSerial   │   │    HvacMode     │   │    FanSpeed     │       │
//! │  │  SiteId         │   │  off/heat/cool  │   │  auto/low/      │       │
//! │  │  (newtypes)     │   │  auto/vent/dry  │   │  medium/high    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Report Resolution
//! A [`StateReport`] is what a channel delivers. Resolving it against the
//! prior stored state produces a [`DeviceState`]:
//! - no measured temperature → rejected
//! - core fields absent → prior value, then defaults
//! - optional sensors absent → `None` for pull snapshots (the capability
//!   went away), prior value for push snapshots (partial frames)

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::ValidationError;
use crate::validation::{finite, require_temperature};

/// Heating setpoint used when neither the report nor a prior state has one.
pub const DEFAULT_HEATING_SETPOINT: f64 = 20.0;

/// Cooling setpoint used when neither the report nor a prior state has one.
pub const DEFAULT_COOLING_SETPOINT: f64 = 24.0;

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque, stable identifier of one controllable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSerial(String);

impl DeviceSerial {
    /// Creates a serial, rejecting empty strings.
    pub fn new(serial: impl Into<String>) -> Result<Self, ValidationError> {
        let serial = serial.into();
        if serial.trim().is_empty() {
            return Err(ValidationError::EmptySerial);
        }
        Ok(DeviceSerial(serial))
    }

    /// Returns the serial as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceSerial {
    fn from(s: &str) -> Self {
        DeviceSerial(s.to_string())
    }
}

/// Empty placeholder, only used to fill `StateReport::default()`.
impl Default for DeviceSerial {
    fn default() -> Self {
        DeviceSerial(String::new())
    }
}

/// Identifier of a site: the set of devices fetched together by one pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        SiteId(s.to_string())
    }
}

impl From<String> for SiteId {
    fn from(s: String) -> Self {
        SiteId(s)
    }
}

// =============================================================================
// HVAC Mode
// =============================================================================

/// Operating mode of a unit. `Off` doubles as the power-off command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HvacMode {
    #[default]
    Off,
    Heat,
    Cool,
    Auto,
    /// Fan only, no conditioning.
    Vent,
    /// Dehumidify.
    Dry,
}

impl HvacMode {
    /// Returns true if this mode implies the unit is powered on.
    pub fn is_powered(&self) -> bool {
        !matches!(self, HvacMode::Off)
    }
}

impl std::fmt::Display for HvacMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HvacMode::Off => write!(f, "off"),
            HvacMode::Heat => write!(f, "heat"),
            HvacMode::Cool => write!(f, "cool"),
            HvacMode::Auto => write!(f, "auto"),
            HvacMode::Vent => write!(f, "vent"),
            HvacMode::Dry => write!(f, "dry"),
        }
    }
}

impl std::str::FromStr for HvacMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(HvacMode::Off),
            "heat" => Ok(HvacMode::Heat),
            "cool" => Ok(HvacMode::Cool),
            "auto" => Ok(HvacMode::Auto),
            "vent" | "fan" => Ok(HvacMode::Vent),
            "dry" => Ok(HvacMode::Dry),
            other => Err(ValidationError::UnknownMode(other.to_string())),
        }
    }
}

// =============================================================================
// Fan Speed
// =============================================================================

/// Fan speed setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanSpeed {
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanSpeed::Auto => write!(f, "auto"),
            FanSpeed::Low => write!(f, "low"),
            FanSpeed::Medium => write!(f, "medium"),
            FanSpeed::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for FanSpeed {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(FanSpeed::Auto),
            "low" => Ok(FanSpeed::Low),
            "medium" | "med" => Ok(FanSpeed::Medium),
            "high" => Ok(FanSpeed::High),
            other => Err(ValidationError::UnknownFanSpeed(other.to_string())),
        }
    }
}

// =============================================================================
// Update Channel
// =============================================================================

/// Which channel produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateChannel {
    /// Server-initiated event stream.
    Push,
    /// Client-initiated request/response fetch.
    Pull,
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateChannel::Push => write!(f, "push"),
            UpdateChannel::Pull => write!(f, "pull"),
        }
    }
}

// =============================================================================
// Device State
// =============================================================================

/// Immutable, validated snapshot of one unit.
///
/// `observed_at` is the local receipt instant; the remote API does not
/// provide a trustworthy server timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceState {
    pub power_on: bool,
    pub mode: HvacMode,
    /// Measured indoor temperature (°C). Always present.
    pub current_temperature: f64,
    pub heating_setpoint: f64,
    pub cooling_setpoint: f64,
    pub auto_setpoint: Option<f64>,
    pub fan_speed: FanSpeed,
    /// Relative humidity (%), only on units with the sensor fitted.
    pub humidity: Option<f64>,
    /// Wireless signal strength (dBm).
    pub signal_strength: Option<i16>,
    /// Whether the unit is reachable by the cloud.
    pub connected: bool,
    pub source_channel: UpdateChannel,
    pub observed_at: Instant,
}

// =============================================================================
// State Report
// =============================================================================

/// Raw snapshot delivered by a channel. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateReport {
    pub serial: DeviceSerial,
    pub power_on: Option<bool>,
    pub mode: Option<HvacMode>,
    pub current_temperature: Option<f64>,
    pub heating_setpoint: Option<f64>,
    pub cooling_setpoint: Option<f64>,
    pub auto_setpoint: Option<f64>,
    pub fan_speed: Option<FanSpeed>,
    pub humidity: Option<f64>,
    pub signal_strength: Option<i16>,
    pub connected: Option<bool>,
}

impl StateReport {
    /// Creates an empty report for a serial.
    pub fn new(serial: DeviceSerial) -> Self {
        StateReport {
            serial,
            ..Default::default()
        }
    }

    /// Resolves this report against the prior stored state.
    ///
    /// Fails with [`ValidationError::MissingTemperature`] if the report has
    /// no finite measured temperature, regardless of what the prior state
    /// holds.
    pub fn resolve(
        &self,
        prior: Option<&DeviceState>,
        channel: UpdateChannel,
        observed_at: Instant,
    ) -> Result<DeviceState, ValidationError> {
        let current_temperature = require_temperature(self)?;

        let mode = self
            .mode
            .or(prior.map(|p| p.mode))
            .unwrap_or_default();

        let power_on = match (self.power_on, self.mode) {
            (Some(power), _) => power,
            (None, Some(mode)) => mode.is_powered(),
            (None, None) => prior.map(|p| p.power_on).unwrap_or(false),
        };

        // Optional sensors: a full pull snapshot is authoritative about
        // presence, a push frame may simply omit unchanged fields.
        let sensor = |incoming: Option<f64>, previous: Option<f64>| match channel {
            UpdateChannel::Pull => finite(incoming),
            UpdateChannel::Push => finite(incoming).or(previous),
        };

        Ok(DeviceState {
            power_on,
            mode,
            current_temperature,
            heating_setpoint: finite(self.heating_setpoint)
                .or(prior.map(|p| p.heating_setpoint))
                .unwrap_or(DEFAULT_HEATING_SETPOINT),
            cooling_setpoint: finite(self.cooling_setpoint)
                .or(prior.map(|p| p.cooling_setpoint))
                .unwrap_or(DEFAULT_COOLING_SETPOINT),
            auto_setpoint: sensor(self.auto_setpoint, prior.and_then(|p| p.auto_setpoint)),
            fan_speed: self
                .fan_speed
                .or(prior.map(|p| p.fan_speed))
                .unwrap_or_default(),
            humidity: sensor(self.humidity, prior.and_then(|p| p.humidity)),
            signal_strength: match channel {
                UpdateChannel::Pull => self.signal_strength,
                UpdateChannel::Push => self
                    .signal_strength
                    .or(prior.and_then(|p| p.signal_strength)),
            },
            connected: self
                .connected
                .or(prior.map(|p| p.connected))
                .unwrap_or(true),
            source_channel: channel,
            observed_at,
        })
    }
}
