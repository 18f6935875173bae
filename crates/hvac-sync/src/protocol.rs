//! # Wire Protocol
//!
//! JSON payloads exchanged with the cloud service, over REST (pull channel,
//! commands, token endpoint) and over the push WebSocket.
//!
//! ## Message Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cloud Wire Messages                              │
//! │                                                                         │
//! │  REST (pull channel)                                                   │
//! │  ───────────────────                                                   │
//! │  GET  /sites/{site}/devices/state ──► { "devices": [WireDeviceState] } │
//! │  GET  /devices/{serial}/state     ──► WireDeviceState                  │
//! │  POST /devices/{serial}/commands  ◄── CommandRequest                   │
//! │  POST /oauth/token                ◄── TokenRequest ──► TokenResponse   │
//! │                                                                         │
//! │  WebSocket (push channel)                                              │
//! │  ────────────────────────                                              │
//! │  client ───► Subscribe { requestId, serials }                          │
//! │  server ───► Subscribed { requestId, serials }                         │
//! │  server ───► StateUpdate { serial, indoorTemp, ... }                   │
//! │  both   ◄──► Ping / Pong { timestamp }                                 │
//! │  server ───► Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "StateUpdate", "payload": { "serial": "ZX-1", "indoorTemp": 21.5 } }
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use hvac_core::{
    DeviceCommand, DeviceSerial, FanSpeed, HvacMode, StateReport, ValidationError,
};

// =============================================================================
// Device State
// =============================================================================

/// Device snapshot as the cloud serializes it. Every field but the serial
/// may be missing or null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDeviceState {
    pub serial: String,

    #[serde(default)]
    pub power: Option<bool>,

    /// Mode string; unknown values are dropped rather than failing the
    /// whole collection.
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub indoor_temp: Option<f64>,

    #[serde(default)]
    pub heat_setpoint: Option<f64>,

    #[serde(default)]
    pub cool_setpoint: Option<f64>,

    #[serde(default)]
    pub auto_setpoint: Option<f64>,

    #[serde(default)]
    pub fan_speed: Option<String>,

    #[serde(default)]
    pub humidity: Option<f64>,

    /// Signal strength (dBm).
    #[serde(default)]
    pub rssi: Option<i16>,

    #[serde(default)]
    pub online: Option<bool>,
}

impl WireDeviceState {
    /// Converts into a domain report.
    pub fn into_report(self) -> Result<StateReport, ValidationError> {
        let serial = DeviceSerial::new(self.serial)?;

        let mode = self.mode.as_deref().and_then(|m| match m.parse::<HvacMode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                debug!(serial = %serial, error = %e, "Ignoring unknown mode in payload");
                None
            }
        });
        let fan_speed = self
            .fan_speed
            .as_deref()
            .and_then(|f| match f.parse::<FanSpeed>() {
                Ok(speed) => Some(speed),
                Err(e) => {
                    debug!(serial = %serial, error = %e, "Ignoring unknown fan speed in payload");
                    None
                }
            });

        Ok(StateReport {
            serial,
            power_on: self.power,
            mode,
            current_temperature: self.indoor_temp,
            heating_setpoint: self.heat_setpoint,
            cooling_setpoint: self.cool_setpoint,
            auto_setpoint: self.auto_setpoint,
            fan_speed,
            humidity: self.humidity,
            signal_strength: self.rssi,
            connected: self.online,
        })
    }
}

/// Body of the site collection endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionResponse {
    #[serde(default)]
    pub devices: Vec<WireDeviceState>,
}

// =============================================================================
// Commands
// =============================================================================

/// Partial command body. Absent fields are not sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<HvacMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heat_setpoint: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cool_setpoint: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<FanSpeed>,
}

impl From<&DeviceCommand> for CommandRequest {
    fn from(command: &DeviceCommand) -> Self {
        CommandRequest {
            power: command.mode.map(|m| m.is_powered()),
            mode: command.mode,
            heat_setpoint: command.heating_setpoint,
            cool_setpoint: command.cooling_setpoint,
            fan_speed: command.fan_speed,
        }
    }
}

// =============================================================================
// Token Endpoint
// =============================================================================

/// OAuth-style token request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum TokenRequest {
    Password {
        username: String,
        password: String,
        client_id: String,
    },
    RefreshToken {
        refresh_token: String,
        client_id: String,
    },
}

/// OAuth-style token response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

// =============================================================================
// Push Messages
// =============================================================================

/// Messages on the push WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PushMessage {
    /// Subscribe to updates for a set of serials.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        request_id: String,
        serials: Vec<String>,
    },

    /// Server acknowledgement of a subscription.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        request_id: String,
        #[serde(default)]
        serials: Vec<String>,
    },

    /// State change for one device. May be partial.
    StateUpdate(WireDeviceState),

    /// Application-level keepalive.
    Ping { timestamp: String },

    Pong { timestamp: String },

    Error { code: String, message: String },
}

impl PushMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            PushMessage::Subscribe { .. } => "Subscribe",
            PushMessage::Subscribed { .. } => "Subscribed",
            PushMessage::StateUpdate(_) => "StateUpdate",
            PushMessage::Ping { .. } => "Ping",
            PushMessage::Pong { .. } => "Pong",
            PushMessage::Error { .. } => "Error",
        }
    }

    /// Creates a subscribe request with a fresh request id.
    pub fn subscribe<'a>(serials: impl IntoIterator<Item = &'a DeviceSerial>) -> Self {
        PushMessage::Subscribe {
            request_id: uuid::Uuid::new_v4().to_string(),
            serials: serials.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn pong(timestamp: &str) -> Self {
        PushMessage::Pong {
            timestamp: timestamp.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
