//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HVAC_API_URL=https://cloud.example/api                             │
//! │     HVAC_DEGRADED_INTERVAL=15                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/hvac-sync/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/io.hvac.hvac-sync/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │                                                                         │
//! │  Then: interval bounds are clamped (with a warning), and the result    │
//! │  is validated.                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! debug = false
//!
//! [api]
//! base_url = "https://cloud.example/api"
//! push_url = "wss://cloud.example/push"
//! username = "installer@example.com"
//! password = "..."
//!
//! [polling]
//! normal_interval_secs = 60
//! degraded_interval_secs = 10
//! health_check_interval_secs = 30
//! pull_disabled_when_healthy = false
//!
//! [push]
//! max_reconnect_attempts = 5
//!
//! [commands]
//! confirmation_delay_ms = 1000
//! optimistic_grace_ms = 2000
//!
//! [devices]
//! exclude = ["ZX-0042"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use hvac_core::DeviceSerial;

use crate::error::{SyncError, SyncResult};

/// Lower bound for the normal pull interval (seconds).
pub const MIN_NORMAL_INTERVAL_SECS: u64 = 5;
/// Bounds for the degraded pull interval (seconds).
pub const DEGRADED_INTERVAL_BOUNDS: (u64, u64) = (5, 60);
/// Bounds for the health-check interval (seconds).
pub const HEALTH_CHECK_INTERVAL_BOUNDS: (u64, u64) = (10, 300);

// =============================================================================
// API Settings
// =============================================================================

/// Remote service endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL for REST calls (pull, commands, token endpoint).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// WebSocket URL of the push service.
    #[serde(default = "default_push_url")]
    pub push_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Client identifier sent with token requests.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Upper bound for every REST call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_push_url() -> String {
    "ws://localhost:8080/push".to_string()
}

fn default_client_name() -> String {
    "hvac-sync".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: default_base_url(),
            push_url: default_push_url(),
            username: String::new(),
            password: String::new(),
            client_name: default_client_name(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Polling Settings
// =============================================================================

/// Pull cadence and channel health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Pull interval while push is healthy (seconds, min 5).
    #[serde(default = "default_normal_interval")]
    pub normal_interval_secs: u64,

    /// Pull interval while push is unhealthy (seconds, 5..=60).
    #[serde(default = "default_degraded_interval")]
    pub degraded_interval_secs: u64,

    /// Push liveness check interval (seconds, 10..=300).
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Stop pulling entirely while push is healthy.
    #[serde(default)]
    pub pull_disabled_when_healthy: bool,
}

fn default_normal_interval() -> u64 {
    60
}

fn default_degraded_interval() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    30
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            normal_interval_secs: default_normal_interval(),
            degraded_interval_secs: default_degraded_interval(),
            health_check_interval_secs: default_health_check_interval(),
            pull_disabled_when_healthy: false,
        }
    }
}

// =============================================================================
// Push Settings
// =============================================================================

/// Reconnect and keepalive settings for the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSettings {
    /// Reconnect attempts before the channel is declared exhausted.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// How long to wait for a pong before treating the link as dead.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}
fn default_pong_timeout() -> u64 {
    10
}

impl Default for PushSettings {
    fn default() -> Self {
        PushSettings {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

// =============================================================================
// Command Settings
// =============================================================================

/// Timing of the command path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Delay before the confirmation re-fetch (milliseconds).
    #[serde(default = "default_confirmation_delay")]
    pub confirmation_delay_ms: u64,

    /// Window during which remote state cannot overwrite commanded fields
    /// (milliseconds).
    #[serde(default = "default_optimistic_grace")]
    pub optimistic_grace_ms: u64,
}

fn default_confirmation_delay() -> u64 {
    1000
}

fn default_optimistic_grace() -> u64 {
    2000
}

impl Default for CommandSettings {
    fn default() -> Self {
        CommandSettings {
            confirmation_delay_ms: default_confirmation_delay(),
            optimistic_grace_ms: default_optimistic_grace(),
        }
    }
}

// =============================================================================
// Device Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Serials that are never tracked.
    #[serde(default)]
    pub exclude: Vec<String>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Verbose logging of payloads and per-device apply outcomes.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub push: PushSettings,

    #[serde(default)]
    pub commands: CommandSettings,

    #[serde(default)]
    pub devices: DeviceSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    ///
    /// Out-of-range intervals are clamped, then the result is validated.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file. The password is never written.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Clamps the intervals, then validates what is left.
    pub fn prepare(mut self) -> SyncResult<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let base = url::Url::parse(&self.api.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        let push = url::Url::parse(&self.api.push_url)?;
        if !matches!(push.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Push URL must start with ws:// or wss://, got: {}",
                self.api.push_url
            )));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.push.connect_timeout_secs == 0 || self.push.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "push timeouts must be greater than 0".into(),
            ));
        }

        let (lo, hi) = DEGRADED_INTERVAL_BOUNDS;
        if !(lo..=hi).contains(&self.polling.degraded_interval_secs) {
            return Err(SyncError::InvalidConfig(format!(
                "degraded_interval_secs must be within {}..={}",
                lo, hi
            )));
        }
        if self.polling.normal_interval_secs < MIN_NORMAL_INTERVAL_SECS {
            return Err(SyncError::InvalidConfig(format!(
                "normal_interval_secs must be at least {}",
                MIN_NORMAL_INTERVAL_SECS
            )));
        }

        Ok(())
    }

    /// Clamps interval settings into their allowed ranges.
    pub fn normalize(&mut self) {
        let polling = &mut self.polling;

        if polling.normal_interval_secs < MIN_NORMAL_INTERVAL_SECS {
            warn!(
                configured = polling.normal_interval_secs,
                applied = MIN_NORMAL_INTERVAL_SECS,
                "Normal pull interval below minimum, clamping"
            );
            polling.normal_interval_secs = MIN_NORMAL_INTERVAL_SECS;
        }

        let (lo, hi) = DEGRADED_INTERVAL_BOUNDS;
        let clamped = polling.degraded_interval_secs.clamp(lo, hi);
        if clamped != polling.degraded_interval_secs {
            warn!(
                configured = polling.degraded_interval_secs,
                applied = clamped,
                "Degraded pull interval out of range, clamping"
            );
            polling.degraded_interval_secs = clamped;
        }

        let (lo, hi) = HEALTH_CHECK_INTERVAL_BOUNDS;
        let clamped = polling.health_check_interval_secs.clamp(lo, hi);
        if clamped != polling.health_check_interval_secs {
            warn!(
                configured = polling.health_check_interval_secs,
                applied = clamped,
                "Health check interval out of range, clamping"
            );
            polling.health_check_interval_secs = clamped;
        }
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Unparseable values are logged
    /// and ignored.
    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HVAC_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Some(url) = lookup("HVAC_PUSH_URL") {
            debug!(url = %url, "Overriding push URL from environment");
            self.api.push_url = url;
        }

        if let Some(username) = lookup("HVAC_USERNAME") {
            self.api.username = username;
        }

        if let Some(password) = lookup("HVAC_PASSWORD") {
            self.api.password = password;
        }

        if let Some(value) = lookup("HVAC_NORMAL_INTERVAL") {
            match value.parse::<u64>() {
                Ok(secs) => self.polling.normal_interval_secs = secs,
                Err(_) => warn!(value = %value, "Invalid HVAC_NORMAL_INTERVAL in environment"),
            }
        }

        if let Some(value) = lookup("HVAC_DEGRADED_INTERVAL") {
            match value.parse::<u64>() {
                Ok(secs) => self.polling.degraded_interval_secs = secs,
                Err(_) => warn!(value = %value, "Invalid HVAC_DEGRADED_INTERVAL in environment"),
            }
        }

        if let Some(value) = lookup("HVAC_PULL_DISABLED_WHEN_HEALTHY") {
            match parse_flag(&value) {
                Some(flag) => self.polling.pull_disabled_when_healthy = flag,
                None => warn!(
                    value = %value,
                    "Invalid HVAC_PULL_DISABLED_WHEN_HEALTHY in environment"
                ),
            }
        }

        if let Some(value) = lookup("HVAC_DEBUG") {
            if let Some(flag) = parse_flag(&value) {
                self.debug = flag;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "hvac", "hvac-sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// `EnvFilter` directive a host should install for this config.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "hvac_sync=debug,hvac_core=debug,info"
        } else {
            "info"
        }
    }

    pub fn normal_interval(&self) -> Duration {
        Duration::from_secs(self.polling.normal_interval_secs)
    }

    pub fn degraded_interval(&self) -> Duration {
        Duration::from_secs(self.polling.degraded_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.polling.health_check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn confirmation_delay(&self) -> Duration {
        Duration::from_millis(self.commands.confirmation_delay_ms)
    }

    pub fn optimistic_grace(&self) -> Duration {
        Duration::from_millis(self.commands.optimistic_grace_ms)
    }

    /// Returns true if the serial is on the exclusion list.
    pub fn is_excluded(&self, serial: &DeviceSerial) -> bool {
        self.devices
            .exclude
            .iter()
            .any(|excluded| excluded == serial.as_str())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
