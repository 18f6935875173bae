//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transient     │  │     Validation          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Timeout        │  │  Rejected (remote)      │ │
//! │  │  InvalidUrl     │  │  Connection     │  │  Validation (local)     │ │
//! │  │  ConfigLoad/Save│  │  Http (5xx)     │  │                         │ │
//! │  └─────────────────┘  │  Disconnected   │  └─────────────────────────┘ │
//! │                       │  Malformed      │                              │
//! │  ┌─────────────────┐  └─────────────────┘  ┌─────────────────────────┐ │
//! │  │      Auth       │                       │      Internal           │ │
//! │  │                 │  ┌─────────────────┐  │                         │ │
//! │  │  AuthFailed     │  │  PushExhausted  │  │  UnknownDevice          │ │
//! │  │                 │  │  (never fatal)  │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  │  ShuttingDown           │ │
//! │                                            └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient failures are never retried in place; the next scheduled pull
//! or reconnect attempt is the retry.

use hvac_core::ValidationError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// Neither token refresh nor full login produced a usable token.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Request or connect timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Failed to reach the remote service.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote answered with a non-success status that is not a rejection.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response body could not be understood.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Push connection dropped unexpectedly.
    #[error("Disconnected from push service")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The push channel used up its reconnect budget.
    #[error("Push channel gave up after {attempts} reconnect attempts")]
    PushExhausted { attempts: u32 },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// The remote service refused a request (400/409/422).
    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Local validation failed before anything was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid API or push URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Serial is not registered with the controller, or is excluded.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Controller is shutting down.
    #[error("Sync controller is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl SyncError {
    /// Classifies a reqwest failure. `timeout_secs` is the client timeout
    /// that was in force for the request.
    pub fn from_http(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(timeout_secs)
        } else if err.is_connect() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_decode() || err.is_body() {
            SyncError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            WsError::Http(response) if response.status().as_u16() == 401 => {
                SyncError::AuthFailed("push endpoint refused the access token".into())
            }
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the next scheduled pull or reconnect may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::MalformedResponse(_)
                | SyncError::Http { .. }
        )
    }

    /// Returns true if no usable token could be obtained.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::AuthFailed(_))
    }

    /// Returns true if the request itself was at fault, locally or remotely.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, SyncError::Rejected { .. } | SyncError::Validation(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
