//! # hvac-sync: Dual-Channel Sync Engine
//!
//! Keeps a local view of networked thermostats consistent with a cloud
//! service. State arrives over two channels: a push WebSocket that is
//! preferred while healthy, and a pull fallback that polls each site.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Controller Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncController (Main Orchestrator)               │  │
//! │  │                                                                  │  │
//! │  │  Owns the pull timers, the health monitor and the state store   │  │
//! │  │  Switches pull cadence when push health changes                 │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  PushChannel   │  │ HttpState      │  │  DeviceStateStore      │    │
//! │  │                │  │ Source         │  │                        │    │
//! │  │ WebSocket with │  │ Conditional    │  │ Latest state per       │    │
//! │  │ auto-reconnect │  │ site pulls,    │  │ device, tagged with    │    │
//! │  │ & backoff      │  │ commands       │  │ remote/commanded       │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ChannelHealth  │  │  TokenSession  │  │    PollScheduler       │    │
//! │  │ Monitor        │  │                │  │                        │    │
//! │  │ edge-triggered │  │ single-flight  │  │ one timer per site     │    │
//! │  │ + liveness     │  │ token renewal  │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`controller`] - Main `SyncController` orchestrator
//! - [`config`] - Sync configuration (endpoints, intervals, exclusions)
//! - [`error`] - Sync error types
//! - [`health`] - Push channel health state machine
//! - [`mock`] - Recording test doubles
//! - [`protocol`] - Wire types for HTTP and WebSocket payloads
//! - [`pull`] - HTTP client and pull adapter
//! - [`push`] - WebSocket push channel with reconnection
//! - [`scheduler`] - Per-site pull timers
//! - [`session`] - Bearer token session
//! - [`source`] - Remote state capability trait
//! - [`store`] - Device state store with race resolution
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hvac_sync::{SyncConfig, SyncController};
//!
//! let config = SyncConfig::load_or_default(None);
//! let controller = SyncController::launch(config).await?;
//!
//! controller.register_device(serial.clone(), site).await?;
//! controller.issue_command(&serial, DeviceCommand::new().with_mode(HvacMode::Cool)).await?;
//! let state = controller.latest_state(&serial).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod mock;
pub mod protocol;
pub mod pull;
pub mod push;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    ApiSettings, CommandSettings, DeviceSettings, PollingSettings, PushSettings, SyncConfig,
};
pub use controller::{ApplyCounts, Device, PullSummary, SyncController};
pub use error::{SyncError, SyncResult};
pub use health::{
    ChannelHealth, ChannelHealthMonitor, HealthChange, HealthListener, HealthSnapshot, Liveness,
};
pub use protocol::PushMessage;
pub use pull::{CloudClient, HttpStateSource};
pub use push::{
    ConnectionState, DisconnectReason, PushChannel, PushConfig, PushControl, PushEvent, PushHandle,
};
pub use scheduler::PollScheduler;
pub use session::{AuthBackend, HttpAuthBackend, TokenGrant, TokenInfo, TokenSession};
pub use source::{PullOutcome, RemoteStateSource};
pub use store::{
    ApplyKind, ApplyOutcome, DeviceListener, DeviceStateStore, DeviceUpdate, StateOrigin,
    StoredState,
};
