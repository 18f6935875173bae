//! # Remote State Source
//!
//! The capability the controller needs from the cloud: read state, write
//! commands. Pull traffic and commands both go through this trait; push
//! traffic arrives separately as [`crate::push::PushEvent`]s.
//!
//! ```text
//! ┌──────────────────┐        ┌──────────────────────────┐
//! │  SyncController  │──────► │ dyn RemoteStateSource    │
//! └──────────────────┘        │  ├── HttpStateSource     │  (pull.rs)
//!                             │  └── MockStateSource     │  (mock.rs)
//!                             └──────────────────────────┘
//! ```

use async_trait::async_trait;

use hvac_core::{DeviceCommand, DeviceSerial, SiteId, StateReport};

use crate::error::SyncResult;

/// Result of a conditional collection fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// Fresh collection. `reports` may legitimately be empty.
    Updated {
        reports: Vec<StateReport>,
        etag: Option<String>,
    },
    /// Remote confirmed nothing changed since `etag`.
    Unchanged,
}

impl PullOutcome {
    /// Number of reports carried (zero for `Unchanged`).
    pub fn len(&self) -> usize {
        match self {
            PullOutcome::Updated { reports, .. } => reports.len(),
            PullOutcome::Unchanged => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read/write access to remote device state.
#[async_trait]
pub trait RemoteStateSource: Send + Sync {
    /// Fetches every device of a site. When `etag` is given the remote may
    /// answer [`PullOutcome::Unchanged`].
    async fn fetch_collection(&self, site: &SiteId, etag: Option<&str>)
        -> SyncResult<PullOutcome>;

    /// Fetches one device.
    async fn fetch_device(&self, serial: &DeviceSerial) -> SyncResult<StateReport>;

    /// Sends a partial command. Never retried by the caller.
    async fn send_command(&self, serial: &DeviceSerial, command: &DeviceCommand)
        -> SyncResult<()>;
}
