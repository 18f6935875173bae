//! # Device State Store
//!
//! Latest known state per device, plus the origin of that state. Both
//! channels funnel into [`DeviceStateStore::apply_report`]; the command path
//! writes through [`DeviceStateStore::apply_optimistic`].
//!
//! ## Race Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Remote vs Commanded State                           │
//! │                                                                         │
//! │  stored origin      incoming                  result                   │
//! │  ─────────────      ────────                  ──────                   │
//! │  Remote             any valid report          replace                  │
//! │  Commanded{at}      observed, now-at < grace  merge (keep commanded    │
//! │                                               fields, refresh others)  │
//! │  Commanded{at}      observed, requested < at  merge (stale snapshot)   │
//! │  Commanded{at}      observed, otherwise       replace, origin=Remote   │
//! │  Commanded{at}      confirmation re-fetch     replace, origin=Remote   │
//! │  any                no current temperature    rejected, unchanged      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each apply is one whole-value replace under the write lock. Listeners
//! are called after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use hvac_core::{
    CommandFields, DeviceCommand, DeviceSerial, DeviceState, StateReport, UpdateChannel,
    ValidationError,
};

/// Current instant from the runtime clock, so paused-clock tests see
/// consistent timestamps.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Where the stored state came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateOrigin {
    /// Observed from the remote service.
    Remote,
    /// Written locally by a successful command.
    Commanded { at: Instant, fields: CommandFields },
}

/// How an incoming report should be treated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyKind {
    /// Regular pull or push snapshot. `requested_at` is when the fetch was
    /// issued (receipt time for push).
    Observed { requested_at: Instant },
    /// Re-fetch scheduled by the command path. Authoritative.
    Confirmation,
}

/// Result of applying one report.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Stored state replaced.
    Applied,
    /// Merged field-by-field around commanded fields.
    Merged,
    /// Report failed validation; store unchanged.
    Rejected(ValidationError),
}

/// One stored entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredState {
    pub state: DeviceState,
    pub origin: StateOrigin,
}

/// Broadcast payload for every stored change.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub serial: DeviceSerial,
    pub state: DeviceState,
}

/// Per-device change callback.
pub type DeviceListener = Arc<dyn Fn(&DeviceState) + Send + Sync>;

/// Latest state per device.
pub struct DeviceStateStore {
    entries: RwLock<HashMap<DeviceSerial, StoredState>>,
    listeners: std::sync::RwLock<HashMap<DeviceSerial, Vec<DeviceListener>>>,
    updates: broadcast::Sender<DeviceUpdate>,
    grace: Duration,
}

impl DeviceStateStore {
    /// Creates a store with the given optimistic grace window.
    pub fn new(grace: Duration) -> Self {
        let (updates, _) = broadcast::channel(256);
        DeviceStateStore {
            entries: RwLock::new(HashMap::new()),
            listeners: std::sync::RwLock::new(HashMap::new()),
            updates,
            grace,
        }
    }

    /// Applies a snapshot from either channel.
    pub async fn apply_report(
        &self,
        report: &StateReport,
        channel: UpdateChannel,
        kind: ApplyKind,
    ) -> ApplyOutcome {
        let observed_at = now();
        let serial = report.serial.clone();

        let (state, outcome) = {
            let mut entries = self.entries.write().await;
            let prior = entries.get(&serial).copied();

            let resolved = match report.resolve(prior.as_ref().map(|p| &p.state), channel, observed_at)
            {
                Ok(state) => state,
                Err(e) => {
                    warn!(serial = %serial, channel = %channel, error = %e, "Discarding snapshot");
                    return ApplyOutcome::Rejected(e);
                }
            };

            let merged = match (prior, kind) {
                (
                    Some(StoredState {
                        state: previous,
                        origin: StateOrigin::Commanded { at, fields },
                    }),
                    ApplyKind::Observed { requested_at },
                ) if observed_at.saturating_duration_since(at) < self.grace
                    || requested_at < at =>
                {
                    Some(StoredState {
                        state: fields.preserve(&previous, resolved),
                        origin: StateOrigin::Commanded { at, fields },
                    })
                }
                _ => None,
            };

            let (entry, outcome) = match merged {
                Some(entry) => (entry, ApplyOutcome::Merged),
                None => (
                    StoredState {
                        state: resolved,
                        origin: StateOrigin::Remote,
                    },
                    ApplyOutcome::Applied,
                ),
            };
            entries.insert(serial.clone(), entry);
            (entry.state, outcome)
        };

        debug!(serial = %serial, channel = %channel, outcome = ?outcome, "Snapshot applied");
        self.notify(&serial, &state);
        outcome
    }

    /// Writes the expected result of a successful command. Returns the new
    /// state, or `None` if nothing is stored for the device yet.
    pub async fn apply_optimistic(
        &self,
        serial: &DeviceSerial,
        command: &DeviceCommand,
    ) -> Option<DeviceState> {
        let at = now();
        let state = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(serial)?;

            let fields = match entry.origin {
                StateOrigin::Commanded {
                    at: previous_at,
                    fields: previous,
                } if at.saturating_duration_since(previous_at) < self.grace => {
                    previous.union(command.fields())
                }
                _ => command.fields(),
            };

            entry.state = command.apply_to(&entry.state, at);
            entry.origin = StateOrigin::Commanded { at, fields };
            entry.state
        };

        debug!(serial = %serial, "Optimistic state applied");
        self.notify(serial, &state);
        Some(state)
    }

    pub async fn latest(&self, serial: &DeviceSerial) -> Option<DeviceState> {
        self.entries.read().await.get(serial).map(|e| e.state)
    }

    pub async fn entry(&self, serial: &DeviceSerial) -> Option<StoredState> {
        self.entries.read().await.get(serial).copied()
    }

    /// Drops the stored state for a device.
    pub async fn remove(&self, serial: &DeviceSerial) -> Option<DeviceState> {
        self.entries.write().await.remove(serial).map(|e| e.state)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Registers a callback for one device.
    pub fn on_device_updated(&self, serial: DeviceSerial, listener: DeviceListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(serial)
            .or_default()
            .push(listener);
    }

    /// Subscribes to every stored change.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, serial: &DeviceSerial, state: &DeviceState) {
        let listeners: Vec<DeviceListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(state);
        }

        // No subscribers is fine.
        let _ = self.updates.send(DeviceUpdate {
            serial: serial.clone(),
            state: *state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvac_core::{FanSpeed, HvacMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report(serial: &str, temp: Option<f64>, mode: HvacMode, heat: f64) -> StateReport {
        StateReport {
            current_temperature: temp,
            mode: Some(mode),
            heating_setpoint: Some(heat),
            fan_speed: Some(FanSpeed::Low),
            ..StateReport::new(DeviceSerial::from(serial))
        }
    }

    fn observed() -> ApplyKind {
        ApplyKind::Observed {
            requested_at: now(),
        }
    }

    #[tokio::test]
    async fn test_apply_and_read() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let outcome = store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        assert_eq!(outcome, ApplyOutcome::Applied);
        let state = store.latest(&DeviceSerial::from("D1")).await.unwrap();
        assert_eq!(state.mode, HvacMode::Heat);
        assert_eq!(state.source_channel, UpdateChannel::Pull);
    }

    #[tokio::test]
    async fn test_missing_temperature_keeps_prior() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D2");
        store
            .apply_report(&report("D2", Some(19.0), HvacMode::Off, 20.0), UpdateChannel::Pull, observed())
            .await;
        let before = store.latest(&serial).await.unwrap();

        let outcome = store
            .apply_report(&report("D2", None, HvacMode::Heat, 23.0), UpdateChannel::Push, observed())
            .await;

        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
        assert_eq!(store.latest(&serial).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_rejected_snapshot_never_creates_entry() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        store
            .apply_report(&report("D3", None, HvacMode::Heat, 20.0), UpdateChannel::Pull, observed())
            .await;
        assert!(store.latest(&DeviceSerial::from("D3")).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_within_grace_keeps_commanded_fields() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_mode(HvacMode::Cool))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let outcome = store
            .apply_report(&report("D1", Some(22.4), HvacMode::Heat, 18.0), UpdateChannel::Push, observed())
            .await;

        assert_eq!(outcome, ApplyOutcome::Merged);
        let state = store.latest(&serial).await.unwrap();
        assert_eq!(state.mode, HvacMode::Cool);
        assert!(state.power_on);
        assert_eq!(state.current_temperature, 22.4);
        assert_eq!(state.heating_setpoint, 18.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_request_merges_after_grace() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        let requested_at = now();
        tokio::time::advance(Duration::from_millis(100)).await;
        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_heating_setpoint(24.0))
            .await;

        // The response to the earlier request arrives long after the window.
        tokio::time::advance(Duration::from_secs(5)).await;
        let outcome = store
            .apply_report(
                &report("D1", Some(21.0), HvacMode::Heat, 22.0),
                UpdateChannel::Pull,
                ApplyKind::Observed { requested_at },
            )
            .await;

        assert_eq!(outcome, ApplyOutcome::Merged);
        let state = store.latest(&serial).await.unwrap();
        assert_eq!(state.heating_setpoint, 24.0);
        assert_eq!(state.current_temperature, 21.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_report_after_grace_replaces() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;
        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_mode(HvacMode::Cool))
            .await;

        tokio::time::advance(Duration::from_secs(3)).await;
        let outcome = store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        assert_eq!(outcome, ApplyOutcome::Applied);
        let entry = store.entry(&serial).await.unwrap();
        assert_eq!(entry.state.mode, HvacMode::Heat);
        assert_eq!(entry.origin, StateOrigin::Remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_is_authoritative() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;
        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_mode(HvacMode::Cool))
            .await;

        let outcome = store
            .apply_report(
                &report("D1", Some(21.5), HvacMode::Auto, 22.0),
                UpdateChannel::Pull,
                ApplyKind::Confirmation,
            )
            .await;

        assert_eq!(outcome, ApplyOutcome::Applied);
        let entry = store.entry(&serial).await.unwrap();
        assert_eq!(entry.state.mode, HvacMode::Auto);
        assert_eq!(entry.origin, StateOrigin::Remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_commands_union_fields() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_mode(HvacMode::Cool))
            .await;
        tokio::time::advance(Duration::from_millis(300)).await;
        store
            .apply_optimistic(&serial, &DeviceCommand::new().with_fan_speed(FanSpeed::High))
            .await;

        match store.entry(&serial).await.unwrap().origin {
            StateOrigin::Commanded { fields, .. } => {
                assert!(fields.power_mode);
                assert!(fields.fan_speed);
                assert!(!fields.heating_setpoint);
            }
            other => panic!("unexpected origin: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_optimistic_without_prior_is_skipped() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let result = store
            .apply_optimistic(&DeviceSerial::from("D9"), &DeviceCommand::power_off())
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_listeners_and_broadcast() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.on_device_updated(
            DeviceSerial::from("D1"),
            Arc::new(move |_: &DeviceState| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut updates = store.subscribe();

        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;
        store
            .apply_report(&report("D2", Some(19.0), HvacMode::Off, 20.0), UpdateChannel::Pull, observed())
            .await;
        store
            .apply_report(&report("D1", None, HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(updates.recv().await.unwrap().serial, DeviceSerial::from("D1"));
        assert_eq!(updates.recv().await.unwrap().serial, DeviceSerial::from("D2"));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_drops_state() {
        let store = DeviceStateStore::new(Duration::from_secs(2));
        let serial = DeviceSerial::from("D1");
        store
            .apply_report(&report("D1", Some(21.5), HvacMode::Heat, 22.0), UpdateChannel::Pull, observed())
            .await;
        assert!(store.remove(&serial).await.is_some());
        assert!(store.latest(&serial).await.is_none());
    }
}
