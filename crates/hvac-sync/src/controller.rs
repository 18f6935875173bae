//! # Sync Controller
//!
//! Main orchestrator for the sync engine. Decides which channel is
//! authoritative, re-arms pull loops when push health changes, applies
//! incoming snapshots, and runs the command path.
//!
//! ## Controller Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SyncController Architecture                        │
//! │                                                                         │
//! │   mpsc<PushEvent> ──┐                                                   │
//! │                     ▼                                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      controller loop                             │  │
//! │  │                                                                  │  │
//! │  │  • PushEvent ─► ChannelHealthMonitor ─► (listener enqueues       │  │
//! │  │                                          HealthChanged)          │  │
//! │  │  • PushEvent::Update ─► DeviceStateStore                         │  │
//! │  │  • HealthChanged ─► reconcile pull loops                         │  │
//! │  │  • liveness tick ─► reconnect exhausted / silent push            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ PollScheduler  │  │ RemoteState    │  │   DeviceStateStore     │    │
//! │  │ one timer per  │─►│ Source         │─►│   latest state +       │    │
//! │  │ site           │  │ (pull, cmds)   │  │   origin per device    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  PULL MODE:                                                            │
//! │  ──────────                                                            │
//! │  healthy   + pull_disabled_when_healthy  → no pull loops               │
//! │  healthy   + !pull_disabled_when_healthy → normal interval             │
//! │  unhealthy                               → degraded interval           │
//! │  every mode change re-arms with one immediate pull                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hvac_core::{
    validate_command, DeviceCommand, DeviceSerial, DeviceState, SiteId, StateReport,
    UpdateChannel,
};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::health::{ChannelHealth, ChannelHealthMonitor, HealthListener, HealthSnapshot, Liveness};
use crate::pull::{CloudClient, HttpStateSource};
use crate::push::{PushChannel, PushConfig, PushControl, PushEvent};
use crate::scheduler::{PollScheduler, TickFn};
use crate::session::{HttpAuthBackend, TokenSession};
use crate::source::{PullOutcome, RemoteStateSource};
use crate::store::{self, ApplyKind, ApplyOutcome, DeviceListener, DeviceStateStore, DeviceUpdate};

/// A healthy channel silent for this many health-check intervals is stale.
const STALE_AFTER_CHECKS: u32 = 3;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Public Types
// =============================================================================

/// A tracked device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub serial: DeviceSerial,
    pub site_id: SiteId,
    /// Push subscription was accepted.
    pub subscribed: bool,
}

/// Per-report results of one collection pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyCounts {
    pub applied: usize,
    pub merged: usize,
    pub rejected: usize,
    /// Reports for serials that are not registered or are excluded.
    pub ignored: usize,
}

/// What a pull did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullSummary {
    Updated(ApplyCounts),
    /// Remote answered "not modified"; nothing was applied.
    Unchanged,
    /// Another pull for the site was still running.
    Skipped,
}

// =============================================================================
// Internal State
// =============================================================================

enum ControllerEvent {
    HealthChanged(ChannelHealth),
    Shutdown,
}

#[derive(Default)]
struct SiteEntry {
    members: BTreeSet<DeviceSerial>,
    etag: Option<String>,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceSerial, Device>,
    sites: HashMap<SiteId, SiteEntry>,
}

impl Registry {
    fn active_sites(&self) -> Vec<SiteId> {
        self.sites
            .iter()
            .filter(|(_, entry)| !entry.members.is_empty())
            .map(|(site, _)| site.clone())
            .collect()
    }

    /// Drops `serial` from its site. Returns the site if it became empty.
    fn leave_site(&mut self, serial: &DeviceSerial, site: &SiteId) -> Option<SiteId> {
        let entry = self.sites.get_mut(site)?;
        entry.members.remove(serial);
        if entry.members.is_empty() {
            self.sites.remove(site);
            return Some(site.clone());
        }
        None
    }
}

/// Clears a site's in-flight flag when the pull finishes.
struct InFlight<'a> {
    sites: &'a Mutex<HashSet<SiteId>>,
    site: SiteId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        locked(self.sites).remove(&self.site);
    }
}

struct Inner {
    config: SyncConfig,
    source: Arc<dyn RemoteStateSource>,
    push: Arc<dyn PushControl>,
    store: DeviceStateStore,
    registry: RwLock<Registry>,
    scheduler: Mutex<PollScheduler>,
    monitor: Mutex<ChannelHealthMonitor>,
    in_flight: Mutex<HashSet<SiteId>>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ControllerEvent>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

// =============================================================================
// Sync Controller
// =============================================================================

/// Dual-channel sync controller.
///
/// Cloning is cheap; clones drive the same controller.
///
/// ## Usage
/// ```rust,ignore
/// let controller = SyncController::new(config, source, push_handle);
/// controller.register_device(serial, site).await?;
/// controller.start(push_events).await?;
/// let state = controller.latest_state(&serial).await;
/// ```
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    /// Creates a controller. Nothing runs until [`SyncController::start`].
    pub fn new(
        mut config: SyncConfig,
        source: Arc<dyn RemoteStateSource>,
        push: Arc<dyn PushControl>,
    ) -> Self {
        config.normalize();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let (events_tx, events_rx) = mpsc::unbounded_channel();

            let tick_target = weak.clone();
            let on_tick: TickFn = Arc::new(move |site: SiteId| {
                if let Some(inner) = tick_target.upgrade() {
                    tokio::spawn(async move { inner.scheduled_pull(site).await });
                }
            });

            let stale_after = config.health_check_interval() * STALE_AFTER_CHECKS;
            let mut monitor = ChannelHealthMonitor::new(stale_after);
            let health_tx = events_tx.clone();
            monitor.on_health_changed(Arc::new(move |health: ChannelHealth| {
                // Loop gone means we are shutting down.
                let _ = health_tx.send(ControllerEvent::HealthChanged(health));
            }));

            Inner {
                store: DeviceStateStore::new(config.optimistic_grace()),
                config,
                source,
                push,
                registry: RwLock::new(Registry::default()),
                scheduler: Mutex::new(PollScheduler::new(on_tick)),
                monitor: Mutex::new(monitor),
                in_flight: Mutex::new(HashSet::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                loop_handle: Mutex::new(None),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }
        });

        SyncController { inner }
    }

    /// Wires the HTTP pull source and the WebSocket push channel from
    /// `config` and starts the controller.
    pub async fn launch(config: SyncConfig) -> SyncResult<Self> {
        let config = config.prepare()?;

        let backend = Arc::new(HttpAuthBackend::new(&config.api)?);
        let session = TokenSession::new(backend);
        let client = CloudClient::new(&config.api, session.clone())?;
        let source = Arc::new(HttpStateSource::new(client).with_debug(config.debug));

        let push_config = PushConfig::from_settings(&config.api, &config.push);
        let (push, push_events) = PushChannel::spawn(push_config, Some(session));

        let controller = SyncController::new(config, source, Arc::new(push));
        controller.start(push_events).await?;
        Ok(controller)
    }

    /// Starts the controller loop and applies the pull mode for the initial
    /// (unhealthy) push state: one immediate pull per site, then the
    /// degraded cadence.
    pub async fn start(&self, push_events: mpsc::Receiver<PushEvent>) -> SyncResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::ChannelError("controller already started".into()));
        }
        let events_rx = locked(&self.inner.events_rx)
            .take()
            .ok_or_else(|| SyncError::ChannelError("controller event queue missing".into()))?;

        let handle = tokio::spawn(run(Arc::downgrade(&self.inner), push_events, events_rx));
        *locked(&self.inner.loop_handle) = Some(handle);

        info!(health = %self.health(), "Sync controller started");
        self.inner.reconcile().await;
        Ok(())
    }

    /// Stops all pull loops, closes the push channel and ends the
    /// controller loop. Pulls already running complete and are applied.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down sync controller");

        let stopped = locked(&self.inner.scheduler).stop_all();
        debug!(stopped, "Pull loops stopped");

        if let Err(e) = self.inner.push.shutdown().await {
            warn!(error = %e, "Push channel shutdown failed");
        }

        let _ = self.inner.events_tx.send(ControllerEvent::Shutdown);
        let handle = locked(&self.inner.loop_handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("Sync controller stopped");
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Starts tracking a device. Subscribes it to push and arms its site's
    /// pull loop if pull is currently required. No immediate fetch.
    ///
    /// Returns false if the device is excluded or already tracked under
    /// the same site.
    pub async fn register_device(&self, serial: DeviceSerial, site: SiteId) -> SyncResult<bool> {
        self.inner.ensure_running()?;

        if self.inner.config.is_excluded(&serial) {
            info!(serial = %serial, "Device excluded by configuration");
            return Ok(false);
        }

        let emptied = {
            let mut registry = self.inner.registry.write().await;
            let previous = registry.devices.get(&serial).map(|d| d.site_id.clone());
            if previous.as_ref() == Some(&site) {
                return Ok(false);
            }
            let emptied = previous.and_then(|old| registry.leave_site(&serial, &old));

            registry
                .sites
                .entry(site.clone())
                .or_default()
                .members
                .insert(serial.clone());
            registry.devices.insert(
                serial.clone(),
                Device {
                    serial: serial.clone(),
                    site_id: site.clone(),
                    subscribed: false,
                },
            );
            emptied
        };

        if let Some(old) = emptied {
            locked(&self.inner.scheduler).stop(&old);
        }

        info!(serial = %serial, site = %site, "Device registered");

        match self.inner.push.subscribe(vec![serial.clone()]).await {
            Ok(()) => {
                if let Some(device) = self.inner.registry.write().await.devices.get_mut(&serial) {
                    device.subscribed = true;
                }
            }
            Err(e) => warn!(serial = %serial, error = %e, "Push subscription failed, pull only"),
        }

        if self.inner.started.load(Ordering::SeqCst) {
            let mut scheduler = locked(&self.inner.scheduler);
            if let Some(interval) = self.inner.pull_interval() {
                scheduler.start(site, interval, false);
            }
        }
        Ok(true)
    }

    /// Stops tracking a device and drops its stored state. The site's pull
    /// loop goes away with its last member.
    pub async fn remove_device(&self, serial: &DeviceSerial) -> bool {
        let emptied = {
            let mut registry = self.inner.registry.write().await;
            let Some(device) = registry.devices.remove(serial) else {
                return false;
            };
            registry.leave_site(serial, &device.site_id)
        };

        if let Some(site) = emptied {
            locked(&self.inner.scheduler).stop(&site);
            debug!(site = %site, "Site has no members left");
        }
        self.inner.store.remove(serial).await;
        info!(serial = %serial, "Device removed");
        true
    }

    /// Fetches one device through the pull path and applies it.
    pub async fn refresh_device(&self, serial: &DeviceSerial) -> SyncResult<Option<DeviceState>> {
        self.inner.ensure_running()?;
        self.inner.ensure_tracked(serial).await?;

        let requested_at = store::now();
        let report = self.inner.source.fetch_device(serial).await?;
        self.inner
            .apply(&report, UpdateChannel::Pull, ApplyKind::Observed { requested_at })
            .await;
        Ok(self.inner.store.latest(serial).await)
    }

    /// Pulls a site right away, outside its schedule.
    pub async fn pull_now(&self, site: &SiteId) -> SyncResult<PullSummary> {
        self.inner.ensure_running()?;
        self.inner.pull_site(site).await
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.inner
            .registry
            .read()
            .await
            .devices
            .values()
            .cloned()
            .collect()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Sends a command, then writes its expected result into the store and
    /// schedules a confirmation re-fetch. Never retried.
    pub async fn issue_command(&self, serial: &DeviceSerial, command: DeviceCommand) -> SyncResult<()> {
        self.inner.ensure_running()?;
        self.inner.ensure_tracked(serial).await?;
        validate_command(serial, &command)?;

        if let Err(e) = self.inner.source.send_command(serial, &command).await {
            warn!(serial = %serial, error = %e, "Command failed");
            return Err(e);
        }
        info!(serial = %serial, command = ?command, "Command accepted");

        if self.inner.store.apply_optimistic(serial, &command).await.is_none() {
            debug!(serial = %serial, "No stored state yet, skipping optimistic update");
        }

        let inner = Arc::clone(&self.inner);
        let serial = serial.clone();
        let delay = self.inner.config.confirmation_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.confirm(serial).await;
        });
        Ok(())
    }

    // =========================================================================
    // State Queries
    // =========================================================================

    pub async fn latest_state(&self, serial: &DeviceSerial) -> Option<DeviceState> {
        self.inner.store.latest(serial).await
    }

    pub fn on_device_updated(&self, serial: DeviceSerial, listener: DeviceListener) {
        self.inner.store.on_device_updated(serial, listener);
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.inner.store.subscribe()
    }

    // =========================================================================
    // Channel Health
    // =========================================================================

    pub fn health(&self) -> ChannelHealth {
        locked(&self.inner.monitor).health()
    }

    /// Registers a callback run on every push health transition. It runs on
    /// the controller loop and must not block.
    pub fn on_health_changed(&self, listener: HealthListener) {
        locked(&self.inner.monitor).on_health_changed(listener);
    }

    pub fn subscribe_health(&self) -> watch::Receiver<ChannelHealth> {
        locked(&self.inner.monitor).subscribe()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        locked(&self.inner.monitor).snapshot()
    }

    /// Interval of the site's pull loop, if one is armed.
    pub fn pull_interval_of(&self, site: &SiteId) -> Option<Duration> {
        locked(&self.inner.scheduler).interval_of(site)
    }

    /// Sites with an armed pull loop.
    pub fn pulling_sites(&self) -> Vec<SiteId> {
        let mut sites = locked(&self.inner.scheduler).active_sites();
        sites.sort();
        sites
    }
}

// =============================================================================
// Controller Loop
// =============================================================================

async fn run(
    weak: Weak<Inner>,
    mut push_events: mpsc::Receiver<PushEvent>,
    mut events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
) {
    let period = match weak.upgrade() {
        Some(inner) => inner.config.health_check_interval(),
        None => return,
    };
    let mut liveness = interval_at(Instant::now() + period, period);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut push_open = true;

    loop {
        tokio::select! {
            event = push_events.recv(), if push_open => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Some(event) => inner.handle_push_event(event).await,
                    None => {
                        warn!("Push event stream closed");
                        push_open = false;
                    }
                }
            }

            event = events_rx.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Some(ControllerEvent::HealthChanged(health)) => {
                        debug!(health = %health, "Health transition queued");
                        inner.reconcile().await;
                    }
                    Some(ControllerEvent::Shutdown) | None => {
                        info!("Controller loop received shutdown");
                        break;
                    }
                }
            }

            _ = liveness.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                inner.check_liveness().await;
            }
        }
    }

    debug!("Controller loop stopped");
}

impl Inner {
    fn ensure_running(&self) -> SyncResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    async fn ensure_tracked(&self, serial: &DeviceSerial) -> SyncResult<()> {
        if self.config.is_excluded(serial)
            || !self.registry.read().await.devices.contains_key(serial)
        {
            return Err(SyncError::UnknownDevice(serial.to_string()));
        }
        Ok(())
    }

    /// Pull interval for the current health, `None` when pull is off.
    /// Callers that act on the answer hold the scheduler lock.
    fn pull_interval(&self) -> Option<Duration> {
        let health = locked(&self.monitor).health();
        self.interval_for(health)
    }

    fn interval_for(&self, health: ChannelHealth) -> Option<Duration> {
        if !health.is_healthy() {
            return Some(self.config.degraded_interval());
        }
        if self.config.polling.pull_disabled_when_healthy {
            None
        } else {
            Some(self.config.normal_interval())
        }
    }

    /// Re-arms every site for the health current at the time the scheduler
    /// lock is taken.
    async fn reconcile(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let sites = self.registry.read().await.active_sites();
        let mut scheduler = locked(&self.scheduler);
        let health = locked(&self.monitor).health();

        match self.interval_for(health) {
            None => {
                let stopped = scheduler.stop_all();
                info!(health = %health, stopped, "Push healthy, pull loops disabled");
            }
            Some(interval) => {
                for site in sites.iter() {
                    scheduler.restart(site.clone(), interval, true);
                }
                info!(
                    health = %health,
                    interval_secs = interval.as_secs(),
                    sites = sites.len(),
                    "Pull loops re-armed"
                );
            }
        }
    }

    async fn handle_push_event(&self, event: PushEvent) {
        let change = locked(&self.monitor).handle_event(&event);
        if let Some(change) = change {
            change.notify();
        }

        match event {
            PushEvent::Update(report) => {
                let requested_at = store::now();
                self.apply(&report, UpdateChannel::Push, ApplyKind::Observed { requested_at })
                    .await;
            }
            PushEvent::Connected => debug!("Push channel connected"),
            PushEvent::Disconnected {
                reason,
                attempts_remaining,
            } => debug!(reason = %reason, attempts_remaining, "Push channel disconnected"),
            PushEvent::Heartbeat => {}
        }
    }

    async fn check_liveness(&self) {
        let verdict = locked(&self.monitor).check_liveness();
        match verdict {
            Liveness::Live | Liveness::AwaitingConnect => return,
            Liveness::Exhausted => info!("Push channel parked, requesting a fresh reconnect cycle"),
            Liveness::Stale => warn!("Push channel silent for too long, forcing reconnect"),
        }

        locked(&self.monitor).note_reconnect_requested();
        if let Err(e) = self.push.reconnect().await {
            error!(error = %e, "Push reconnect request failed");
        }
    }

    /// Applies one snapshot from either channel. `None` when the serial is
    /// not tracked.
    async fn apply(
        &self,
        report: &StateReport,
        channel: UpdateChannel,
        kind: ApplyKind,
    ) -> Option<ApplyOutcome> {
        if self.config.is_excluded(&report.serial)
            || !self.registry.read().await.devices.contains_key(&report.serial)
        {
            debug!(serial = %report.serial, channel = %channel, "Ignoring untracked device");
            return None;
        }
        Some(self.store.apply_report(report, channel, kind).await)
    }

    fn begin_pull(&self, site: &SiteId) -> Option<InFlight<'_>> {
        if locked(&self.in_flight).insert(site.clone()) {
            Some(InFlight {
                sites: &self.in_flight,
                site: site.clone(),
            })
        } else {
            None
        }
    }

    async fn pull_site(&self, site: &SiteId) -> SyncResult<PullSummary> {
        let Some(_in_flight) = self.begin_pull(site) else {
            debug!(site = %site, "Pull already in flight, skipping");
            return Ok(PullSummary::Skipped);
        };

        let etag = self
            .registry
            .read()
            .await
            .sites
            .get(site)
            .and_then(|entry| entry.etag.clone());

        let requested_at = store::now();
        let outcome = self.source.fetch_collection(site, etag.as_deref()).await?;

        let (reports, etag) = match outcome {
            PullOutcome::Unchanged => {
                debug!(site = %site, "Site unchanged since last pull");
                return Ok(PullSummary::Unchanged);
            }
            PullOutcome::Updated { reports, etag } => (reports, etag),
        };

        if let Some(entry) = self.registry.write().await.sites.get_mut(site) {
            entry.etag = etag;
        }

        let mut counts = ApplyCounts::default();
        for report in &reports {
            match self
                .apply(report, UpdateChannel::Pull, ApplyKind::Observed { requested_at })
                .await
            {
                Some(ApplyOutcome::Applied) => counts.applied += 1,
                Some(ApplyOutcome::Merged) => counts.merged += 1,
                Some(ApplyOutcome::Rejected(_)) => counts.rejected += 1,
                None => counts.ignored += 1,
            }
        }

        debug!(
            site = %site,
            applied = counts.applied,
            merged = counts.merged,
            rejected = counts.rejected,
            ignored = counts.ignored,
            "Pull applied"
        );
        Ok(PullSummary::Updated(counts))
    }

    async fn scheduled_pull(&self, site: SiteId) {
        match self.pull_site(&site).await {
            Ok(_) => {}
            Err(e) if e.is_auth_error() => {
                warn!(site = %site, error = %e, "Authentication failed, no updates possible this cycle");
            }
            Err(e) => warn!(site = %site, error = %e, "Scheduled pull failed"),
        }
    }

    /// Authoritative re-fetch after a command.
    async fn confirm(&self, serial: DeviceSerial) {
        if self.shutting_down.load(Ordering::SeqCst)
            || !self.registry.read().await.devices.contains_key(&serial)
        {
            return;
        }

        match self.source.fetch_device(&serial).await {
            Ok(report) => {
                let outcome = self
                    .apply(&report, UpdateChannel::Pull, ApplyKind::Confirmation)
                    .await;
                debug!(serial = %serial, outcome = ?outcome, "Command confirmation applied");
            }
            Err(e) => warn!(serial = %serial, error = %e, "Command confirmation fetch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPush, MockStateSource};
    use hvac_core::HvacMode;

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn report(serial: &str, temp: f64) -> StateReport {
        StateReport {
            current_temperature: Some(temp),
            mode: Some(HvacMode::Heat),
            ..StateReport::new(DeviceSerial::from(serial))
        }
    }

    fn controller(source: Arc<MockStateSource>, push: Arc<MockPush>) -> SyncController {
        SyncController::new(SyncConfig::default(), source, push)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_subscribes_and_tracks() {
        let push = Arc::new(MockPush::new());
        let controller = controller(Arc::new(MockStateSource::new()), push.clone());

        let added = controller
            .register_device(DeviceSerial::from("D1"), SiteId::from("S1"))
            .await
            .unwrap();
        assert!(added);
        assert!(!controller
            .register_device(DeviceSerial::from("D1"), SiteId::from("S1"))
            .await
            .unwrap());

        assert_eq!(push.subscribed(), vec![DeviceSerial::from("D1")]);
        let devices = controller.devices().await;
        assert_eq!(devices.len(), 1);
        assert!(devices[0].subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscription_still_tracks() {
        let push = Arc::new(MockPush::new());
        push.set_fail_subscribe(true);
        let controller = controller(Arc::new(MockStateSource::new()), push);

        controller
            .register_device(DeviceSerial::from("D1"), SiteId::from("S1"))
            .await
            .unwrap();

        let devices = controller.devices().await;
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_start_arms_without_fetch() {
        let source = Arc::new(MockStateSource::new());
        let controller = controller(source.clone(), Arc::new(MockPush::new()));
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx).await.unwrap();
        settle().await;

        let site = SiteId::from("S1");
        controller
            .register_device(DeviceSerial::from("D1"), site.clone())
            .await
            .unwrap();
        settle().await;

        assert_eq!(controller.pull_interval_of(&site), Some(Duration::from_secs(10)));
        assert_eq!(source.collection_calls(&site), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(source.collection_calls(&site), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_last_member_stops_site() {
        let source = Arc::new(MockStateSource::new());
        let site = SiteId::from("S1");
        source.set_collection(&site, vec![report("D1", 21.0)], None);
        let controller = controller(source.clone(), Arc::new(MockPush::new()));
        controller
            .register_device(DeviceSerial::from("D1"), site.clone())
            .await
            .unwrap();
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx).await.unwrap();
        settle().await;
        assert!(controller.latest_state(&DeviceSerial::from("D1")).await.is_some());

        assert!(controller.remove_device(&DeviceSerial::from("D1")).await);
        assert!(!controller.remove_device(&DeviceSerial::from("D1")).await);
        assert_eq!(controller.pull_interval_of(&site), None);
        assert!(controller.latest_state(&DeviceSerial::from("D1")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_reads_health_at_arm_time() {
        let mut config = SyncConfig::default();
        config.polling.pull_disabled_when_healthy = true;
        let source = Arc::new(MockStateSource::new());
        let site = SiteId::from("S1");
        source.set_collection(&site, vec![report("D1", 21.0)], None);
        let controller = SyncController::new(config, source.clone(), Arc::new(MockPush::new()));
        controller
            .register_device(DeviceSerial::from("D1"), site.clone())
            .await
            .unwrap();
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx).await.unwrap();
        settle().await;
        assert_eq!(controller.pulling_sites(), vec![site.clone()]);

        // Health moved on, but its reconcile has not run yet.
        let change = locked(&controller.inner.monitor).record(true);
        assert!(change.is_some());
        controller.inner.reconcile().await;

        assert!(controller.pulling_sites().is_empty());
        assert_eq!(controller.pull_interval_of(&site), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_pulls_are_skipped() {
        let source = Arc::new(MockStateSource::new().with_fetch_delay(Duration::from_secs(3)));
        let site = SiteId::from("S1");
        source.set_collection(&site, vec![report("D1", 21.0)], None);
        let controller = controller(source.clone(), Arc::new(MockPush::new()));
        controller
            .register_device(DeviceSerial::from("D1"), site.clone())
            .await
            .unwrap();

        let background = controller.clone();
        let first_site = site.clone();
        let first = tokio::spawn(async move { background.pull_now(&first_site).await });
        settle().await;

        assert_eq!(controller.pull_now(&site).await.unwrap(), PullSummary::Skipped);

        tokio::time::advance(Duration::from_secs(3)).await;
        let summary = first.await.unwrap().unwrap();
        assert_eq!(
            summary,
            PullSummary::Updated(ApplyCounts {
                applied: 1,
                ..ApplyCounts::default()
            })
        );
        assert_eq!(source.collection_calls(&site), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_device_requires_tracking() {
        let source = Arc::new(MockStateSource::new());
        source.set_device(report("D1", 22.5));
        let controller = controller(source, Arc::new(MockPush::new()));

        let err = controller
            .refresh_device(&DeviceSerial::from("D1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownDevice(_)));

        controller
            .register_device(DeviceSerial::from("D1"), SiteId::from("S1"))
            .await
            .unwrap();
        let state = controller
            .refresh_device(&DeviceSerial::from("D1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.current_temperature, 22.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_push_is_reconnected_on_liveness_tick() {
        let push = Arc::new(MockPush::new());
        let controller = controller(Arc::new(MockStateSource::new()), push.clone());
        let (tx, rx) = mpsc::channel(8);
        controller.start(rx).await.unwrap();

        tx.send(PushEvent::Connected).await.unwrap();
        settle().await;
        tx.send(PushEvent::Disconnected {
            reason: crate::push::DisconnectReason::Error("refused".into()),
            attempts_remaining: 0,
        })
        .await
        .unwrap();
        settle().await;
        assert_eq!(controller.health(), ChannelHealth::Unhealthy);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(push.reconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_further_work() {
        let push = Arc::new(MockPush::new());
        let controller = controller(Arc::new(MockStateSource::new()), push.clone());
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx).await.unwrap();

        controller.shutdown().await;
        controller.shutdown().await;

        assert_eq!(push.shutdown_calls(), 1);
        assert!(matches!(
            controller.pull_now(&SiteId::from("S1")).await,
            Err(SyncError::ShuttingDown)
        ));
    }
}
