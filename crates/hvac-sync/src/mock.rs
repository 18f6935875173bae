//! # Test Doubles
//!
//! Scripted stand-ins for the remote service, the auth backend and the
//! push channel. They record every call so tests can assert on traffic, and
//! they read time from the runtime clock so paused-clock tests stay
//! deterministic.
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────────┐
//! │  SyncController  │────►│ MockStateSource    │  scripted collections,
//! │                  │     │                    │  device reports, command
//! │                  │     └────────────────────┘  failures
//! │                  │     ┌────────────────────┐
//! │                  │────►│ MockPush           │  records subscribe /
//! └──────────────────┘     └────────────────────┘  reconnect / shutdown
//!          ▲
//!          │ mpsc::Sender<PushEvent> (held by the test)
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use hvac_core::{DeviceCommand, DeviceSerial, SiteId, StateReport};

use crate::error::{SyncError, SyncResult};
use crate::push::PushControl;
use crate::session::{AuthBackend, TokenGrant};
use crate::source::{PullOutcome, RemoteStateSource};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Auth Backend
// =============================================================================

/// Auth backend that hands out numbered tokens.
pub struct MockAuthBackend {
    delay: Option<Duration>,
    lifetime_secs: u64,
    fail_login: AtomicBool,
    fail_refresh: AtomicBool,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    issued: AtomicU64,
}

impl MockAuthBackend {
    pub fn new() -> Self {
        MockAuthBackend {
            delay: None,
            lifetime_secs: 3600,
            fail_login: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            issued: AtomicU64::new(0),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `expires_in` of every grant.
    pub fn with_lifetime(mut self, secs: u64) -> Self {
        self.lifetime_secs = secs;
        self
    }

    pub fn failing_login(self) -> Self {
        self.set_fail_login(true);
        self
    }

    pub fn failing_refresh(self) -> Self {
        self.set_fail_refresh(true);
        self
    }

    pub fn set_fail_login(&self, fail: bool) {
        self.fail_login.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: Some(format!("refresh-{}", n)),
            expires_in: self.lifetime_secs,
        }
    }
}

impl Default for MockAuthBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthBackend for MockAuthBackend {
    async fn login(&self) -> SyncResult<TokenGrant> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(SyncError::AuthFailed("mock login refused".into()));
        }
        Ok(self.grant())
    }

    async fn refresh(&self, _refresh_token: &str) -> SyncResult<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(SyncError::AuthFailed("mock refresh refused".into()));
        }
        Ok(self.grant())
    }
}

// =============================================================================
// State Source
// =============================================================================

#[derive(Default)]
struct SourceScript {
    /// Answer for every collection fetch unless something is queued.
    collections: HashMap<SiteId, (Vec<StateReport>, Option<String>)>,
    /// One-shot answers, consumed before the sticky collection.
    queued: HashMap<SiteId, VecDeque<SyncResult<PullOutcome>>>,
    devices: HashMap<DeviceSerial, StateReport>,
    command_failures: VecDeque<SyncError>,
    reflect_commands: bool,
    fetch_delay: Option<Duration>,

    collection_calls: HashMap<SiteId, Vec<Instant>>,
    etags_seen: HashMap<SiteId, Vec<Option<String>>>,
    device_calls: Vec<DeviceSerial>,
    commands: Vec<(DeviceSerial, DeviceCommand)>,
}

/// Scripted [`RemoteStateSource`].
#[derive(Default)]
pub struct MockStateSource {
    script: Mutex<SourceScript>,
}

impl MockStateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps this long (after picking the answer) on every fetch.
    pub fn with_fetch_delay(self, delay: Duration) -> Self {
        self.set_fetch_delay(Some(delay));
        self
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        locked(&self.script).fetch_delay = delay;
    }

    /// Sets the collection a site returns. A fetch carrying the same etag
    /// is answered with [`PullOutcome::Unchanged`].
    pub fn set_collection(&self, site: &SiteId, reports: Vec<StateReport>, etag: Option<&str>) {
        locked(&self.script)
            .collections
            .insert(site.clone(), (reports, etag.map(str::to_string)));
    }

    /// Queues a one-shot answer for the next fetch of `site`.
    pub fn queue_collection(&self, site: &SiteId, outcome: SyncResult<PullOutcome>) {
        locked(&self.script)
            .queued
            .entry(site.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Sets what `fetch_device` returns for the report's serial.
    pub fn set_device(&self, report: StateReport) {
        locked(&self.script)
            .devices
            .insert(report.serial.clone(), report);
    }

    /// The next `send_command` fails with `err`.
    pub fn fail_next_command(&self, err: SyncError) {
        locked(&self.script).command_failures.push_back(err);
    }

    /// When set, successful commands are written into the device reports
    /// served by `fetch_device`, like a device that obeys.
    pub fn reflect_commands(&self, reflect: bool) {
        locked(&self.script).reflect_commands = reflect;
    }

    pub fn collection_calls(&self, site: &SiteId) -> usize {
        locked(&self.script)
            .collection_calls
            .get(site)
            .map_or(0, Vec::len)
    }

    /// Runtime-clock instants of every collection fetch for `site`.
    pub fn collection_call_times(&self, site: &SiteId) -> Vec<Instant> {
        locked(&self.script)
            .collection_calls
            .get(site)
            .cloned()
            .unwrap_or_default()
    }

    /// Etags sent with each collection fetch for `site`.
    pub fn etags_seen(&self, site: &SiteId) -> Vec<Option<String>> {
        locked(&self.script)
            .etags_seen
            .get(site)
            .cloned()
            .unwrap_or_default()
    }

    pub fn device_calls(&self) -> Vec<DeviceSerial> {
        locked(&self.script).device_calls.clone()
    }

    pub fn commands(&self) -> Vec<(DeviceSerial, DeviceCommand)> {
        locked(&self.script).commands.clone()
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn reflect(report: &mut StateReport, command: &DeviceCommand) {
    if let Some(mode) = command.mode {
        report.mode = Some(mode);
        report.power_on = Some(mode.is_powered());
    }
    if let Some(heat) = command.heating_setpoint {
        report.heating_setpoint = Some(heat);
    }
    if let Some(cool) = command.cooling_setpoint {
        report.cooling_setpoint = Some(cool);
    }
    if let Some(fan) = command.fan_speed {
        report.fan_speed = Some(fan);
    }
}

#[async_trait]
impl RemoteStateSource for MockStateSource {
    async fn fetch_collection(
        &self,
        site: &SiteId,
        etag: Option<&str>,
    ) -> SyncResult<PullOutcome> {
        let (answer, delay) = {
            let mut script = locked(&self.script);
            script
                .collection_calls
                .entry(site.clone())
                .or_default()
                .push(Instant::now());
            script
                .etags_seen
                .entry(site.clone())
                .or_default()
                .push(etag.map(str::to_string));

            let queued = script.queued.get_mut(site).and_then(VecDeque::pop_front);
            let answer = match queued {
                Some(answer) => answer,
                None => match script.collections.get(site) {
                    Some((_, Some(current))) if etag == Some(current.as_str()) => {
                        Ok(PullOutcome::Unchanged)
                    }
                    Some((reports, current)) => Ok(PullOutcome::Updated {
                        reports: reports.clone(),
                        etag: current.clone(),
                    }),
                    None => Ok(PullOutcome::Updated {
                        reports: Vec::new(),
                        etag: None,
                    }),
                },
            };
            (answer, script.fetch_delay)
        };

        Self::pause(delay).await;
        answer
    }

    async fn fetch_device(&self, serial: &DeviceSerial) -> SyncResult<StateReport> {
        let (answer, delay) = {
            let mut script = locked(&self.script);
            script.device_calls.push(serial.clone());
            let answer = script.devices.get(serial).cloned().ok_or(SyncError::Http {
                status: 404,
                message: format!("no device {}", serial),
            });
            (answer, script.fetch_delay)
        };

        Self::pause(delay).await;
        answer
    }

    async fn send_command(
        &self,
        serial: &DeviceSerial,
        command: &DeviceCommand,
    ) -> SyncResult<()> {
        let mut script = locked(&self.script);
        script.commands.push((serial.clone(), *command));
        if let Some(err) = script.command_failures.pop_front() {
            return Err(err);
        }
        if script.reflect_commands {
            if let Some(report) = script.devices.get_mut(serial) {
                reflect(report, command);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Push Control
// =============================================================================

/// Recording [`PushControl`]. Events are fed by the test through its own
/// `mpsc::Sender<PushEvent>`.
#[derive(Default)]
pub struct MockPush {
    subscriptions: Mutex<Vec<DeviceSerial>>,
    fail_subscribe: AtomicBool,
    reconnects: AtomicU32,
    shutdowns: AtomicU32,
}

impl MockPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Every serial passed to `subscribe`, in call order.
    pub fn subscribed(&self) -> Vec<DeviceSerial> {
        locked(&self.subscriptions).clone()
    }

    pub fn reconnect_calls(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushControl for MockPush {
    async fn subscribe(&self, serials: Vec<DeviceSerial>) -> SyncResult<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelError("mock subscribe refused".into()));
        }
        locked(&self.subscriptions).extend(serials);
        Ok(())
    }

    async fn reconnect(&self) -> SyncResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> SyncResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
