//! End-to-end controller behaviour against the recording mocks, on a
//! paused runtime clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use hvac_core::{DeviceCommand, DeviceSerial, DeviceState, HvacMode, SiteId, StateReport};
use hvac_sync::mock::{MockPush, MockStateSource};
use hvac_sync::{
    ApplyCounts, ChannelHealth, DisconnectReason, PullOutcome, PullSummary, PushEvent, SyncConfig,
    SyncController, SyncError,
};

// =============================================================================
// Harness
// =============================================================================

fn init_tracing() {
    let directive = SyncConfig::default().log_directive();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .with_test_writer()
        .try_init();
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn site() -> SiteId {
    SiteId::from("S1")
}

fn serial(s: &str) -> DeviceSerial {
    DeviceSerial::from(s)
}

fn d1(temp: f64) -> StateReport {
    StateReport {
        current_temperature: Some(temp),
        mode: Some(HvacMode::Heat),
        heating_setpoint: Some(22.0),
        ..StateReport::new(serial("D1"))
    }
}

fn d2() -> StateReport {
    StateReport {
        current_temperature: Some(19.0),
        mode: Some(HvacMode::Off),
        ..StateReport::new(serial("D2"))
    }
}

fn exhausted() -> PushEvent {
    PushEvent::Disconnected {
        reason: DisconnectReason::Error("connection refused".into()),
        attempts_remaining: 0,
    }
}

fn flap() -> PushEvent {
    PushEvent::Disconnected {
        reason: DisconnectReason::Error("connection reset".into()),
        attempts_remaining: 4,
    }
}

/// Site S1 with D1 heating and D2 off, served with etag "v1".
fn site_source() -> MockStateSource {
    let source = MockStateSource::new();
    source.set_collection(&site(), vec![d1(21.5), d2()], Some("v1"));
    source.set_device(d1(21.5));
    source
}

struct Harness {
    controller: SyncController,
    source: Arc<MockStateSource>,
    push: Arc<MockPush>,
    events: mpsc::Sender<PushEvent>,
}

impl Harness {
    async fn send(&self, event: PushEvent) {
        self.events.send(event).await.unwrap();
        settle().await;
    }

    async fn state(&self, s: &str) -> Option<DeviceState> {
        self.controller.latest_state(&serial(s)).await
    }

    fn pulls(&self) -> usize {
        self.source.collection_calls(&site())
    }
}

async fn harness(config: SyncConfig, source: MockStateSource) -> Harness {
    init_tracing();
    let source = Arc::new(source);
    let push = Arc::new(MockPush::new());
    let controller = SyncController::new(config, source.clone(), push.clone());

    for s in ["D1", "D2"] {
        controller.register_device(serial(s), site()).await.unwrap();
    }

    let (events, rx) = mpsc::channel(16);
    controller.start(rx).await.unwrap();
    settle().await;

    Harness {
        controller,
        source,
        push,
        events,
    }
}

// =============================================================================
// Startup and Commands
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_pull_populates_store() {
    let h = harness(SyncConfig::default(), site_source()).await;

    assert_eq!(h.controller.health(), ChannelHealth::Unhealthy);
    assert_eq!(h.pulls(), 1);

    let d1 = h.state("D1").await.unwrap();
    assert_eq!(d1.mode, HvacMode::Heat);
    assert!(d1.power_on);
    assert_eq!(d1.current_temperature, 21.5);
    assert_eq!(d1.heating_setpoint, 22.0);

    let d2 = h.state("D2").await.unwrap();
    assert_eq!(d2.mode, HvacMode::Off);
    assert!(!d2.power_on);

    assert_eq!(
        h.controller.pull_interval_of(&site()),
        Some(Duration::from_secs(10))
    );
    assert_eq!(h.push.subscribed(), vec![serial("D1"), serial("D2")]);
}

#[tokio::test(start_paused = true)]
async fn test_command_is_visible_immediately() {
    let h = harness(SyncConfig::default(), site_source()).await;

    h.controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_mode(HvacMode::Cool))
        .await
        .unwrap();

    let d1 = h.state("D1").await.unwrap();
    assert_eq!(d1.mode, HvacMode::Cool);
    assert!(d1.power_on);
    assert_eq!(h.source.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_refetch_follows_command() {
    let h = harness(SyncConfig::default(), site_source()).await;
    h.source.reflect_commands(true);

    h.controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_heating_setpoint(24.5))
        .await
        .unwrap();
    assert!(h.source.device_calls().is_empty());

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;

    assert_eq!(h.source.device_calls(), vec![serial("D1")]);
    assert_eq!(h.state("D1").await.unwrap().heating_setpoint, 24.5);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_overrides_newer_command() {
    // Device ignores both commands; grace 2s, confirmation after 1s.
    let h = harness(SyncConfig::default(), site_source()).await;

    h.controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_mode(HvacMode::Cool))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(500)).await;
    h.controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_heating_setpoint(25.0))
        .await
        .unwrap();

    let commanded = h.state("D1").await.unwrap();
    assert_eq!(commanded.mode, HvacMode::Cool);
    assert_eq!(commanded.heating_setpoint, 25.0);

    // First confirmation lands inside the second command's grace window.
    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(h.source.device_calls(), vec![serial("D1")]);

    let confirmed = h.state("D1").await.unwrap();
    assert_eq!(confirmed.mode, HvacMode::Heat);
    assert_eq!(confirmed.heating_setpoint, 22.0);

    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(h.source.device_calls().len(), 2);
    assert_eq!(h.state("D1").await.unwrap().heating_setpoint, 22.0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_command_leaves_state() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let before = h.state("D1").await.unwrap();
    h.source.fail_next_command(SyncError::Rejected {
        status: 422,
        message: "setpoint out of range".into(),
    });

    let err = h
        .controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_heating_setpoint(40.0))
        .await
        .unwrap_err();

    assert!(err.is_validation_error());
    assert_eq!(h.state("D1").await.unwrap(), before);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(h.source.device_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_command_is_never_sent() {
    let h = harness(SyncConfig::default(), site_source()).await;

    let empty = h
        .controller
        .issue_command(&serial("D1"), DeviceCommand::new())
        .await
        .unwrap_err();
    assert!(matches!(empty, SyncError::Validation(_)));

    let nan = h
        .controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_cooling_setpoint(f64::NAN))
        .await
        .unwrap_err();
    assert!(matches!(nan, SyncError::Validation(_)));

    let unknown = h
        .controller
        .issue_command(&serial("D7"), DeviceCommand::power_off())
        .await
        .unwrap_err();
    assert!(matches!(unknown, SyncError::UnknownDevice(_)));

    assert!(h.source.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_pull_keeps_commanded_fields() {
    let mut config = SyncConfig::default();
    config.commands.optimistic_grace_ms = 200;
    config.commands.confirmation_delay_ms = 5000;
    let h = harness(config, site_source()).await;

    h.source.set_fetch_delay(Some(Duration::from_secs(1)));
    h.source
        .set_collection(&site(), vec![d1(22.8), d2()], Some("v2"));

    let controller = h.controller.clone();
    let pull = tokio::spawn(async move { controller.pull_now(&site()).await });
    settle().await;

    tokio::time::advance(Duration::from_millis(100)).await;
    h.controller
        .issue_command(&serial("D1"), DeviceCommand::new().with_mode(HvacMode::Cool))
        .await
        .unwrap();

    // Lands well outside the grace window, but was requested before the
    // command went out.
    tokio::time::advance(Duration::from_millis(900)).await;
    let summary = pull.await.unwrap().unwrap();
    assert_eq!(
        summary,
        PullSummary::Updated(ApplyCounts {
            applied: 1,
            merged: 1,
            ..ApplyCounts::default()
        })
    );

    let d1 = h.state("D1").await.unwrap();
    assert_eq!(d1.mode, HvacMode::Cool);
    assert_eq!(d1.current_temperature, 22.8);
}

// =============================================================================
// Health-Driven Pull Modes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pull_cadence_follows_health() {
    let start = Instant::now();
    let h = harness(SyncConfig::default(), site_source()).await;
    assert_eq!(h.pulls(), 1);

    h.send(PushEvent::Connected).await;
    assert_eq!(h.controller.health(), ChannelHealth::Healthy);
    assert_eq!(h.pulls(), 2);
    assert_eq!(h.controller.pulling_sites(), vec![site()]);
    assert_eq!(
        h.controller.pull_interval_of(&site()),
        Some(Duration::from_secs(60))
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    h.send(exhausted()).await;
    assert_eq!(h.controller.health(), ChannelHealth::Unhealthy);
    assert_eq!(h.pulls(), 3);

    tokio::time::advance(Duration::from_secs(9)).await;
    settle().await;
    assert_eq!(h.pulls(), 3);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.pulls(), 4);

    let offsets: Vec<u64> = h
        .source
        .collection_call_times(&site())
        .iter()
        .map(|at| at.duration_since(start).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 0, 5, 15]);
}

#[tokio::test(start_paused = true)]
async fn test_pull_disabled_while_healthy() {
    let mut config = SyncConfig::default();
    config.polling.pull_disabled_when_healthy = true;
    let h = harness(config, site_source()).await;
    assert!(h.controller.pull_interval_of(&site()).is_some());

    h.send(PushEvent::Connected).await;
    assert!(h.controller.pulling_sites().is_empty());
    assert_eq!(h.controller.pull_interval_of(&site()), None);

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(h.pulls(), 1);

    h.send(exhausted()).await;
    assert_eq!(h.controller.pulling_sites(), vec![site()]);
    assert_eq!(
        h.controller.pull_interval_of(&site()),
        Some(Duration::from_secs(10))
    );
    assert_eq!(h.pulls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flaps_do_not_notify() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let notified = Arc::new(AtomicUsize::new(0));
    let seen = notified.clone();
    h.controller
        .on_health_changed(Arc::new(move |_: ChannelHealth| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
    let mut health = h.controller.subscribe_health();

    h.send(PushEvent::Connected).await;
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(*health.borrow_and_update(), ChannelHealth::Healthy);
    let pulls = h.pulls();

    for _ in 0..2 {
        h.send(flap()).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        h.send(PushEvent::Connected).await;
        tokio::time::advance(Duration::from_millis(50)).await;
    }

    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.health(), ChannelHealth::Healthy);
    assert!(!health.has_changed().unwrap());
    assert_eq!(h.pulls(), pulls);
}

#[tokio::test(start_paused = true)]
async fn test_health_listener_can_query_controller() {
    let mut config = SyncConfig::default();
    config.polling.pull_disabled_when_healthy = true;
    let h = harness(config, site_source()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let controller = h.controller.clone();
    h.controller
        .on_health_changed(Arc::new(move |health: ChannelHealth| {
            let snapshot = controller.health_snapshot();
            log.lock()
                .unwrap()
                .push((health, controller.health(), snapshot.transitions));
        }));

    h.send(PushEvent::Connected).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(ChannelHealth::Healthy, ChannelHealth::Healthy, 1)]
    );
    assert!(h.controller.pulling_sites().is_empty());

    // The loop keeps running after the listener returned.
    h.send(exhausted()).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(h.controller.health(), ChannelHealth::Unhealthy);
    assert_eq!(h.controller.pulling_sites(), vec![site()]);
    assert_eq!(h.pulls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_silent_push_is_reconnected() {
    let h = harness(SyncConfig::default(), site_source()).await;
    h.send(PushEvent::Connected).await;

    // Stale after three 30s health checks without activity.
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.push.reconnect_calls(), 0);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.push.reconnect_calls(), 1);
    assert_eq!(h.controller.health(), ChannelHealth::Healthy);
}

// =============================================================================
// Update Application
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_push_update_without_temperature_is_dropped() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let before = h.state("D2").await.unwrap();

    h.send(PushEvent::Update(StateReport {
        mode: Some(HvacMode::Heat),
        ..StateReport::new(serial("D2"))
    }))
    .await;

    assert_eq!(h.state("D2").await.unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_push_update_is_applied() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    h.controller.on_device_updated(
        serial("D2"),
        Arc::new(move |_: &DeviceState| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let mut updates = h.controller.subscribe_updates();

    h.send(PushEvent::Update(StateReport {
        current_temperature: Some(19.4),
        humidity: Some(41.0),
        ..StateReport::new(serial("D2"))
    }))
    .await;

    let d2 = h.state("D2").await.unwrap();
    assert_eq!(d2.current_temperature, 19.4);
    assert_eq!(d2.mode, HvacMode::Off);
    assert_eq!(d2.humidity, Some(41.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(updates.recv().await.unwrap().serial, serial("D2"));
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_and_empty_pulls_keep_state() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let before = h.state("D1").await.unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(h.pulls(), 2);
    assert_eq!(
        h.source.etags_seen(&site()),
        vec![None, Some("v1".to_string())]
    );
    assert_eq!(h.state("D1").await.unwrap(), before);

    h.source.queue_collection(
        &site(),
        Ok(PullOutcome::Updated {
            reports: Vec::new(),
            etag: Some("v2".into()),
        }),
    );
    let summary = h.controller.pull_now(&site()).await.unwrap();
    assert_eq!(summary, PullSummary::Updated(ApplyCounts::default()));
    assert_eq!(h.state("D1").await.unwrap(), before);
    assert!(h.state("D2").await.is_some());

    assert_eq!(
        h.controller.pull_now(&site()).await.unwrap(),
        PullSummary::Updated(ApplyCounts {
            applied: 2,
            ..ApplyCounts::default()
        })
    );
    assert_eq!(
        h.source.etags_seen(&site()).last().cloned().flatten(),
        Some("v2".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_excluded_and_unknown_devices_are_ignored() {
    let mut config = SyncConfig::default();
    config.devices.exclude = vec!["D9".into()];
    let source = MockStateSource::new();
    let d9 = StateReport {
        current_temperature: Some(18.0),
        ..StateReport::new(serial("D9"))
    };
    let d3 = StateReport {
        current_temperature: Some(17.0),
        ..StateReport::new(serial("D3"))
    };
    source.set_collection(&site(), vec![d1(21.5), d9.clone(), d3], None);
    let h = harness(config, source).await;

    assert!(!h
        .controller
        .register_device(serial("D9"), site())
        .await
        .unwrap());
    h.send(PushEvent::Update(d9)).await;

    assert!(h.state("D9").await.is_none());
    assert!(h.state("D3").await.is_none());
    assert!(h.state("D1").await.is_some());
    assert!(matches!(
        h.controller
            .issue_command(&serial("D9"), DeviceCommand::power_off())
            .await,
        Err(SyncError::UnknownDevice(_))
    ));

    let summary = h.controller.pull_now(&site()).await.unwrap();
    assert_eq!(
        summary,
        PullSummary::Updated(ApplyCounts {
            applied: 1,
            ignored: 2,
            ..ApplyCounts::default()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_keeps_last_known_state() {
    let h = harness(SyncConfig::default(), site_source()).await;
    let before = h.state("D1").await.unwrap();
    h.source.queue_collection(
        &site(),
        Err(SyncError::AuthFailed("token endpoint returned 401".into())),
    );

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(h.pulls(), 2);
    assert_eq!(h.state("D1").await.unwrap(), before);

    // Next tick retries normally.
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(h.pulls(), 3);
}
