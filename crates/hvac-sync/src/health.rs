//! # Channel Health Monitor
//!
//! Edge-triggered two-state machine that decides whether the push channel
//! can be trusted.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Push Channel Health                              │
//! │                                                                         │
//! │                          Connected                                      │
//! │        ┌───────────┐ ─────────────────────► ┌───────────┐              │
//! │  ────► │ UNHEALTHY │                        │  HEALTHY  │              │
//! │ start  └───────────┘ ◄───────────────────── └───────────┘              │
//! │                       Disconnected with                                 │
//! │                       attempts_remaining == 0                           │
//! │                                                                         │
//! │  NO TRANSITION                                                          │
//! │  ─────────────                                                          │
//! │  • Disconnected with attempts remaining (transient flap)               │
//! │  • Disconnected by local shutdown                                      │
//! │  • Same state signalled again                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition publishes the new value on a `watch` channel and hands
//! back a [`HealthChange`]. Listeners run when the caller announces that
//! change, so a monitor kept behind a lock can release it first.
//!
//! ## Liveness
//! A connection can look healthy while the server has silently stopped
//! talking. [`ChannelHealthMonitor::check_liveness`] is polled on the
//! health-check interval and reports such staleness so the controller can
//! force a reconnect.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::push::{DisconnectReason, PushEvent};

/// Health of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    Healthy,
    Unhealthy,
}

impl ChannelHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ChannelHealth::Healthy)
    }
}

impl std::fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelHealth::Healthy => write!(f, "healthy"),
            ChannelHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Callback invoked on every health transition.
pub type HealthListener = Arc<dyn Fn(ChannelHealth) + Send + Sync>;

/// A recorded transition whose listeners have not run yet.
#[must_use = "listeners only run on notify()"]
pub struct HealthChange {
    pub health: ChannelHealth,
    listeners: Vec<HealthListener>,
}

impl HealthChange {
    /// Runs every listener registered at the time of the transition.
    pub fn notify(self) {
        for listener in &self.listeners {
            listener(self.health);
        }
    }
}

/// Verdict of a periodic liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Healthy and recently active.
    Live,
    /// Healthy on paper, but silent for longer than allowed.
    Stale,
    /// Reconnect budget used up; the channel is parked.
    Exhausted,
    /// Unhealthy, reconnect attempts still running.
    AwaitingConnect,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub health: ChannelHealth,
    pub last_transition: Instant,
    pub last_transition_at: DateTime<Utc>,
    pub transitions: u64,
    pub last_activity: Option<Instant>,
    pub exhausted: bool,
}

/// Edge-triggered health state machine for the push channel.
pub struct ChannelHealthMonitor {
    health: ChannelHealth,
    listeners: Vec<HealthListener>,
    watch_tx: watch::Sender<ChannelHealth>,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    transitions: u64,
    last_activity: Option<Instant>,
    exhausted: bool,
    stale_after: Duration,
}

impl ChannelHealthMonitor {
    /// Creates a monitor in the `Unhealthy` state. A healthy channel that
    /// stays silent for `stale_after` is reported as [`Liveness::Stale`].
    pub fn new(stale_after: Duration) -> Self {
        let (watch_tx, _) = watch::channel(ChannelHealth::Unhealthy);
        ChannelHealthMonitor {
            health: ChannelHealth::Unhealthy,
            listeners: Vec::new(),
            watch_tx,
            last_transition: Instant::now(),
            last_transition_at: Utc::now(),
            transitions: 0,
            last_activity: None,
            exhausted: false,
            stale_after,
        }
    }

    pub fn health(&self) -> ChannelHealth {
        self.health
    }

    /// Registers a transition callback.
    pub fn on_health_changed(&mut self, listener: HealthListener) {
        self.listeners.push(listener);
    }

    /// Subscribes to health values.
    pub fn subscribe(&self) -> watch::Receiver<ChannelHealth> {
        self.watch_tx.subscribe()
    }

    /// Raw edge-trigger. Returns the transition if the state changed.
    pub fn record(&mut self, healthy: bool) -> Option<HealthChange> {
        let next = if healthy {
            ChannelHealth::Healthy
        } else {
            ChannelHealth::Unhealthy
        };
        if next == self.health {
            return None;
        }

        let previous = self.health;
        self.health = next;
        self.last_transition = Instant::now();
        self.last_transition_at = Utc::now();
        self.transitions += 1;

        info!(from = %previous, to = %next, "Push channel health changed");
        self.watch_tx.send_replace(next);
        Some(HealthChange {
            health: next,
            listeners: self.listeners.clone(),
        })
    }

    pub fn on_connected(&mut self) -> Option<HealthChange> {
        self.exhausted = false;
        self.last_activity = Some(Instant::now());
        self.record(true)
    }

    pub fn on_disconnected(
        &mut self,
        reason: &DisconnectReason,
        attempts_remaining: u32,
    ) -> Option<HealthChange> {
        if reason.is_deliberate() {
            debug!("Push channel closed locally, health unchanged");
            return None;
        }
        if attempts_remaining > 0 {
            debug!(attempts_remaining, reason = %reason, "Push channel flapped");
            return None;
        }
        warn!(reason = %reason, "Push channel out of reconnect attempts");
        self.exhausted = true;
        self.record(false)
    }

    /// Notes any sign of life from the push channel.
    pub fn on_activity(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Feeds one push event. Returns the transition if health changed.
    pub fn handle_event(&mut self, event: &PushEvent) -> Option<HealthChange> {
        match event {
            PushEvent::Connected => self.on_connected(),
            PushEvent::Disconnected {
                reason,
                attempts_remaining,
            } => self.on_disconnected(reason, *attempts_remaining),
            PushEvent::Heartbeat | PushEvent::Update(_) => {
                self.on_activity();
                None
            }
        }
    }

    /// Periodic liveness verdict.
    pub fn check_liveness(&self) -> Liveness {
        if self.exhausted {
            return Liveness::Exhausted;
        }
        if !self.health.is_healthy() {
            return Liveness::AwaitingConnect;
        }
        match self.last_activity {
            Some(at) if at.elapsed() <= self.stale_after => Liveness::Live,
            _ => Liveness::Stale,
        }
    }

    /// Clears the exhausted flag and restarts the staleness clock after the
    /// controller asked the push channel to reconnect.
    pub fn note_reconnect_requested(&mut self) {
        self.exhausted = false;
        self.last_activity = Some(Instant::now());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            health: self.health,
            last_transition: self.last_transition,
            last_transition_at: self.last_transition_at,
            transitions: self.transitions,
            last_activity: self.last_activity,
            exhausted: self.exhausted,
        }
    }
}
