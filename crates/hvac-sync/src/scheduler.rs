//! # Poll Scheduler
//!
//! Owns one pull timer per site. The controller decides *when* a site must
//! be pulled and at which interval; the scheduler only keeps the timers.
//!
//! ## Timer Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PollScheduler                                   │
//! │                                                                         │
//! │   SiteId ──► PollGroup { interval, timer task }                         │
//! │                                                                         │
//! │   timer task:  [immediate tick] ─► wait interval ─► tick ─► wait ...   │
//! │                        │                              │                 │
//! │                        └──────────► on_tick(site) ◄───┘                 │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                          controller spawns the pull                     │
//! │                          (separate task, survives stop)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stopping a site aborts only its timer. Pulls already started by a tick
//! run to completion. Dropping the scheduler stops every timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use hvac_core::SiteId;

/// Called on every tick with the site that is due.
pub type TickFn = Arc<dyn Fn(SiteId) + Send + Sync>;

/// One active pull loop.
struct PollGroup {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Per-site pull timers.
pub struct PollScheduler {
    groups: HashMap<SiteId, PollGroup>,
    on_tick: TickFn,
}

impl PollScheduler {
    pub fn new(on_tick: TickFn) -> Self {
        PollScheduler {
            groups: HashMap::new(),
            on_tick,
        }
    }

    /// Arms a loop for `site`. Returns false (and changes nothing) if the
    /// site already has one.
    pub fn start(&mut self, site: SiteId, interval: Duration, immediate: bool) -> bool {
        if self.groups.contains_key(&site) {
            return false;
        }
        debug!(site = %site, interval_secs = interval.as_secs(), immediate, "Arming pull loop");
        let handle = spawn_timer(site.clone(), interval, immediate, Arc::clone(&self.on_tick));
        self.groups.insert(site, PollGroup { interval, handle });
        true
    }

    /// Cancels the site's loop, if any, and arms a new one.
    pub fn restart(&mut self, site: SiteId, interval: Duration, immediate: bool) {
        self.stop(&site);
        self.start(site, interval, immediate);
    }

    /// Cancels the site's loop. Returns true if one was armed.
    pub fn stop(&mut self, site: &SiteId) -> bool {
        match self.groups.remove(site) {
            Some(group) => {
                group.handle.abort();
                debug!(site = %site, "Pull loop stopped");
                true
            }
            None => false,
        }
    }

    /// Cancels every loop. Returns how many were armed.
    pub fn stop_all(&mut self) -> usize {
        let count = self.groups.len();
        for (_, group) in self.groups.drain() {
            group.handle.abort();
        }
        count
    }

    pub fn is_armed(&self, site: &SiteId) -> bool {
        self.groups.contains_key(site)
    }

    pub fn interval_of(&self, site: &SiteId) -> Option<Duration> {
        self.groups.get(site).map(|g| g.interval)
    }

    pub fn active_sites(&self) -> Vec<SiteId> {
        self.groups.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn spawn_timer(site: SiteId, period: Duration, immediate: bool, on_tick: TickFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        if immediate {
            on_tick(site.clone());
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            on_tick(site.clone());
        }
    })
}
