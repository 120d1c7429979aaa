//! Foreground sync: the UI's read model.
//!
//! While the UI is visible a periodic tick recomputes the run so duration
//! keeps moving between fixes. The agent never changes the run phase; it can
//! only trigger recompute passes and read the stored state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::recompute::Recomputer;
use crate::sampler::SamplerStatus;
use crate::scheduler::{Scheduler, TickHandle};
use crate::splits::MilestoneSplits;
use crate::{GpsPoint, PersistedRunState, RunPhase, RunStats};

/// Everything the UI renders for the active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub phase: RunPhase,
    pub session_id: Option<String>,
    pub start_time_ms: Option<i64>,
    pub stats: RunStats,
    pub path: Vec<GpsPoint>,
    pub splits: MilestoneSplits,
    /// False while a tracking run has no live location subscription, e.g.
    /// permission was revoked before a crash recovery.
    pub sampling: bool,
}

impl RunSnapshot {
    fn idle(now_ms: i64, default_pace_min_per_km: f64) -> Self {
        Self {
            phase: RunPhase::Idle,
            session_id: None,
            start_time_ms: None,
            stats: RunStats::zeroed(now_ms, default_pace_min_per_km),
            path: Vec::new(),
            splits: MilestoneSplits::default(),
            sampling: false,
        }
    }

    fn from_state(state: PersistedRunState, sampling: bool) -> Self {
        Self {
            phase: state.phase(),
            path: state.path(),
            session_id: Some(state.session.session_id),
            start_time_ms: Some(state.session.start_time_ms),
            stats: state.stats,
            splits: state.splits,
            sampling,
        }
    }
}

/// Drives the foreground tick and serves snapshots.
pub struct ForegroundSyncAgent {
    recomputer: Recomputer,
    scheduler: Arc<dyn Scheduler>,
    sampler: SamplerStatus,
    tick_interval: Duration,
    default_pace_min_per_km: f64,
    tick: Mutex<Option<TickHandle>>,
}

impl ForegroundSyncAgent {
    pub fn new(
        recomputer: Recomputer,
        scheduler: Arc<dyn Scheduler>,
        sampler: SamplerStatus,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            recomputer,
            scheduler,
            sampler,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            default_pace_min_per_km: config.stats.default_pace_min_per_km,
            tick: Mutex::new(None),
        }
    }

    /// Current state of the run. Read-only, cheap enough for every frame.
    pub fn get_snapshot(&self) -> RunSnapshot {
        match self.recomputer.store().get() {
            Some(state) => RunSnapshot::from_state(state, self.sampler.is_running()),
            None => RunSnapshot::idle(self.recomputer.now_ms(), self.default_pace_min_per_km),
        }
    }

    /// One recompute pass (the tick body).
    pub fn refresh(&self) -> Result<Option<RunStats>> {
        self.recomputer.run()
    }

    /// UI became visible: catch up once, then tick until backgrounded.
    pub fn on_foreground(&self) -> Result<()> {
        let caught_up = self.refresh();

        let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
        if tick.is_none() {
            let recomputer = self.recomputer.clone();
            *tick = Some(self.scheduler.schedule_periodic(
                self.tick_interval,
                Box::new(move || recomputer.run_logged("tick")),
            ));
            info!("[ForegroundSync] Ticking every {:?}", self.tick_interval);
        } else {
            debug!("[ForegroundSync] Already ticking");
        }

        if let Err(e) = &caught_up {
            warn!("[ForegroundSync] Catch-up recompute failed: {}", e);
        }
        caught_up.map(|_| ())
    }

    /// UI went away: stop ticking. The sampler keeps recording.
    pub fn on_background(&self) {
        let handle = self.tick.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            handle.cancel();
            info!("[ForegroundSync] Tick cancelled");
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.tick
            .lock()
            .map(|tick| tick.is_some())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ForegroundSyncAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForegroundSyncAgent")
            .field("tick_interval", &self.tick_interval)
            .field("ticking", &self.is_ticking())
            .finish()
    }
}
