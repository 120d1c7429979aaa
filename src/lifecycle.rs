//! # Run Lifecycle
//!
//! The run state machine:
//!
//! ```text
//! Idle ──start──▶ Tracking ──pause──▶ Paused
//!                  │   ▲               │
//!                  │   └────resume─────┘
//!                  └──────stop─────────┴──▶ Stopped ──(handed off)──▶ Idle
//! ```
//!
//! The phase lives only in the store, never in this struct, so a restarted
//! process picks up exactly where the previous one stopped. Commands are
//! serialized against each other; sampler and tick producers are not, and
//! only ever touch the store through atomic updates.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::{Result, RunTrackError};
use crate::recompute::Recomputer;
use crate::sampler::{
    FixHandler, LocationProvider, LocationSampler, SamplerStatus, SubscriptionOptions,
};
use crate::splits::MilestoneSplits;
use crate::store::{RunStateStore, StateChange};
use crate::{LocationFix, PersistedRunState, RunCommand, RunPhase, RunSession, RunStats};

/// kcal burned per kg of body mass per km run.
pub const KCAL_PER_KG_KM: f64 = 1.036;

/// A completed run, handed to workout persistence on stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedRun {
    pub session_id: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub stats: RunStats,
    pub splits: MilestoneSplits,
    /// The raw fix log, in delivery order
    pub fixes: Vec<LocationFix>,
    pub calories_estimate: f64,
}

impl FinalizedRun {
    fn from_state(state: &PersistedRunState, end_time_ms: i64, body_mass_kg: f64) -> Self {
        Self {
            session_id: state.session.session_id.clone(),
            start_time_ms: state.session.start_time_ms,
            end_time_ms,
            stats: state.stats,
            splits: state.splits.clone(),
            fixes: state.fixes.clone(),
            calories_estimate: body_mass_kg * state.stats.distance_km * KCAL_PER_KG_KM,
        }
    }
}

/// Log and build an `InvalidTransition`.
fn rejected(command: RunCommand, phase: RunPhase) -> RunTrackError {
    warn!("[RunLifecycle] Ignoring {} while {}", command, phase);
    RunTrackError::InvalidTransition { command, phase }
}

fn phase_of(state: &Option<PersistedRunState>) -> RunPhase {
    state.as_ref().map_or(RunPhase::Idle, PersistedRunState::phase)
}

/// Drives the run state machine and owns the location sampler.
pub struct RunLifecycleController {
    recomputer: Recomputer,
    provider: Arc<dyn LocationProvider>,
    sampler: LocationSampler,
    body_mass_kg: f64,
    default_pace_min_per_km: f64,
    commands: Mutex<()>,
}

impl RunLifecycleController {
    /// Create a controller and recover whatever run the store holds.
    ///
    /// A tracking run resumes sampling immediately, a paused run stays
    /// paused, a leftover stopped run or unreadable data is cleared.
    pub fn open(
        store: Arc<RunStateStore>,
        provider: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Result<Self> {
        let sampler = LocationSampler::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            SubscriptionOptions::from(&config.sampler),
        );
        let controller = Self {
            recomputer: Recomputer::new(store, clock, config),
            provider,
            sampler,
            body_mass_kg: config.body_mass_kg,
            default_pace_min_per_km: config.stats.default_pace_min_per_km,
            commands: Mutex::new(()),
        };
        controller.recover()?;
        Ok(controller)
    }

    fn store(&self) -> &RunStateStore {
        self.recomputer.store()
    }

    fn lock_commands(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data; a panicked command leaves nothing torn.
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fix_handler(&self) -> FixHandler {
        let recomputer = self.recomputer.clone();
        Arc::new(move |fix: LocationFix| {
            debug!(
                "[RunLifecycle] Fix ({:.6}, {:.6}) at t={}",
                fix.latitude, fix.longitude, fix.timestamp_ms
            );
            recomputer.run_logged("sampler");
        })
    }

    fn recover(&self) -> Result<()> {
        match self.store().load() {
            Ok(None) => debug!("[RunLifecycle] No run to recover"),
            Ok(Some(state)) => match state.phase() {
                RunPhase::Tracking => {
                    info!(
                        "[RunLifecycle] Recovering tracking run {} ({} fixes)",
                        state.session.session_id,
                        state.fixes.len()
                    );
                    // The run stays tracking without a sampler; snapshots report
                    // `sampling: false` until permission is back and the run is paused and resumed.
                    if let Err(e) = self.sampler.start(self.fix_handler()) {
                        warn!("[RunLifecycle] Could not restart sampler on recovery: {}", e);
                    }
                    self.recomputer.run()?;
                }
                RunPhase::Paused => {
                    info!(
                        "[RunLifecycle] Recovered paused run {}",
                        state.session.session_id
                    );
                }
                RunPhase::Stopped | RunPhase::Idle => {
                    info!(
                        "[RunLifecycle] Clearing leftover {} run {}",
                        state.phase(),
                        state.session.session_id
                    );
                    self.store().clear()?;
                }
            },
            Err(RunTrackError::CorruptPersistedState { message }) => {
                warn!("[RunLifecycle] Discarding unreadable run state: {}", message);
                self.store().clear()?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Current phase, read from the store.
    pub fn phase(&self) -> RunPhase {
        self.store().get().map_or(RunPhase::Idle, |s| s.phase())
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<RunSession> {
        self.store().get().map(|s| s.session)
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_running()
    }

    /// Handle the sync agent reads the sampling state through.
    pub fn sampler_status(&self) -> SamplerStatus {
        self.sampler.status()
    }

    /// Begin a new run. Requires foreground and background location access.
    pub fn start(&self) -> Result<()> {
        let _guard = self.lock_commands();

        let phase = self.phase();
        if phase != RunPhase::Idle {
            return Err(rejected(RunCommand::Start, phase));
        }

        let permissions = self.provider.permissions();
        if !permissions.all_granted() {
            warn!(
                "[RunLifecycle] Start refused, location permission missing ({:?})",
                permissions
            );
            return Err(RunTrackError::PermissionDenied {
                foreground: permissions.foreground,
                background: permissions.background,
            });
        }

        let now = self.recomputer.now_ms();
        let session = RunSession::new(format!("run_{}", now), now);
        let session_id = session.session_id.clone();
        let fresh = PersistedRunState::new(
            session,
            RunStats::zeroed(now, self.default_pace_min_per_km),
        );

        // Fixes delivered before the state below lands are dropped by the store.
        self.sampler.start(self.fix_handler())?;
        let written = self.store().update(|current| match phase_of(&current) {
            RunPhase::Idle => Ok((StateChange::Put(fresh), ())),
            other => Err(rejected(RunCommand::Start, other)),
        });
        if let Err(e) = written {
            self.sampler.stop();
            return Err(e);
        }

        info!("[RunLifecycle] Started run {}", session_id);
        Ok(())
    }

    /// Freeze the run: last recompute, then stop sampling.
    pub fn pause(&self) -> Result<()> {
        let _guard = self.lock_commands();
        let now = self.recomputer.now_ms();
        let (stats_calc, splits_calc) = (self.recomputer.stats(), self.recomputer.splits());

        let frozen = self.store().update(|current| match current {
            Some(mut state) if state.phase() == RunPhase::Tracking => {
                let stats = state.recompute(stats_calc, splits_calc, now);
                state.session.phase = RunPhase::Paused;
                state.session.pause_started_at_ms = Some(now);
                Ok((StateChange::Put(state), stats))
            }
            other => Err(rejected(RunCommand::Pause, phase_of(&other))),
        })?;
        self.sampler.stop();

        info!(
            "[RunLifecycle] Paused at {:.3} km, {:.1} s",
            frozen.distance_km, frozen.duration_sec
        );
        Ok(())
    }

    /// Continue a paused run; the paused interval is excluded from duration.
    pub fn resume(&self) -> Result<()> {
        let _guard = self.lock_commands();

        let phase = self.phase();
        if phase != RunPhase::Paused {
            return Err(rejected(RunCommand::Resume, phase));
        }

        let now = self.recomputer.now_ms();
        self.sampler.start(self.fix_handler())?;
        let resumed = self.store().update(|current| match current {
            Some(mut state) if state.phase() == RunPhase::Paused => {
                let paused_at = state.session.pause_started_at_ms.unwrap_or(now);
                let paused_ms = (now - paused_at).max(0);
                state.session.accumulated_paused_ms += paused_ms;
                state.session.pause_started_at_ms = None;
                state.session.phase = RunPhase::Tracking;
                Ok((StateChange::Put(state), paused_ms))
            }
            other => Err(rejected(RunCommand::Resume, phase_of(&other))),
        });

        match resumed {
            Ok(paused_ms) => {
                info!("[RunLifecycle] Resumed after {} ms paused", paused_ms);
                Ok(())
            }
            Err(e) => {
                self.sampler.stop();
                Err(e)
            }
        }
    }

    /// Finish the run and hand off the result. Persisted state is cleared.
    pub fn stop(&self) -> Result<FinalizedRun> {
        let _guard = self.lock_commands();

        let phase = self.phase();
        if !phase.is_active() {
            return Err(rejected(RunCommand::Stop, phase));
        }

        self.sampler.stop();
        let now = self.recomputer.now_ms();
        let (stats_calc, splits_calc) = (self.recomputer.stats(), self.recomputer.splits());
        let body_mass_kg = self.body_mass_kg;

        let finalized = self.store().update(|current| match current {
            Some(mut state) if state.phase().is_active() => {
                let session = &mut state.session;
                if let Some(paused_at) = session.pause_started_at_ms.take() {
                    session.accumulated_paused_ms += (now - paused_at).max(0);
                }
                session.phase = RunPhase::Stopped;

                state.recompute(stats_calc, splits_calc, now);
                let run = FinalizedRun::from_state(&state, now, body_mass_kg);
                Ok((StateChange::Put(state), run))
            }
            other => Err(rejected(RunCommand::Stop, phase_of(&other))),
        })?;

        if let Err(e) = self.store().clear() {
            // Recovery clears a leftover stopped run on the next launch.
            warn!("[RunLifecycle] Failed to clear stopped run: {}", e);
        }

        info!(
            "[RunLifecycle] Stopped run {}: {:.3} km in {:.1} s, {} splits",
            finalized.session_id,
            finalized.stats.distance_km,
            finalized.stats.duration_sec,
            finalized.splits.len()
        );
        Ok(finalized)
    }

    /// Throw the run away.
    pub fn discard(&self) -> Result<()> {
        let _guard = self.lock_commands();

        let phase = self.phase();
        if phase == RunPhase::Idle {
            return Err(rejected(RunCommand::Discard, phase));
        }

        self.sampler.stop();
        self.store().clear()?;
        info!("[RunLifecycle] Discarded {} run", phase);
        Ok(())
    }

    /// Release the sampler without touching the stored run.
    pub fn shutdown(&self) {
        let _guard = self.lock_commands();
        self.sampler.stop();
    }
}

impl std::fmt::Debug for RunLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLifecycleController")
            .field("sampler", &self.sampler)
            .field("body_mass_kg", &self.body_mass_kg)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
