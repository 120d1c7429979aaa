//! # Run Engine
//!
//! Composition root: one store, one lifecycle controller, one sync agent,
//! wired to the same clock and configuration.
//!
//! Hosts embedding the crate construct a [`RunEngine`] directly. Mobile hosts
//! go through the `ffi` feature, which keeps one engine in a process-global
//! slot next to a [`PushLocationProvider`] the platform layer feeds.

use std::sync::Arc;

use log::info;

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::lifecycle::RunLifecycleController;
use crate::recompute::Recomputer;
use crate::sampler::LocationProvider;
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::store::{KeyValueStore, RunStateStore};
use crate::sync::ForegroundSyncAgent;

/// A fully wired run-tracking engine.
pub struct RunEngine {
    store: Arc<RunStateStore>,
    controller: RunLifecycleController,
    sync: ForegroundSyncAgent,
    config: TrackerConfig,
}

impl RunEngine {
    /// Open an engine over `backend`, recovering any active run.
    ///
    /// Ticks run on a [`ThreadScheduler`].
    pub fn open(
        backend: Arc<dyn KeyValueStore>,
        provider: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Result<Self> {
        Self::open_with_scheduler(backend, provider, clock, Arc::new(ThreadScheduler), config)
    }

    pub fn open_with_scheduler(
        backend: Arc<dyn KeyValueStore>,
        provider: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        config: TrackerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(RunStateStore::open(backend, config.codec));
        let controller = RunLifecycleController::open(
            Arc::clone(&store),
            provider,
            Arc::clone(&clock),
            &config,
        )?;
        let sync = ForegroundSyncAgent::new(
            Recomputer::new(Arc::clone(&store), clock, &config),
            scheduler,
            controller.sampler_status(),
            &config,
        );

        info!("[RunEngine] Opened (phase: {})", controller.phase());
        Ok(Self {
            store,
            controller,
            sync,
            config,
        })
    }

    pub fn controller(&self) -> &RunLifecycleController {
        &self.controller
    }

    pub fn sync(&self) -> &ForegroundSyncAgent {
        &self.sync
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Stop ticking and sampling, then close the store. The active run stays
    /// persisted for the next [`open`](Self::open).
    pub fn close(&self) -> Result<()> {
        self.sync.on_background();
        self.controller.shutdown();
        self.store.close()?;
        info!("[RunEngine] Closed");
        Ok(())
    }
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("store", &self.store)
            .field("controller", &self.controller)
            .field("sync", &self.sync)
            .finish()
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

#[cfg(feature = "ffi")]
use once_cell::sync::Lazy;
#[cfg(feature = "ffi")]
use std::sync::Mutex;
#[cfg(feature = "ffi")]
use crate::sampler::PushLocationProvider;

/// Global engine instance.
///
/// This singleton allows FFI calls to reach the engine without passing
/// state back and forth across the FFI boundary.
#[cfg(feature = "ffi")]
pub static RUN_ENGINE: Lazy<Mutex<Option<RunEngine>>> = Lazy::new(|| Mutex::new(None));

/// Location provider the platform layer pushes fixes into.
#[cfg(feature = "ffi")]
static PLATFORM_LOCATIONS: Lazy<Arc<PushLocationProvider>> =
    Lazy::new(|| Arc::new(PushLocationProvider::new(Default::default())));

/// Run `f` against the global engine, if initialized.
#[cfg(feature = "ffi")]
pub fn with_run_engine<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&RunEngine) -> R,
{
    let guard = RUN_ENGINE.lock().ok()?;
    guard.as_ref().map(f)
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
pub mod run_engine_ffi {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::RunTrackError;
    use crate::sampler::LocationPermissions;
    use crate::store::SqliteStore;
    use crate::LocationFix;
    use log::{info, warn};

    fn to_json<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string(value).unwrap_or_else(|e| {
            warn!("[RunEngine] Failed to serialize FFI result: {}", e);
            "{}".to_string()
        })
    }

    fn report(command: &str, result: Option<Result<()>>) -> bool {
        match result {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!("[RunEngine] {} failed: {}", command, e);
                false
            }
            None => {
                warn!("[RunEngine] {} called before run_engine_init", command);
                false
            }
        }
    }

    /// Initialize the engine with a database path and optional JSON config.
    /// Call this once at app startup. Recovers any run in progress.
    #[uniffi::export]
    pub fn run_engine_init(db_path: String, config_json: Option<String>) -> bool {
        crate::init_logging();
        info!("[RunEngine] Initializing with db: {}", db_path);

        let opened = config_json
            .as_deref()
            .map_or_else(|| Ok(TrackerConfig::default()), TrackerConfig::from_json_str)
            .and_then(|config| {
                let backend = Arc::new(SqliteStore::open(&db_path)?);
                let locations: Arc<PushLocationProvider> = Arc::clone(&*PLATFORM_LOCATIONS);
                RunEngine::open(backend, locations, Arc::new(SystemClock), config)
            });

        match opened {
            Ok(engine) => match RUN_ENGINE.lock() {
                Ok(mut guard) => {
                    if let Some(previous) = guard.replace(engine) {
                        if let Err(e) = previous.close() {
                            warn!("[RunEngine] Failed to close previous engine: {}", e);
                        }
                    }
                    info!("[RunEngine] Initialized successfully");
                    true
                }
                Err(_) => false,
            },
            Err(e) => {
                warn!("[RunEngine] Failed to initialize: {}", e);
                false
            }
        }
    }

    /// Check if the engine is initialized.
    #[uniffi::export]
    pub fn run_engine_is_initialized() -> bool {
        RUN_ENGINE
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Report the current location permission grants.
    #[uniffi::export]
    pub fn run_engine_set_permissions(permissions: LocationPermissions) {
        PLATFORM_LOCATIONS.set_permissions(permissions);
    }

    /// Deliver a fix from the platform location service.
    /// Returns false when no run is sampling.
    #[uniffi::export]
    pub fn run_engine_push_fix(fix: LocationFix) -> bool {
        PLATFORM_LOCATIONS.push(fix) > 0
    }

    /// Start a run. Returns an error message, or empty string on success.
    #[uniffi::export]
    pub fn run_engine_start() -> String {
        match with_run_engine(|e| e.controller().start()) {
            Some(Ok(())) => String::new(),
            Some(Err(e)) => {
                warn!("[RunEngine] start failed: {}", e);
                match e {
                    RunTrackError::PermissionDenied { .. } => "permission_denied".to_string(),
                    other => other.to_string(),
                }
            }
            None => "not_initialized".to_string(),
        }
    }

    #[uniffi::export]
    pub fn run_engine_pause() -> bool {
        report("pause", with_run_engine(|e| e.controller().pause()))
    }

    #[uniffi::export]
    pub fn run_engine_resume() -> bool {
        report("resume", with_run_engine(|e| e.controller().resume()))
    }

    /// Stop the run.
    /// Returns the finalized run as JSON, or empty string if nothing was stopped.
    #[uniffi::export]
    pub fn run_engine_stop_json() -> String {
        match with_run_engine(|e| e.controller().stop()) {
            Some(Ok(run)) => to_json(&run),
            Some(Err(e)) => {
                warn!("[RunEngine] stop failed: {}", e);
                String::new()
            }
            None => String::new(),
        }
    }

    #[uniffi::export]
    pub fn run_engine_discard() -> bool {
        report("discard", with_run_engine(|e| e.controller().discard()))
    }

    /// Get the current run snapshot as JSON.
    /// Returns: {"phase": "tracking", "stats": {...}, "path": [...], "splits": {"1k": 301.2}, ...}
    #[uniffi::export]
    pub fn run_engine_snapshot_json() -> String {
        with_run_engine(|e| to_json(&e.sync().get_snapshot())).unwrap_or_default()
    }

    #[uniffi::export]
    pub fn run_engine_on_foreground() -> bool {
        report("on_foreground", with_run_engine(|e| e.sync().on_foreground()))
    }

    #[uniffi::export]
    pub fn run_engine_on_background() {
        with_run_engine(|e| e.sync().on_background());
    }
}

// ============================================================================
// Tests
// ============================================================================
