//! End-to-end run scenarios through [`RunEngine`].
//!
//! Time is driven by a `ManualClock`, fixes by a `PushLocationProvider`, and
//! foreground ticks by a `ManualScheduler`, so every scenario is
//! deterministic. Crash recovery runs against an on-disk SQLite database.
//!
//! Run with: `cargo test --test lifecycle_scenarios`

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use runtrack::geo_utils::km_to_latitude_degrees;
use runtrack::{
    Clock, KeyValueStore, LocationFix, LocationPermissions, ManualClock, ManualScheduler,
    MemoryStore, PushLocationProvider, RunEngine, RunPhase, RunTrackError, SqliteStore,
    StatsCalculator, ThreadScheduler, TrackerConfig, ACTIVE_RUN_KEY,
};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000_000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Engine plus the handles a test drives it with.
struct Rig {
    clock: Arc<ManualClock>,
    provider: Arc<PushLocationProvider>,
    scheduler: Arc<ManualScheduler>,
    engine: RunEngine,
}

impl Rig {
    fn open(
        backend: Arc<dyn KeyValueStore>,
        clock: Arc<ManualClock>,
        provider: Arc<PushLocationProvider>,
    ) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        let engine = RunEngine::open_with_scheduler(
            backend,
            provider.clone(),
            clock.clone(),
            scheduler.clone(),
            TrackerConfig::default(),
        )
        .expect("failed to open engine");
        Self {
            clock,
            provider,
            scheduler,
            engine,
        }
    }

    fn in_memory() -> Self {
        Self::open(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
            Arc::new(PushLocationProvider::granted()),
        )
    }

    /// Deliver a fix `north_m` meters north of the origin at the current time.
    fn fix_at(&self, north_m: f64) -> usize {
        let lat = km_to_latitude_degrees(north_m / 1000.0);
        self.provider
            .push(LocationFix::new(lat, 0.0, self.clock.now_ms()))
    }

    /// Run north at `speed_mps`, one fix every `interval_s`, for `seconds`.
    /// Returns the distance covered so far in meters.
    fn run_for(&self, start_m: f64, seconds: i64, interval_s: i64, speed_mps: f64) -> f64 {
        let mut position = start_m;
        for _ in 0..seconds / interval_s {
            self.clock.advance(interval_s * 1000);
            position += speed_mps * interval_s as f64;
            self.fix_at(position);
        }
        position
    }

    fn tick(&self) {
        self.scheduler.tick();
    }
}

// ============================================================================
// Pause / Resume
// ============================================================================

#[test]
fn test_pause_freezes_duration() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();
    rig.engine.sync().on_foreground().unwrap();

    rig.fix_at(0.0);
    rig.run_for(0.0, 60, 5, 3.0);
    rig.engine.controller().pause().unwrap();
    let at_pause = rig.engine.sync().get_snapshot().stats;
    assert_eq!(at_pause.duration_sec, 60.0);

    for _ in 0..30 {
        rig.clock.advance(10_000);
        rig.tick();
    }

    let snapshot = rig.engine.sync().get_snapshot();
    assert_eq!(snapshot.phase, RunPhase::Paused);
    assert_eq!(snapshot.stats.duration_sec, 60.0);
    assert_eq!(snapshot.stats, at_pause);
}

#[test]
fn test_resume_continuity() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();
    rig.engine.sync().on_foreground().unwrap();

    rig.fix_at(0.0);
    let position = rig.run_for(0.0, 60, 5, 3.0);
    rig.engine.controller().pause().unwrap();

    rig.clock.advance(300_000);
    rig.engine.controller().resume().unwrap();

    rig.run_for(position, 60, 5, 3.0);
    rig.tick();

    let stats = rig.engine.sync().get_snapshot().stats;
    assert!((stats.duration_sec - 120.0).abs() < 1e-6, "duration {}", stats.duration_sec);
    // 120 s at 3 m/s
    assert!((stats.distance_km - 0.36).abs() < 1e-6);
}

// ============================================================================
// Full Run
// ============================================================================

#[test]
fn test_two_km_run_finalizes_with_splits() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();

    // 10 min/km: 50 m every 30 s
    rig.fix_at(0.0);
    rig.run_for(0.0, 1_200, 30, 50.0 / 30.0);

    let run = rig.engine.controller().stop().unwrap();
    assert!((run.stats.distance_km - 2.0).abs() < 1e-6);
    assert_eq!(run.stats.duration_sec, 1_200.0);
    assert!((run.stats.pace_min_per_km - 10.0).abs() < 1e-6);
    assert_eq!(run.stats.outlier_count, 0);

    let one_k = run.splits.get("1k").expect("1k split");
    assert!((one_k - 600.0).abs() < 0.5, "1k split {}", one_k);
    assert_eq!(run.splits.get("5k"), None);

    assert_eq!(run.fixes.len(), 41);
    assert!((run.calories_estimate - 70.0 * 2.0 * 1.036).abs() < 1e-3);
    assert_eq!(rig.engine.controller().phase(), RunPhase::Idle);
}

#[test]
fn test_two_km_run_with_fixes_every_100m() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();

    // 10 min/km: 100 m every 60 s, 21 fixes over 20 minutes
    rig.fix_at(0.0);
    for i in 1..=20 {
        rig.clock.advance(60_000);
        rig.fix_at(i as f64 * 100.0);
    }

    let run = rig.engine.controller().stop().unwrap();
    assert_eq!(run.fixes.len(), 21);
    assert_eq!(run.stats.outlier_count, 0);
    assert!((run.stats.distance_km - 2.0).abs() < 1e-6, "distance {}", run.stats.distance_km);
    assert!((run.stats.pace_min_per_km - 10.0).abs() < 1e-6);

    let one_k = run.splits.get("1k").expect("1k split");
    assert!((one_k - 600.0).abs() <= 1.0, "1k split {}", one_k);
    assert_eq!(run.splits.get("5k"), None);
}

#[test]
fn test_gps_spike_is_not_counted() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();

    rig.fix_at(0.0);
    rig.clock.advance(10_000);
    rig.fix_at(40.0);
    rig.clock.advance(1_000);
    rig.provider
        .push(LocationFix::new(50.0, 50.0, rig.clock.now_ms()));
    rig.clock.advance(9_000);
    rig.fix_at(80.0);

    let stats = rig.engine.sync().get_snapshot().stats;
    assert!((stats.distance_km - 0.08).abs() < 1e-6);
    assert_eq!(stats.outlier_count, 1);
}

#[test]
fn test_late_fix_after_stop_is_dropped() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();
    rig.fix_at(0.0);
    rig.run_for(0.0, 20, 5, 3.0);

    let run = rig.engine.controller().stop().unwrap();
    assert_eq!(rig.fix_at(100.0), 0);
    assert!(rig.engine.store().get().is_none());

    // The next run starts from an empty log
    rig.clock.advance(60_000);
    rig.engine.controller().start().unwrap();
    let snapshot = rig.engine.sync().get_snapshot();
    assert!(snapshot.path.is_empty());
    assert_ne!(snapshot.session_id.as_deref(), Some(run.session_id.as_str()));
}

// ============================================================================
// Failure Modes
// ============================================================================

#[test]
fn test_permission_denied_leaves_engine_idle() {
    init_logging();
    let rig = Rig::in_memory();
    rig.provider.set_permissions(LocationPermissions {
        foreground: false,
        background: false,
    });

    let err = rig.engine.controller().start().unwrap_err();
    assert!(matches!(err, RunTrackError::PermissionDenied { .. }));
    assert_eq!(rig.engine.sync().get_snapshot().phase, RunPhase::Idle);
    assert_eq!(rig.provider.subscriber_count(), 0);

    rig.provider.set_permissions(LocationPermissions::granted());
    rig.engine.controller().start().unwrap();
}

#[test]
fn test_invalid_command_leaves_state_untouched() {
    init_logging();
    let rig = Rig::in_memory();
    rig.engine.controller().start().unwrap();
    rig.fix_at(0.0);
    let before = rig.engine.store().get();

    let err = rig.engine.controller().resume().unwrap_err();
    assert_eq!(err.to_string(), "Cannot resume while tracking");
    assert_eq!(rig.engine.store().get(), before);
}

#[test]
fn test_corrupt_state_opens_idle() {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir.path().join("runs.db");
    let db_path = db_path.to_str().unwrap();

    let backend = SqliteStore::open(db_path).unwrap();
    backend.set(ACTIVE_RUN_KEY, b"{\"version\":1,\"state\":{\"session\":7}}").unwrap();
    backend.close().unwrap();

    let rig = Rig::open(
        Arc::new(SqliteStore::open(db_path).unwrap()),
        Arc::new(ManualClock::new(T0)),
        Arc::new(PushLocationProvider::granted()),
    );
    assert_eq!(rig.engine.controller().phase(), RunPhase::Idle);
    rig.engine.controller().start().unwrap();
}

// ============================================================================
// Crash Recovery
// ============================================================================

#[test]
fn test_crash_recovery_resumes_tracking() {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir.path().join("runs.db");
    let db_path = db_path.to_str().unwrap();

    let clock = Arc::new(ManualClock::new(T0));
    let provider = Arc::new(PushLocationProvider::granted());

    let position = {
        let rig = Rig::open(
            Arc::new(SqliteStore::open(db_path).unwrap()),
            clock.clone(),
            provider.clone(),
        );
        rig.engine.controller().start().unwrap();
        rig.fix_at(0.0);
        rig.run_for(0.0, 60, 10, 2.5)
        // Process killed: nothing is closed or stopped
    };

    // 30 s pass before the OS relaunches the app
    clock.advance(30_000);
    let rig = Rig::open(
        Arc::new(SqliteStore::open(db_path).unwrap()),
        clock.clone(),
        provider.clone(),
    );

    assert_eq!(rig.engine.controller().phase(), RunPhase::Tracking);
    let session = rig.engine.controller().session().unwrap();
    assert_eq!(session.start_time_ms, T0);
    assert_eq!(rig.engine.sync().get_snapshot().stats.duration_sec, 90.0);

    // Sampling resumed on its own
    assert_eq!(rig.fix_at(position + 50.0), 1);
    rig.engine.sync().on_foreground().unwrap();
    let stats = rig.engine.sync().get_snapshot().stats;
    assert!((stats.distance_km - 0.2).abs() < 1e-6);
    assert_eq!(stats.duration_sec, 90.0);

    let run = rig.engine.controller().stop().unwrap();
    assert_eq!(run.start_time_ms, T0);
    assert_eq!(run.fixes.len(), 8);
}

#[test]
fn test_recovery_without_permission_is_visible_in_snapshot() {
    init_logging();
    let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let provider = Arc::new(PushLocationProvider::granted());

    {
        let rig = Rig::open(backend.clone(), clock.clone(), provider.clone());
        rig.engine.controller().start().unwrap();
        rig.fix_at(0.0);
        assert!(rig.engine.sync().get_snapshot().sampling);
        rig.engine.controller().shutdown();
    }

    provider.set_permissions(LocationPermissions {
        foreground: false,
        background: false,
    });
    clock.advance(30_000);
    let rig = Rig::open(backend, clock.clone(), provider.clone());

    let snapshot = rig.engine.sync().get_snapshot();
    assert_eq!(snapshot.phase, RunPhase::Tracking);
    assert!(!snapshot.sampling);
    assert_eq!(provider.subscriber_count(), 0);

    // Permission restored: pausing and resuming brings sampling back
    provider.set_permissions(LocationPermissions::granted());
    rig.engine.controller().pause().unwrap();
    rig.engine.controller().resume().unwrap();
    assert!(rig.engine.sync().get_snapshot().sampling);
    assert_eq!(rig.fix_at(50.0), 1);
}

#[test]
fn test_paused_run_survives_restart() {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir.path().join("runs.db");
    let db_path = db_path.to_str().unwrap();

    let clock = Arc::new(ManualClock::new(T0));
    let provider = Arc::new(PushLocationProvider::granted());

    {
        let rig = Rig::open(
            Arc::new(SqliteStore::open(db_path).unwrap()),
            clock.clone(),
            provider.clone(),
        );
        rig.engine.controller().start().unwrap();
        rig.fix_at(0.0);
        rig.run_for(0.0, 40, 10, 2.0);
        rig.engine.controller().pause().unwrap();
        rig.engine.close().unwrap();
    }

    clock.advance(600_000);
    let rig = Rig::open(
        Arc::new(SqliteStore::open(db_path).unwrap()),
        clock.clone(),
        provider.clone(),
    );
    assert_eq!(rig.engine.controller().phase(), RunPhase::Paused);
    assert_eq!(provider.subscriber_count(), 0);

    rig.engine.controller().resume().unwrap();
    rig.clock.advance(20_000);
    rig.engine.sync().refresh().unwrap();
    assert_eq!(rig.engine.sync().get_snapshot().stats.duration_sec, 60.0);
}

// ============================================================================
// Concurrent Producers
// ============================================================================

#[test]
fn test_sampler_and_tick_interleave_without_loss() {
    init_logging();
    let clock = Arc::new(ManualClock::new(T0));
    let provider = Arc::new(PushLocationProvider::granted());
    let config = TrackerConfig {
        tick_interval_ms: 1,
        ..TrackerConfig::default()
    };
    let engine = RunEngine::open_with_scheduler(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
        Arc::new(ThreadScheduler),
        config.clone(),
    )
    .unwrap();

    engine.controller().start().unwrap();
    engine.sync().on_foreground().unwrap();

    let step = km_to_latitude_degrees(0.01);
    let pusher = {
        let provider = provider.clone();
        thread::spawn(move || {
            for i in 0..200 {
                provider.push(LocationFix::new(i as f64 * step, 0.0, T0 + i * 1_000));
            }
        })
    };
    pusher.join().unwrap();
    engine.sync().on_background();
    // Let a tick that was already running finish
    thread::sleep(Duration::from_millis(50));

    clock.set(T0 + 200_000);
    engine.sync().refresh().unwrap();

    let state = engine.store().get().unwrap();
    assert_eq!(state.fixes.len(), 200);

    let expected = StatsCalculator::new(config.stats).compute(
        &state.fixes,
        &state.session,
        None,
        clock.now_ms(),
    );
    assert!((state.stats.distance_km - expected.distance_km).abs() < 1e-9);
    assert!((state.stats.distance_km - 1.99).abs() < 1e-6);
    assert_eq!(state.stats.duration_sec, 200.0);
}
