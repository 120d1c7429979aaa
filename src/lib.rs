//! # runtrack
//!
//! GPS run-tracking engine for mobile hosts.
//!
//! This library provides:
//! - Recompute-from-log distance, duration and pace with outlier rejection
//! - A pause/resume/stop state machine that survives process restarts
//! - Interpolated milestone splits (1k, 5k, 10k, half marathon, marathon)
//! - A durable, versioned run envelope over any key-value store
//!
//! ## Features
//!
//! - **`persistence`** - SQLite key-value backend (enabled by default)
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use runtrack::{
//!     Clock, LocationFix, ManualClock, MemoryStore, PushLocationProvider, RunEngine, RunPhase,
//!     TrackerConfig,
//! };
//!
//! let clock = Arc::new(ManualClock::new(1_700_000_000_000));
//! let provider = Arc::new(PushLocationProvider::granted());
//! let engine = RunEngine::open(
//!     Arc::new(MemoryStore::new()),
//!     provider.clone(),
//!     clock.clone(),
//!     TrackerConfig::default(),
//! )
//! .unwrap();
//!
//! engine.controller().start().unwrap();
//! provider.push(LocationFix::new(51.5074, -0.1278, clock.now_ms()));
//! clock.advance(10_000);
//! provider.push(LocationFix::new(51.5078, -0.1278, clock.now_ms()));
//!
//! let snapshot = engine.sync().get_snapshot();
//! assert_eq!(snapshot.phase, RunPhase::Tracking);
//! assert!(snapshot.stats.distance_km > 0.04);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, RunTrackError};

// Tunable thresholds
pub mod config;
pub use config::{MilestoneThreshold, SamplerConfig, StatsConfig, TrackerConfig};

// Geographic utilities (haversine distance)
pub mod geo_utils;

// Injectable wall clock
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Durable run envelope over a key-value store
pub mod store;
#[cfg(feature = "persistence")]
pub use store::SqliteStore;
pub use store::{KeyValueStore, MemoryStore, RunStateStore, StateCodec, ACTIVE_RUN_KEY};

// Distance/duration/pace computation
pub mod stats;
pub use stats::{DistanceWalk, StatsCalculator};

// Milestone split times
pub mod splits;
pub use splits::{MilestoneSplitCalculator, MilestoneSplits};

// Shared stats/splits recompute pass
pub mod recompute;
pub use recompute::Recomputer;

// Location sampling
pub mod sampler;
pub use sampler::{
    LocationPermissions, LocationProvider, LocationSampler, LocationSubscription,
    PushLocationProvider, SamplerStatus, SubscriptionOptions,
};

// Cancellable periodic ticks
pub mod scheduler;
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TickHandle};

// Run state machine
pub mod lifecycle;
pub use lifecycle::{FinalizedRun, RunLifecycleController};

// UI-facing read model
pub mod sync;
pub use sync::{ForegroundSyncAgent, RunSnapshot};

// Composition root (+ FFI singleton)
pub mod engine;
pub use engine::RunEngine;
#[cfg(feature = "ffi")]
pub use engine::{with_run_engine, RUN_ENGINE};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("runtrack"),
    );
}

/// Initialize logging for iOS (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "ios"))]
pub(crate) fn init_logging() {
    use log::LevelFilter;

    // Fails only if a logger is already installed
    let _ = oslog::OsLogger::new("runtrack")
        .level_filter(LevelFilter::Debug)
        .init();
}

#[cfg(all(feature = "ffi", not(any(target_os = "android", target_os = "ios"))))]
pub(crate) fn init_logging() {
    // No-op on desktop platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single location sample delivered by the platform location service.
///
/// Fixes are immutable once recorded. The log may contain exact duplicates
/// (at-least-once delivery); all downstream math ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Instantaneous speed reported by the sensor (m/s)
    #[serde(default)]
    pub speed_mps: Option<f64>,
    /// Altitude above sea level (m)
    #[serde(default)]
    pub altitude_m: Option<f64>,
}

impl LocationFix {
    /// Create a fix without speed or altitude.
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            speed_mps: None,
            altitude_m: None,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.point().is_valid()
    }

    /// Same position at the same instant. Speed and altitude are ignored.
    pub fn is_duplicate_of(&self, other: &LocationFix) -> bool {
        self.timestamp_ms == other.timestamp_ms
            && self.latitude == other.latitude
            && self.longitude == other.longitude
    }
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Idle,
    Tracking,
    Paused,
    Stopped,
}

impl RunPhase {
    /// Phases in which a run exists and can be stopped or discarded.
    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Tracking | RunPhase::Paused)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Tracking => "tracking",
            RunPhase::Paused => "paused",
            RunPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lifecycle commands accepted by the [`RunLifecycleController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Discard,
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunCommand::Start => "start",
            RunCommand::Pause => "pause",
            RunCommand::Resume => "resume",
            RunCommand::Stop => "stop",
            RunCommand::Discard => "discard",
        };
        f.write_str(name)
    }
}

/// The in-flight, not yet finalized run.
///
/// `pause_started_at_ms` is `Some` iff `phase == Paused`, and
/// `accumulated_paused_ms` only grows when a resume commits the pause delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSession {
    pub session_id: String,
    pub phase: RunPhase,
    /// Unix timestamp in milliseconds
    pub start_time_ms: i64,
    pub pause_started_at_ms: Option<i64>,
    pub accumulated_paused_ms: i64,
}

impl RunSession {
    /// Create a tracking session starting at `start_time_ms`.
    pub fn new(session_id: impl Into<String>, start_time_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            phase: RunPhase::Tracking,
            start_time_ms,
            pause_started_at_ms: None,
            accumulated_paused_ms: 0,
        }
    }

    /// The instant duration is measured up to: `now`, or the pause start
    /// while paused so duration stays frozen.
    pub fn effective_now(&self, now_ms: i64) -> i64 {
        match (self.phase, self.pause_started_at_ms) {
            (RunPhase::Paused, Some(paused_at)) => paused_at,
            _ => now_ms,
        }
    }

    /// Active (non-paused) milliseconds since the start.
    pub fn active_ms(&self, now_ms: i64) -> i64 {
        self.effective_now(now_ms) - self.start_time_ms - self.accumulated_paused_ms
    }
}

/// Derived statistics of a run, always recomputable from the fix log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub distance_km: f64,
    pub duration_sec: f64,
    pub pace_min_per_km: f64,
    /// Unix timestamp in milliseconds of the computation
    pub last_updated_ms: i64,
    /// Fixes rejected by sanity filtering in the last computation
    #[serde(default)]
    pub outlier_count: u32,
}

impl RunStats {
    /// Stats of a run that has not moved yet.
    pub fn zeroed(now_ms: i64, default_pace_min_per_km: f64) -> Self {
        Self {
            distance_km: 0.0,
            duration_sec: 0.0,
            pace_min_per_km: default_pace_min_per_km,
            last_updated_ms: now_ms,
            outlier_count: 0,
        }
    }
}

/// The durable envelope of the active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRunState {
    pub session: RunSession,
    pub fixes: Vec<LocationFix>,
    pub stats: RunStats,
    /// Live milestone splits, merged first-crossing-wins
    #[serde(default)]
    pub splits: MilestoneSplits,
}

impl PersistedRunState {
    /// A fresh envelope with an empty fix log.
    pub fn new(session: RunSession, stats: RunStats) -> Self {
        Self {
            session,
            fixes: Vec::new(),
            stats,
            splits: MilestoneSplits::default(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.session.phase
    }

    /// The recorded path, in delivery order.
    pub fn path(&self) -> Vec<GpsPoint> {
        self.fixes.iter().map(LocationFix::point).collect()
    }

    /// Recompute stats from the whole log and merge newly reached splits.
    pub fn recompute(
        &mut self,
        stats: &StatsCalculator,
        splits: &MilestoneSplitCalculator,
        now_ms: i64,
    ) -> RunStats {
        let fresh = stats.compute(&self.fixes, &self.session, Some(&self.stats), now_ms);
        let reached = splits.compute(&self.fixes, fresh.distance_km);
        self.splits.merge_first_wins(&reached);
        self.stats = fresh;
        fresh
    }
}

// ============================================================================
// Tests
// ============================================================================
