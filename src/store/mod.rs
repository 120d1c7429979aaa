//! # Run State Store
//!
//! Durable home of the active run. The whole [`PersistedRunState`] lives
//! under one well-known key as a versioned envelope, so a restarted process
//! finds exactly what the previous one last committed.
//!
//! ## Layers
//!
//! 1. **[`KeyValueStore`]**: the minimal byte-level contract (`get`, `set`,
//!    `remove`, atomic `update`). Backends: [`MemoryStore`] and, with the
//!    `persistence` feature, [`SqliteStore`].
//! 2. **[`RunStateStore`]**: typed access with encode/decode, corruption
//!    handling and an explicit `open`/`close` lifecycle.
//!
//! Every mutation goes through [`RunStateStore::update`], which is a single
//! backend transaction. Writers are not sequenced relative to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunTrackError};
use crate::splits::MilestoneSplitCalculator;
use crate::stats::StatsCalculator;
use crate::{LocationFix, PersistedRunState, RunPhase, RunStats};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "persistence")]
mod sqlite;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteStore;

/// Key under which the active run envelope is stored.
pub const ACTIVE_RUN_KEY: &str = "runtrack.active_run";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Key-Value Contract
// ============================================================================

/// Outcome of an atomic read-modify-write on a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum KvUpdate {
    Keep,
    Set(Vec<u8>),
    Remove,
}

/// Minimal durable key-value contract required by the engine.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Read-modify-write `key` atomically. An error from `f` aborts the
    /// write and is returned unchanged.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<KvUpdate>,
    ) -> Result<()>;

    /// Release the underlying resources. Later calls fail with a storage error.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Byte encoding of the persisted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateCodec {
    #[default]
    Json,
    MessagePack,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a PersistedRunState,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    state: PersistedRunState,
}

impl StateCodec {
    pub fn encode(&self, state: &PersistedRunState) -> Result<Vec<u8>> {
        let envelope = EnvelopeRef {
            version: SCHEMA_VERSION,
            state,
        };
        let encoded = match self {
            StateCodec::Json => serde_json::to_vec(&envelope).map_err(|e| e.to_string()),
            StateCodec::MessagePack => rmp_serde::to_vec_named(&envelope).map_err(|e| e.to_string()),
        };
        encoded.map_err(|message| RunTrackError::Serialization { message })
    }

    /// Decode an envelope. Anything unreadable, including an unknown schema
    /// version, is `CorruptPersistedState`.
    pub fn decode(&self, bytes: &[u8]) -> Result<PersistedRunState> {
        let decoded: std::result::Result<Envelope, String> = match self {
            StateCodec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            StateCodec::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
        };
        let envelope = decoded.map_err(|message| RunTrackError::CorruptPersistedState { message })?;

        if envelope.version != SCHEMA_VERSION {
            return Err(RunTrackError::CorruptPersistedState {
                message: format!(
                    "unsupported schema version {} (expected {})",
                    envelope.version, SCHEMA_VERSION
                ),
            });
        }
        Ok(envelope.state)
    }
}

// ============================================================================
// Run State Store
// ============================================================================

/// What an [`RunStateStore::update`] closure wants written back.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Keep,
    Put(PersistedRunState),
    Clear,
}

/// Typed, crash-surviving store of the active run.
pub struct RunStateStore {
    backend: Arc<dyn KeyValueStore>,
    codec: StateCodec,
    key: String,
    closed: AtomicBool,
}

impl RunStateStore {
    /// Open a store over `backend` under [`ACTIVE_RUN_KEY`].
    pub fn open(backend: Arc<dyn KeyValueStore>, codec: StateCodec) -> Self {
        Self::open_with_key(backend, codec, ACTIVE_RUN_KEY)
    }

    /// Open a store under a custom key (several engines can share one backend).
    pub fn open_with_key(backend: Arc<dyn KeyValueStore>, codec: StateCodec, key: &str) -> Self {
        debug!("[RunStateStore] Opened (key={}, codec={:?})", key, codec);
        Self {
            backend,
            codec,
            key: key.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the store and its backend. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[RunStateStore] Closed (key={})", self.key);
        self.backend.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn codec(&self) -> StateCodec {
        self.codec
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RunTrackError::storage("run state store is closed"));
        }
        Ok(())
    }

    /// Load the active run, surfacing corruption as an error.
    pub fn load(&self) -> Result<Option<PersistedRunState>> {
        self.ensure_open()?;
        match self.backend.get(&self.key)? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The active run, if any. Corrupt or unreadable data reads as "no run".
    pub fn get(&self) -> Option<PersistedRunState> {
        match self.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("[RunStateStore] Treating active run as absent: {}", e);
                None
            }
        }
    }

    /// Replace the active run.
    pub fn put(&self, state: &PersistedRunState) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.codec.encode(state)?;
        self.backend.set(&self.key, &bytes)
    }

    /// Delete the active run.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.backend.remove(&self.key)
    }

    /// Atomic typed read-modify-write.
    ///
    /// The closure sees the current state (corrupt data as `None`) and decides
    /// what is written back; its second return value is passed through.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Option<PersistedRunState>) -> Result<(StateChange, T)>,
    {
        self.ensure_open()?;
        let codec = self.codec;
        let mut f = Some(f);
        let mut output = None;

        self.backend.update(&self.key, &mut |raw| {
            let f = f
                .take()
                .ok_or_else(|| RunTrackError::storage("update closure invoked twice"))?;
            let current = raw.and_then(|bytes| match codec.decode(bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("[RunStateStore] Overwriting unreadable state: {}", e);
                    None
                }
            });

            let (change, out) = f(current)?;
            output = Some(out);
            Ok(match change {
                StateChange::Keep => KvUpdate::Keep,
                StateChange::Put(state) => KvUpdate::Set(codec.encode(&state)?),
                StateChange::Clear => KvUpdate::Remove,
            })
        })?;

        output.ok_or_else(|| RunTrackError::storage("update closure was not invoked"))
    }

    /// Append a fix to the log of a tracking run.
    ///
    /// Returns `false` (and writes nothing) when there is no run or the run
    /// is not tracking; late fixes after pause/stop are dropped here.
    pub fn append_fix(&self, fix: LocationFix) -> Result<bool> {
        self.update(|state| match state {
            Some(mut state) if state.phase() == RunPhase::Tracking => {
                state.fixes.push(fix);
                Ok((StateChange::Put(state), true))
            }
            _ => Ok((StateChange::Keep, false)),
        })
    }

    /// Recompute the stats and splits of a tracking run in one transaction.
    ///
    /// Paused, stopped or absent runs are left untouched (`Ok(None)`).
    pub fn recompute_stats(
        &self,
        stats: &StatsCalculator,
        splits: &MilestoneSplitCalculator,
        now_ms: i64,
    ) -> Result<Option<RunStats>> {
        self.update(|state| match state {
            Some(mut state) if state.phase() == RunPhase::Tracking => {
                let fresh = state.recompute(stats, splits, now_ms);
                Ok((StateChange::Put(state), Some(fresh)))
            }
            _ => Ok((StateChange::Keep, None)),
        })
    }
}

impl std::fmt::Debug for RunStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateStore")
            .field("key", &self.key)
            .field("codec", &self.codec)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RunSession, RunStats};

    fn tracking_state() -> PersistedRunState {
        PersistedRunState::new(RunSession::new("run-1", 1_000), RunStats::zeroed(1_000, 10.0))
    }

    fn memory_store(codec: StateCodec) -> RunStateStore {
        RunStateStore::open(Arc::new(MemoryStore::new()), codec)
    }

    #[test]
    fn test_put_get_clear() {
        let store = memory_store(StateCodec::Json);
        assert!(store.get().is_none());

        store.put(&tracking_state()).unwrap();
        assert_eq!(store.get(), Some(tracking_state()));

        store.clear().unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_message_pack_codec() {
        let store = memory_store(StateCodec::MessagePack);
        let mut state = tracking_state();
        state.fixes.push(LocationFix::new(51.5, -0.12, 2_000));
        store.put(&state).unwrap();
        assert_eq!(store.get(), Some(state));
    }

    #[test]
    fn test_corrupt_data_reads_as_no_run() {
        let backend = Arc::new(MemoryStore::new());
        backend.set(ACTIVE_RUN_KEY, b"{\"version\": 1, \"state\": ").unwrap();
        let store = RunStateStore::open(backend, StateCodec::Json);

        assert!(store.get().is_none());
        assert!(matches!(
            store.load(),
            Err(RunTrackError::CorruptPersistedState { .. })
        ));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let mut json = serde_json::to_value(EnvelopeRef {
            version: SCHEMA_VERSION,
            state: &tracking_state(),
        })
        .unwrap();
        json["version"] = serde_json::json!(99);

        let backend = Arc::new(MemoryStore::new());
        backend
            .set(ACTIVE_RUN_KEY, &serde_json::to_vec(&json).unwrap())
            .unwrap();
        let store = RunStateStore::open(backend, StateCodec::Json);

        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("schema version 99"));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_append_fix_only_while_tracking() {
        let store = memory_store(StateCodec::Json);
        assert!(!store.append_fix(LocationFix::new(0.0, 0.0, 1)).unwrap());

        store.put(&tracking_state()).unwrap();
        assert!(store.append_fix(LocationFix::new(0.0, 0.0, 2)).unwrap());
        assert!(store.append_fix(LocationFix::new(0.0, 0.0, 2)).unwrap());
        assert_eq!(store.get().unwrap().fixes.len(), 2);

        let mut paused = store.get().unwrap();
        paused.session.phase = RunPhase::Paused;
        paused.session.pause_started_at_ms = Some(3);
        store.put(&paused).unwrap();
        assert!(!store.append_fix(LocationFix::new(0.0, 0.0, 4)).unwrap());
        assert_eq!(store.get().unwrap().fixes.len(), 2);
    }

    #[test]
    fn test_update_error_aborts_write() {
        let store = memory_store(StateCodec::Json);
        store.put(&tracking_state()).unwrap();

        let result: Result<()> = store.update(|state| {
            assert!(state.is_some());
            Err(RunTrackError::storage("boom"))
        });
        assert!(result.is_err());
        assert!(store.get().unwrap().fixes.is_empty());
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = memory_store(StateCodec::Json);
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.put(&tracking_state()),
            Err(RunTrackError::Storage { .. })
        ));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_recompute_stats_only_while_tracking() {
        let store = memory_store(StateCodec::Json);
        let stats = StatsCalculator::default();
        let splits = MilestoneSplitCalculator::default();
        assert_eq!(store.recompute_stats(&stats, &splits, 5_000).unwrap(), None);

        store.put(&tracking_state()).unwrap();
        store.append_fix(LocationFix::new(0.0, 0.0, 1_000)).unwrap();
        store.append_fix(LocationFix::new(0.0005, 0.0, 31_000)).unwrap();

        let fresh = store.recompute_stats(&stats, &splits, 31_000).unwrap().unwrap();
        assert!((fresh.distance_km - 0.0556).abs() < 1e-3);
        assert_eq!(fresh.duration_sec, 30.0);
        assert_eq!(store.get().unwrap().stats, fresh);

        let mut paused = store.get().unwrap();
        paused.session.phase = RunPhase::Paused;
        paused.session.pause_started_at_ms = Some(31_000);
        store.put(&paused).unwrap();
        assert_eq!(store.recompute_stats(&stats, &splits, 90_000).unwrap(), None);
        assert_eq!(store.get().unwrap().stats.last_updated_ms, 31_000);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(memory_store(StateCodec::Json));
        store.put(&tracking_state()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let ts = 10_000 + t * 1_000 + i;
                        store.append_fix(LocationFix::new(0.0, 0.0, ts)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get().unwrap().fixes.len(), 100);
    }
}
