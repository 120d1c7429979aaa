//! # Location Sampling
//!
//! The platform location service is abstracted as a [`LocationProvider`].
//! A [`LocationSampler`] subscribes to it while a run is tracking and makes
//! every delivered fix durable before anything else sees it.
//!
//! Delivery is at-least-once: a provider may redeliver, reorder or skip
//! fixes, and nothing here tries to repair that. The stats layer recomputes
//! from the whole log and ignores duplicates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::SamplerConfig;
use crate::error::{Result, RunTrackError};
use crate::store::RunStateStore;
use crate::LocationFix;

/// Receives fixes from a provider subscription.
pub type FixSink = Arc<dyn Fn(LocationFix) + Send + Sync>;

/// Invoked by the sampler after a fix has been appended to the store.
pub type FixHandler = Arc<dyn Fn(LocationFix) + Send + Sync>;

// ============================================================================
// Provider Contract
// ============================================================================

/// Location access granted by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationPermissions {
    pub foreground: bool,
    pub background: bool,
}

impl LocationPermissions {
    pub fn granted() -> Self {
        Self {
            foreground: true,
            background: true,
        }
    }

    /// Tracking needs both: the run keeps recording with the screen off.
    pub fn all_granted(&self) -> bool {
        self.foreground && self.background
    }
}

/// Thresholds for a provider subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    pub min_distance_m: f64,
    pub max_interval_ms: u64,
    /// Keep delivering while the host app is backgrounded
    pub background: bool,
}

impl From<&SamplerConfig> for SubscriptionOptions {
    fn from(config: &SamplerConfig) -> Self {
        Self {
            min_distance_m: config.min_distance_m,
            max_interval_ms: config.max_interval_ms,
            background: true,
        }
    }
}

/// A live provider subscription.
pub trait LocationSubscription: Send {
    /// Stop delivery. Must be idempotent.
    fn cancel(&mut self);
}

/// The platform location service.
pub trait LocationProvider: Send + Sync {
    fn permissions(&self) -> LocationPermissions;

    /// Begin delivering fixes to `sink` until the subscription is cancelled.
    fn subscribe(
        &self,
        options: &SubscriptionOptions,
        sink: FixSink,
    ) -> Result<Box<dyn LocationSubscription>>;
}

// ============================================================================
// Push Provider
// ============================================================================

type SinkList = Arc<Mutex<Vec<(u64, FixSink)>>>;

/// Provider fed by the host: the platform layer (or a test) pushes fixes in.
pub struct PushLocationProvider {
    permissions: Mutex<LocationPermissions>,
    sinks: SinkList,
    next_id: AtomicU64,
}

impl PushLocationProvider {
    pub fn new(permissions: LocationPermissions) -> Self {
        Self {
            permissions: Mutex::new(permissions),
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// A provider with foreground and background access granted.
    pub fn granted() -> Self {
        Self::new(LocationPermissions::granted())
    }

    pub fn set_permissions(&self, permissions: LocationPermissions) {
        if let Ok(mut current) = self.permissions.lock() {
            *current = permissions;
        }
    }

    /// Deliver a fix to every live subscription. Returns how many received it.
    pub fn push(&self, fix: LocationFix) -> usize {
        // Sinks run outside the lock: they write to storage.
        let sinks: Vec<FixSink> = match self.sinks.lock() {
            Ok(sinks) => sinks.iter().map(|(_, sink)| Arc::clone(sink)).collect(),
            Err(_) => return 0,
        };
        for sink in &sinks {
            sink(fix);
        }
        sinks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for PushLocationProvider {
    fn default() -> Self {
        Self::granted()
    }
}

impl LocationProvider for PushLocationProvider {
    fn permissions(&self) -> LocationPermissions {
        self.permissions.lock().map(|p| *p).unwrap_or_default()
    }

    fn subscribe(
        &self,
        options: &SubscriptionOptions,
        sink: FixSink,
    ) -> Result<Box<dyn LocationSubscription>> {
        if !self.permissions().foreground {
            return Err(RunTrackError::Sampler {
                message: "foreground location access not granted".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks
            .lock()
            .map_err(|_| RunTrackError::Sampler {
                message: "push provider lock poisoned".to_string(),
            })?
            .push((id, sink));
        debug!(
            "[PushLocationProvider] Subscription {} ({} m / {} ms)",
            id, options.min_distance_m, options.max_interval_ms
        );

        Ok(Box::new(PushSubscription {
            id,
            sinks: Arc::clone(&self.sinks),
            cancelled: false,
        }))
    }
}

struct PushSubscription {
    id: u64,
    sinks: SinkList,
    cancelled: bool,
}

impl LocationSubscription for PushSubscription {
    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Shared, read-only view of whether a sampler holds a live subscription.
#[derive(Debug, Clone, Default)]
pub struct SamplerStatus(Arc<AtomicBool>);

impl SamplerStatus {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }
}

struct ActiveSubscription {
    halted: Arc<AtomicBool>,
    subscription: Box<dyn LocationSubscription>,
}

/// Subscribes to the provider and appends each fix to the store before
/// invoking the handler.
pub struct LocationSampler {
    provider: Arc<dyn LocationProvider>,
    store: Arc<RunStateStore>,
    options: SubscriptionOptions,
    active: Mutex<Option<ActiveSubscription>>,
    status: SamplerStatus,
}

impl LocationSampler {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        store: Arc<RunStateStore>,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            provider,
            store,
            options,
            active: Mutex::new(None),
            status: SamplerStatus::default(),
        }
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Start sampling. A running subscription is replaced.
    pub fn start(&self, handler: FixHandler) -> Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| RunTrackError::Sampler {
                message: "sampler lock poisoned".to_string(),
            })?;
        if let Some(previous) = active.take() {
            Self::halt(previous);
        }

        let halted = Arc::new(AtomicBool::new(false));
        let sink: FixSink = {
            let halted = Arc::clone(&halted);
            let store = Arc::clone(&self.store);
            Arc::new(move |fix: LocationFix| {
                if halted.load(Ordering::SeqCst) {
                    debug!("[LocationSampler] Dropped fix at t={} after stop", fix.timestamp_ms);
                    return;
                }
                match store.append_fix(fix) {
                    Ok(true) => handler(fix),
                    Ok(false) => {
                        debug!("[LocationSampler] Dropped fix at t={} (not tracking)", fix.timestamp_ms)
                    }
                    Err(e) => warn!("[LocationSampler] Failed to persist fix: {}", e),
                }
            })
        };

        let subscription = match self.provider.subscribe(&self.options, sink) {
            Ok(subscription) => subscription,
            Err(e) => {
                self.status.set(false);
                return Err(e);
            }
        };
        *active = Some(ActiveSubscription {
            halted,
            subscription,
        });
        self.status.set(true);
        info!("[LocationSampler] Started");
        Ok(())
    }

    /// Stop sampling. Fixes still in flight are dropped. Idempotent.
    pub fn stop(&self) {
        let previous = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        self.status.set(false);
        if let Some(previous) = previous {
            Self::halt(previous);
            info!("[LocationSampler] Stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// A handle that follows this sampler's running state.
    pub fn status(&self) -> SamplerStatus {
        self.status.clone()
    }

    fn halt(mut active: ActiveSubscription) {
        active.halted.store(true, Ordering::SeqCst);
        active.subscription.cancel();
    }
}

impl Drop for LocationSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LocationSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationSampler")
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
