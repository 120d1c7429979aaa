//! Cancellable periodic tasks.
//!
//! The foreground tick is the only timer in the engine. It is owned by a
//! [`TickHandle`]; dropping the handle cancels the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

/// A task run on every tick.
pub type PeriodicTask = Box<dyn FnMut() + Send>;

/// Runs periodic tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval` until the returned handle is cancelled.
    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask) -> TickHandle;
}

/// Owner of a scheduled task.
pub struct TickHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TickHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop the task. A tick already in progress runs to completion.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Thread Scheduler
// ============================================================================

/// One `std::thread` per periodic task.
///
/// The thread sleeps in `recv_timeout` on a channel; dropping the sender
/// (cancellation) wakes it immediately and ends the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule_periodic(&self, interval: Duration, mut task: PeriodicTask) -> TickHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("runtrack-tick".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        if let Err(e) = spawned {
            warn!("[ThreadScheduler] Failed to spawn tick thread: {}", e);
        } else {
            debug!("[ThreadScheduler] Tick every {:?}", interval);
        }

        // Not joined: cancel may be called from the tick thread itself.
        TickHandle::new(move || drop(stop_tx))
    }
}

// ============================================================================
// Manual Scheduler
// ============================================================================

struct ManualTask {
    cancelled: Arc<AtomicBool>,
    task: PeriodicTask,
}

/// A scheduler that only ticks when told to.
///
/// For hosts that own their own timer, and for deterministic tests.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Arc<Mutex<Vec<ManualTask>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every live task once. Returns how many ran.
    pub fn tick(&self) -> usize {
        let Ok(mut tasks) = self.tasks.lock() else {
            return 0;
        };
        tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        for entry in tasks.iter_mut() {
            (entry.task)();
        }
        tasks.len()
    }

    /// Number of scheduled, uncancelled tasks.
    pub fn live_tasks(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| !t.cancelled.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_periodic(&self, _interval: Duration, task: PeriodicTask) -> TickHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(ManualTask {
                cancelled: Arc::clone(&cancelled),
                task,
            });
        }
        TickHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}
