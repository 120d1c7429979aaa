//! The shared recompute pass.
//!
//! Both producers (sampler callback and foreground tick) run the same pass:
//! read the clock, then recompute stats and splits inside one store
//! transaction. Since the pass is a pure function of the log, concurrent
//! passes can only leave the stored stats briefly behind.

use std::sync::Arc;

use log::{debug, warn};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::splits::MilestoneSplitCalculator;
use crate::stats::StatsCalculator;
use crate::store::RunStateStore;
use crate::RunStats;

#[derive(Clone)]
pub struct Recomputer {
    store: Arc<RunStateStore>,
    clock: Arc<dyn Clock>,
    stats: StatsCalculator,
    splits: MilestoneSplitCalculator,
}

impl Recomputer {
    pub fn new(store: Arc<RunStateStore>, clock: Arc<dyn Clock>, config: &TrackerConfig) -> Self {
        Self {
            store,
            clock,
            stats: StatsCalculator::new(config.stats.clone()),
            splits: MilestoneSplitCalculator::new(config.milestones.clone(), &config.stats),
        }
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn stats(&self) -> &StatsCalculator {
        &self.stats
    }

    pub fn splits(&self) -> &MilestoneSplitCalculator {
        &self.splits
    }

    /// Recompute the tracking run, if any.
    pub fn run(&self) -> Result<Option<RunStats>> {
        let now = self.clock.now_ms();
        let fresh = self.store.recompute_stats(&self.stats, &self.splits, now)?;
        if let Some(stats) = &fresh {
            debug!(
                "[Recompute] {:.3} km, {:.1} s, {:.2} min/km",
                stats.distance_km, stats.duration_sec, stats.pace_min_per_km
            );
        }
        Ok(fresh)
    }

    /// [`run`](Self::run) for producers that cannot propagate errors.
    pub fn run_logged(&self, source: &str) {
        if let Err(e) = self.run() {
            warn!("[Recompute] {} pass failed: {}", source, e);
        }
    }
}

impl std::fmt::Debug for Recomputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recomputer")
            .field("store", &self.store)
            .field("stats", &self.stats)
            .finish()
    }
}
