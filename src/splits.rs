//! Milestone split times.
//!
//! A split is the elapsed time at which the run first reached a named
//! distance. The crossing instant is interpolated linearly inside the segment
//! that crosses the threshold, over the same accepted segments the distance
//! total is built from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{MilestoneThreshold, StatsConfig};
use crate::stats::{DistanceWalk, DISTANCE_EPSILON_KM};
use crate::LocationFix;

/// Elapsed seconds keyed by milestone (`"1k"`, `"5k"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MilestoneSplits(BTreeMap<String, f64>);

impl MilestoneSplits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, elapsed_sec: f64) {
        self.0.insert(key.into(), elapsed_sec);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add splits from `fresh` that are not recorded yet.
    ///
    /// Recorded splits never change. Returns the number of splits added.
    pub fn merge_first_wins(&mut self, fresh: &MilestoneSplits) -> usize {
        let mut added = 0;
        for (key, elapsed) in fresh.iter() {
            if !self.0.contains_key(key) {
                self.0.insert(key.to_string(), elapsed);
                added += 1;
            }
        }
        added
    }
}

/// Computes [`MilestoneSplits`] from a fix log.
#[derive(Debug, Clone)]
pub struct MilestoneSplitCalculator {
    milestones: Vec<MilestoneThreshold>,
    outlier_segment_km: f64,
}

impl Default for MilestoneSplitCalculator {
    fn default() -> Self {
        Self::new(MilestoneThreshold::standard(), &StatsConfig::default())
    }
}

impl MilestoneSplitCalculator {
    pub fn new(milestones: Vec<MilestoneThreshold>, stats: &StatsConfig) -> Self {
        Self {
            milestones,
            outlier_segment_km: stats.outlier_segment_km,
        }
    }

    pub fn milestones(&self) -> &[MilestoneThreshold] {
        &self.milestones
    }

    /// Split times for every milestone within `total_distance_km`.
    pub fn compute(&self, fixes: &[LocationFix], total_distance_km: f64) -> MilestoneSplits {
        let mut splits = MilestoneSplits::new();
        let walk = DistanceWalk::run(fixes, self.outlier_segment_km);
        let Some(first) = walk.first_fix else {
            return splits;
        };

        let mut pending: Vec<&MilestoneThreshold> = self
            .milestones
            .iter()
            .filter(|m| m.distance_km <= total_distance_km + DISTANCE_EPSILON_KM)
            .collect();
        pending.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

        let mut cumulative = 0.0;
        let mut next = 0;
        for segment in &walk.segments {
            let reached = cumulative + segment.length_km;

            while next < pending.len()
                && pending[next].distance_km <= reached + DISTANCE_EPSILON_KM
            {
                let milestone = pending[next];
                let fraction = if segment.length_km > 0.0 {
                    ((milestone.distance_km - cumulative) / segment.length_km).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                let span_ms = (segment.to.timestamp_ms - segment.from.timestamp_ms) as f64;
                let crossing_ms = segment.from.timestamp_ms as f64 + fraction * span_ms;
                splits.insert(
                    milestone.key.clone(),
                    (crossing_ms - first.timestamp_ms as f64) / 1000.0,
                );
                next += 1;
            }

            if next == pending.len() {
                break;
            }
            cumulative = reached;
        }

        splits
    }
}
