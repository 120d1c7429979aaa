//! # Run Statistics
//!
//! Distance, duration and pace derived from the raw fix log.
//!
//! Nothing here is incremental: every call walks the entire log. That makes
//! the result idempotent and immune to the duplicate and out-of-order
//! deliveries an at-least-once sampler produces, and it lets the sampler and
//! the foreground tick race each other without corrupting anything.
//!
//! ## Outlier model
//!
//! The walk keeps an *anchor* (the last accepted fix). A fix further than
//! `outlier_segment_km` from the anchor is rejected and contributes nothing.
//! When two consecutive rejected fixes agree with each other the walk
//! re-anchors on the later one, crediting only the short segment between
//! them. A single spike therefore never counts, while a genuine relocation
//! (delivery gap, GPS re-acquisition) does not freeze distance forever.

use log::{debug, warn};

use crate::config::StatsConfig;
use crate::geo_utils::haversine_km;
use crate::{LocationFix, RunSession, RunStats};

/// Slack on distance comparisons. Haversine over coordinates built from a
/// round step length lands a few ULPs either side of that length, and a
/// segment of exactly the threshold is not an outlier.
pub const DISTANCE_EPSILON_KM: f64 = 1e-9;

/// A fix-to-fix segment accepted into the distance total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedSegment {
    pub from: LocationFix,
    pub to: LocationFix,
    pub length_km: f64,
}

/// Result of walking a fix log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceWalk {
    /// First fix of the normalized log (split times are measured from it)
    pub first_fix: Option<LocationFix>,
    pub segments: Vec<AcceptedSegment>,
    pub distance_km: f64,
    /// Fixes rejected as invalid coordinates or outlier segments
    pub outlier_count: u32,
}

impl DistanceWalk {
    /// Walk `fixes` with the given outlier threshold.
    pub fn run(fixes: &[LocationFix], outlier_segment_km: f64) -> Self {
        let limit_km = outlier_segment_km + DISTANCE_EPSILON_KM;
        let (normalized, invalid) = normalize_fixes(fixes);
        let mut walk = DistanceWalk {
            outlier_count: invalid,
            ..Default::default()
        };

        let mut iter = normalized.into_iter();
        let Some(first) = iter.next() else {
            return walk;
        };
        walk.first_fix = Some(first);

        let mut anchor = first;
        let mut pending: Option<LocationFix> = None;

        for fix in iter {
            let from_anchor = haversine_km(&anchor.point(), &fix.point());
            if from_anchor <= limit_km {
                walk.accept(anchor, fix, from_anchor);
                anchor = fix;
                pending = None;
                continue;
            }

            let from_pending = pending.map(|p| (p, haversine_km(&p.point(), &fix.point())));
            match from_pending {
                Some((rejected, length)) if length <= limit_km => {
                    debug!(
                        "[StatsCalculator] Re-anchoring after {:.3} km jump at t={}",
                        from_anchor, fix.timestamp_ms
                    );
                    walk.accept(rejected, fix, length);
                    anchor = fix;
                    pending = None;
                }
                _ => {
                    debug!(
                        "[StatsCalculator] Rejected outlier fix at t={} ({:.3} km from anchor)",
                        fix.timestamp_ms, from_anchor
                    );
                    walk.outlier_count += 1;
                    pending = Some(fix);
                }
            }
        }

        walk
    }

    fn accept(&mut self, from: LocationFix, to: LocationFix, length_km: f64) {
        self.distance_km += length_km;
        self.segments.push(AcceptedSegment {
            from,
            to,
            length_km,
        });
    }
}

/// Order by timestamp (stable), drop exact duplicates and invalid coordinates.
///
/// Returns the cleaned log and the number of invalid fixes dropped.
pub fn normalize_fixes(fixes: &[LocationFix]) -> (Vec<LocationFix>, u32) {
    let mut valid: Vec<LocationFix> = fixes.iter().filter(|f| f.is_valid()).copied().collect();
    let invalid = (fixes.len() - valid.len()) as u32;

    valid.sort_by_key(|f| f.timestamp_ms);

    let mut cleaned: Vec<LocationFix> = Vec::with_capacity(valid.len());
    for fix in valid {
        let duplicate = cleaned
            .iter()
            .rev()
            .take_while(|kept| kept.timestamp_ms == fix.timestamp_ms)
            .any(|kept| kept.is_duplicate_of(&fix));
        if !duplicate {
            cleaned.push(fix);
        }
    }

    (cleaned, invalid)
}

/// Pure computation of [`RunStats`] from a fix log and a session.
#[derive(Debug, Clone, Default)]
pub struct StatsCalculator {
    config: StatsConfig,
}

impl StatsCalculator {
    pub fn new(config: StatsConfig) -> Self {
        Self { config }
    }

    /// Walk the log with the configured outlier threshold.
    pub fn walk(&self, fixes: &[LocationFix]) -> DistanceWalk {
        DistanceWalk::run(fixes, self.config.outlier_segment_km)
    }

    /// Compute stats at `now_ms`.
    ///
    /// `previous` is the last stored stats of the same session; the surfaced
    /// distance never drops below it.
    pub fn compute(
        &self,
        fixes: &[LocationFix],
        session: &RunSession,
        previous: Option<&RunStats>,
        now_ms: i64,
    ) -> RunStats {
        let walk = self.walk(fixes);
        let distance_km = self.guard_regression(walk.distance_km, previous);
        let duration_sec = self.duration_sec(session, now_ms);

        RunStats {
            distance_km,
            duration_sec,
            pace_min_per_km: self.pace_min_per_km(distance_km, duration_sec),
            last_updated_ms: now_ms,
            outlier_count: walk.outlier_count,
        }
    }

    fn guard_regression(&self, fresh_km: f64, previous: Option<&RunStats>) -> f64 {
        let Some(previous) = previous else {
            return fresh_km;
        };
        if fresh_km >= previous.distance_km {
            return fresh_km;
        }

        if fresh_km < previous.distance_km * self.config.regression_ratio {
            warn!(
                "[StatsCalculator] Regression guard: recomputed {:.3} km < {:.0}% of stored {:.3} km, keeping stored",
                fresh_km,
                self.config.regression_ratio * 100.0,
                previous.distance_km
            );
        } else {
            debug!(
                "[StatsCalculator] Holding distance at {:.3} km (recomputed {:.3} km)",
                previous.distance_km, fresh_km
            );
        }
        previous.distance_km
    }

    /// Active seconds, excluding every paused interval, clamped to the minimum.
    pub fn duration_sec(&self, session: &RunSession, now_ms: i64) -> f64 {
        let active_sec = session.active_ms(now_ms) as f64 / 1000.0;
        active_sec.max(self.config.min_duration_sec)
    }

    /// Minutes per km within the sane band, or the configured default.
    pub fn pace_min_per_km(&self, distance_km: f64, duration_sec: f64) -> f64 {
        let config = &self.config;
        if distance_km < config.min_pace_distance_km {
            return config.default_pace_min_per_km;
        }

        let pace = (duration_sec / 60.0) / distance_km;
        if pace.is_finite()
            && pace >= config.min_pace_min_per_km
            && pace <= config.max_pace_min_per_km
        {
            pace
        } else {
            debug!("[StatsCalculator] Pace {:.2} min/km outside band, using default", pace);
            config.default_pace_min_per_km
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
