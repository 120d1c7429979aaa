//! Tunable thresholds for sampling, statistics and milestones.
//!
//! The numeric defaults (100 m outlier segments, a 2-30 min/km pace band, the
//! 90% regression guard) are preserved as configuration rather than
//! re-derived; hosts can override any of them via JSON.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunTrackError};
use crate::store::StateCodec;

/// Subscription thresholds handed to the platform location service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplerConfig {
    /// Minimum movement between delivered fixes.
    /// Default: 5.0 meters
    pub min_distance_m: f64,

    /// Maximum time between delivered fixes.
    /// Default: 1000 ms
    pub max_interval_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 5.0,
            max_interval_ms: 1000,
        }
    }
}

/// Sanity bounds used by the [`StatsCalculator`](crate::StatsCalculator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatsConfig {
    /// A fix-to-fix segment longer than this is a GPS outlier.
    /// Default: 0.1 km
    pub outlier_segment_km: f64,

    /// Pace is reported as the default until this distance is covered.
    /// Default: 0.05 km
    pub min_pace_distance_km: f64,

    /// Fastest plausible pace. Default: 2.0 min/km
    pub min_pace_min_per_km: f64,

    /// Slowest plausible pace. Default: 30.0 min/km
    pub max_pace_min_per_km: f64,

    /// Pace reported when undefined or implausible. Default: 10.0 min/km
    pub default_pace_min_per_km: f64,

    /// A fresh distance below `previous * regression_ratio` keeps the previous value.
    /// Default: 0.9
    pub regression_ratio: f64,

    /// Lower clamp for duration. Default: 0.1 s
    pub min_duration_sec: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            outlier_segment_km: 0.1,
            min_pace_distance_km: 0.05,
            min_pace_min_per_km: 2.0,
            max_pace_min_per_km: 30.0,
            default_pace_min_per_km: 10.0,
            regression_ratio: 0.9,
            min_duration_sec: 0.1,
        }
    }
}

/// A named distance whose first crossing time is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneThreshold {
    pub key: String,
    pub distance_km: f64,
}

impl MilestoneThreshold {
    pub fn new(key: &str, distance_km: f64) -> Self {
        Self {
            key: key.to_string(),
            distance_km,
        }
    }

    /// 1k, 5k, 10k, half marathon and marathon.
    pub fn standard() -> Vec<Self> {
        vec![
            Self::new("1k", 1.0),
            Self::new("5k", 5.0),
            Self::new("10k", 10.0),
            Self::new("halfMarathon", 21.0975),
            Self::new("marathon", 42.195),
        ]
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    pub sampler: SamplerConfig,
    pub stats: StatsConfig,
    pub milestones: Vec<MilestoneThreshold>,

    /// Foreground tick period. Default: 1000 ms
    pub tick_interval_ms: u64,

    /// Used for the calories estimate handed off on stop. Default: 70 kg
    pub body_mass_kg: f64,

    /// Encoding of the persisted run envelope. Default: JSON
    pub codec: StateCodec,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            stats: StatsConfig::default(),
            milestones: MilestoneThreshold::standard(),
            tick_interval_ms: 1000,
            body_mass_kg: 70.0,
            codec: StateCodec::default(),
        }
    }
}

impl TrackerConfig {
    /// Parse a (possibly partial) JSON configuration; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json)
            .map_err(|e| RunTrackError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break the stats invariants.
    pub fn validate(&self) -> Result<()> {
        let stats = &self.stats;
        let positive = [
            ("outlierSegmentKm", stats.outlier_segment_km),
            ("minPaceDistanceKm", stats.min_pace_distance_km),
            ("minPaceMinPerKm", stats.min_pace_min_per_km),
            ("minDurationSec", stats.min_duration_sec),
            ("bodyMassKg", self.body_mass_kg),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(RunTrackError::config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if stats.max_pace_min_per_km <= stats.min_pace_min_per_km {
            return Err(RunTrackError::config(format!(
                "pace band is empty: [{}, {}]",
                stats.min_pace_min_per_km, stats.max_pace_min_per_km
            )));
        }
        if stats.default_pace_min_per_km < stats.min_pace_min_per_km
            || stats.default_pace_min_per_km > stats.max_pace_min_per_km
        {
            return Err(RunTrackError::config(format!(
                "default pace {} lies outside the pace band",
                stats.default_pace_min_per_km
            )));
        }
        if !(stats.regression_ratio > 0.0 && stats.regression_ratio <= 1.0) {
            return Err(RunTrackError::config(format!(
                "regressionRatio must be in (0, 1], got {}",
                stats.regression_ratio
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(RunTrackError::config("tickIntervalMs must be non-zero"));
        }
        if let Some(bad) = self
            .milestones
            .iter()
            .find(|m| !(m.distance_km.is_finite() && m.distance_km > 0.0))
        {
            return Err(RunTrackError::config(format!(
                "milestone '{}' has invalid distance {}",
                bad.key, bad.distance_km
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.milestones.len(), 5);
        assert_eq!(config.stats.outlier_segment_km, 0.1);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            TrackerConfig::from_json_str(r#"{"stats": {"outlierSegmentKm": 0.25}, "bodyMassKg": 62}"#)
                .unwrap();
        assert_eq!(config.stats.outlier_segment_km, 0.25);
        assert_eq!(config.stats.max_pace_min_per_km, 30.0);
        assert_eq!(config.body_mass_kg, 62.0);
        assert_eq!(config.sampler, SamplerConfig::default());
    }

    #[test]
    fn test_inverted_pace_band_rejected() {
        let result = TrackerConfig::from_json_str(
            r#"{"stats": {"minPaceMinPerKm": 12, "maxPaceMinPerKm": 4}}"#,
        );
        assert!(matches!(result, Err(RunTrackError::Config { .. })));
    }

    #[test]
    fn test_default_pace_outside_band_rejected() {
        let mut config = TrackerConfig::default();
        config.stats.default_pace_min_per_km = 45.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(
            TrackerConfig::from_json_str("{not json"),
            Err(RunTrackError::Config { .. })
        ));
    }
}
