//! Engine configuration, loaded from an optional JSON file.

use crate::{BlameError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// What to do when a circuit is missing from the trained vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCircuitPolicy {
    /// Encode as the midpoint vocabulary index and keep the trained model.
    #[default]
    Midpoint,
    /// Switch to the fallback curve and flag the report as low confidence.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the CSV session tree (`<root>/<year>/<gp>/R_laps.csv`).
    pub data_dir: PathBuf,
    /// Artifact bundle written by the trainer. Absent means fallback predictor.
    pub model_path: Option<PathBuf>,
    pub unknown_circuit_policy: UnknownCircuitPolicy,
    pub default_track_temp: f64,
    pub team_avg_stop_s: f64,
    /// Benchmark stops against the field median instead of `team_avg_stop_s`
    /// once enough stops were timed.
    pub field_stop_benchmark: bool,
    pub default_driver_rank: f64,
    pub default_circuit_median: f64,
    /// Serve synthetic data when the lap source is unreachable.
    pub mock_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_path: None,
            unknown_circuit_policy: UnknownCircuitPolicy::Midpoint,
            default_track_temp: 35.0,
            team_avg_stop_s: 2.4,
            field_stop_benchmark: false,
            default_driver_rank: 10.0,
            default_circuit_median: 90.0,
            mock_fallback: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading engine config from {:?}", path);
        let data = fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.team_avg_stop_s.is_finite() && self.team_avg_stop_s > 0.0) {
            return Err(BlameError::Config(format!(
                "team_avg_stop_s must be positive, got {}",
                self.team_avg_stop_s
            )));
        }
        if !(self.default_circuit_median.is_finite() && self.default_circuit_median > 0.0) {
            return Err(BlameError::Config(format!(
                "default_circuit_median must be positive, got {}",
                self.default_circuit_median
            )));
        }
        Ok(())
    }
}
