//! Race autopsy and blame attribution.
//!
//! Given a driver and a race, estimates how much time was lost to each of six
//! causes and which finishing position was realistically achievable.
//!
//! ```text
//! LapDataProvider ──► Session ──┬─► costs (qualifying, tyres, pit, pace, incidents)
//!                               └─► strategy ──► simulator ──► Predictor ──► FeatureEncoder
//!                                                     │
//!                     blame::aggregate ◄──────────────┘
//! ```
//!
//! The predictor runs on injected [`model::ModelArtifacts`] when available and
//! on a closed-form degradation curve otherwise.

use std::path::PathBuf;
use thiserror::Error;

pub mod autopsy;
pub mod blame;
pub mod config;
pub mod costs;
pub mod data;
pub mod features;
pub mod mock;
pub mod model;
pub mod simulator;
pub mod strategy;
pub mod train;

pub use autopsy::{full_autopsy, BlameEngine};
pub use blame::{AutopsyReport, BlameBreakdown, BlameFactor, PositionEstimate};
pub use config::{EngineConfig, UnknownCircuitPolicy};
pub use data::{Compound, LapDataProvider, LapRecord, Session, SessionKind};
pub use features::{FeatureEncoder, FeatureVector};
pub use model::{ModelArtifacts, PredictionMethod, Predictor};
pub use simulator::CounterfactualResult;

#[derive(Error, Debug)]
pub enum BlameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lap data unavailable for {year} {gp} ({session}): {path}")]
    SourceUnavailable {
        year: i32,
        gp: String,
        session: SessionKind,
        path: PathBuf,
    },
    #[error("model error: {0}")]
    Model(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("compare takes at most {max} drivers, got {got}")]
    TooManyDrivers { max: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, BlameError>;
