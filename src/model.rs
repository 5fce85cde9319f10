use crate::config::UnknownCircuitPolicy;
use crate::data::Compound;
use crate::features::{compound_from_code, CircuitVocabulary, FeatureEncoder, FeatureVector, FEATURE_COLS, N_FEATURES};
use crate::{BlameError, Result};
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{concatenate, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Reference lap time when neither metadata nor config say otherwise.
pub const DEFAULT_CIRCUIT_MEDIAN: f64 = 90.0;

/// Per-lap time cost of carrying a full tank relative to an empty one.
const FUEL_EFFECT_S: f64 = 0.08;

/// Weight of the anchor rows that keep the normal equations well-posed when
/// features are collinear (fuel load vs lap number within a single race).
const ANCHOR_WEIGHT: f64 = 1e-3;

/// Seconds lost per lap of tyre age on the fallback curve.
pub fn fallback_rate(compound: Compound) -> f64 {
    match compound {
        Compound::Soft => 0.09,
        Compound::Medium => 0.055,
        Compound::Hard => 0.03,
        Compound::Intermediate => 0.07,
        Compound::Wet => 0.05,
    }
}

/// `tyre_age × compound_rate + (1 − fuel_load) × 0.08`
pub fn fallback_delta(features: &FeatureVector) -> f64 {
    let compound = compound_from_code(features.compound_code).unwrap_or(Compound::Medium);
    features.tyre_age * fallback_rate(compound) + (1.0 - features.fuel_load) * FUEL_EFFECT_S
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    MlModel,
    FallbackPolynomial,
}

impl PredictionMethod {
    pub fn tag(&self) -> &'static str {
        match self {
            PredictionMethod::MlModel => "ml_model",
            PredictionMethod::FallbackPolynomial => "fallback_polynomial",
        }
    }
}

/// Standard scaler: `(x - mean) / scale`, with zero-variance columns left unscaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| BlameError::Model("cannot fit scaler on zero rows".into()))?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 && s.is_finite() { s } else { 1.0 });
        Ok(Self {
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        })
    }

    pub fn transform(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        let mean = ArrayView1::from(&self.mean[..]);
        let scale = ArrayView1::from(&self.scale[..]);
        (&x - &mean) / &scale
    }

    pub fn transform_rows(&self, x: &Array2<f64>) -> Array2<f64> {
        let mean = ArrayView1::from(&self.mean[..]);
        let scale = ArrayView1::from(&self.scale[..]);
        (x - &mean) / &scale
    }
}

/// Linear regression over scaled features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDeltaModel {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LinearDeltaModel {
    /// Least-squares fit on already-scaled rows.
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>) -> Result<Self> {
        let (n, d) = x.dim();
        if n == 0 || n != y.len() {
            return Err(BlameError::Model(format!(
                "need matching non-empty rows, got {} features rows and {} targets",
                n,
                y.len()
            )));
        }
        let y_mean = y.mean().unwrap_or(0.0);

        // one scaled unit row per column plus an origin row, all targeting the mean
        let mut anchors = Array2::<f64>::zeros((d + 1, d));
        for i in 0..d {
            anchors[[i, i]] = ANCHOR_WEIGHT;
        }
        let records = concatenate(Axis(0), &[x.view(), anchors.view()])
            .map_err(|e| BlameError::Model(e.to_string()))?;
        let targets = concatenate(Axis(0), &[y.view(), Array1::from_elem(d + 1, y_mean).view()])
            .map_err(|e| BlameError::Model(e.to_string()))?;

        let ds = Dataset::new(records, targets);
        let fitted = LinearRegression::new()
            .fit(&ds)
            .map_err(|e| BlameError::Model(e.to_string()))?;

        Ok(Self {
            weights: fitted.params().to_vec(),
            intercept: fitted.intercept(),
        })
    }

    pub fn predict(&self, scaled: ArrayView1<'_, f64>) -> f64 {
        ArrayView1::from(&self.weights[..]).dot(&scaled) + self.intercept
    }

    /// `|wᵢ| / Σ|w|` per named column, rounded to four places. All zero when
    /// every weight is zero.
    pub fn importance(&self, names: &[&str]) -> BTreeMap<String, f64> {
        let total: f64 = self.weights.iter().map(|w| w.abs()).sum();
        names
            .iter()
            .zip(&self.weights)
            .map(|(name, w)| {
                let share = if total > 0.0 { w.abs() / total } else { 0.0 };
                (name.to_string(), round_to(share, 4))
            })
            .collect()
    }
}

/// Ages at which the fitted degradation rate is reported.
const RATE_AGES: [f64; 3] = [5.0, 15.0, 25.0];
/// A cliff is where the rate exceeds this multiple of the early rate...
const CLIFF_RATE_RATIO: f64 = 2.2;
/// ...and this many seconds per lap.
const CLIFF_MIN_RATE_S: f64 = 0.25;
const CLIFF_SEARCH: std::ops::Range<u32> = 5..55;

fn round_to(x: f64, places: i32) -> f64 {
    let k = 10f64.powi(places);
    (x * k).round() / k
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegradationRates {
    pub early: f64,
    pub mid: f64,
    pub late: f64,
}

/// `lap_time = a·age² + b·age + c` for one circuit and compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationCurve {
    /// `[a, b, c]`
    pub coeffs: [f64; 3],
    /// Seconds lost per lap at ages 5, 15 and 25.
    pub rates: DegradationRates,
    /// First age where the rate runs away, if it does within 55 laps.
    pub cliff_lap: Option<u32>,
    pub samples: usize,
    /// Predicted time on a one-lap-old set.
    pub base_time: f64,
}

impl DegradationCurve {
    /// Least-squares quadratic through `(tyre_age, lap_time)` points. `None` when
    /// there are fewer than three distinct ages or the fit is not finite.
    pub fn fit(points: &[(f64, f64)]) -> Option<Self> {
        let mut ages: Vec<f64> = points.iter().map(|(a, _)| *a).collect();
        ages.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        ages.dedup();
        if ages.len() < 3 {
            return None;
        }

        let rows: Vec<f64> = points.iter().flat_map(|(a, _)| [*a, a * a]).collect();
        let records = Array2::from_shape_vec((points.len(), 2), rows).ok()?;
        let targets: Array1<f64> = points.iter().map(|(_, t)| *t).collect();
        let fitted = match LinearRegression::new().fit(&Dataset::new(records, targets)) {
            Ok(f) => f,
            Err(e) => {
                warn!("degradation fit failed: {}", e);
                return None;
            }
        };
        let (b, a, c) = (fitted.params()[0], fitted.params()[1], fitted.intercept());
        if !(a.is_finite() && b.is_finite() && c.is_finite()) {
            return None;
        }

        let rate = |age: f64| 2.0 * a * age + b;
        let rates = DegradationRates {
            early: round_to(rate(RATE_AGES[0]), 4),
            mid: round_to(rate(RATE_AGES[1]), 4),
            late: round_to(rate(RATE_AGES[2]), 4),
        };
        let cliff_lap = CLIFF_SEARCH.into_iter().find(|age| {
            let r = rate(f64::from(*age));
            r > rates.early * CLIFF_RATE_RATIO && r > CLIFF_MIN_RATE_S
        });

        Some(Self {
            coeffs: [round_to(a, 6), round_to(b, 6), round_to(c, 6)],
            rates,
            cliff_lap,
            samples: points.len(),
            base_time: round_to(a + b + c, 3),
        })
    }
}

/// Fitted curves keyed by circuit name, then compound.
pub type DegradationCurves = BTreeMap<String, BTreeMap<Compound, DegradationCurve>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub trained_at: String,
    pub training_laps: usize,
    pub test_laps: usize,
    pub mae_seconds: f64,
    pub r2_score: f64,
    pub feature_cols: Vec<String>,
    /// Median lap time keyed by circuit index.
    pub circuit_medians: BTreeMap<usize, f64>,
    pub circuit_classes: Vec<String>,
    /// Share of `Σ|weight|` carried by each scaled feature.
    #[serde(default)]
    pub feature_importance: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae_seconds: f64,
    pub r2_score: f64,
}

/// Everything the trained path needs, bundled so it can be injected as one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifacts {
    pub scaler: FeatureScaler,
    pub model: LinearDeltaModel,
    pub metadata: ModelMetadata,
    #[serde(default)]
    pub deg_curves: DegradationCurves,
}

impl ModelArtifacts {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let txt = fs::read_to_string(path)?;
        let artifacts: ModelArtifacts = serde_json::from_str(&txt)?;
        artifacts.validate()?;
        info!(
            "Loaded model artifacts from {:?} (MAE {:.3}s, R² {:.3}, {} circuits)",
            path,
            artifacts.metadata.mae_seconds,
            artifacts.metadata.r2_score,
            artifacts.metadata.circuit_classes.len()
        );
        Ok(artifacts)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let txt = serde_json::to_string_pretty(self)?;
        fs::write(path, txt)?;
        Ok(())
    }

    /// Writes just the degradation curves, for consumers that do not need the model.
    pub fn save_deg_curves(&self, path: impl AsRef<Path>) -> Result<()> {
        let txt = serde_json::to_string_pretty(&self.deg_curves)?;
        fs::write(path, txt)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [self.scaler.mean.len(), self.scaler.scale.len(), self.model.weights.len()];
        if dims.iter().any(|d| *d != N_FEATURES) {
            return Err(BlameError::Model(format!(
                "expected {} features, artifacts carry {:?}",
                N_FEATURES, dims
            )));
        }
        let expected: Vec<&str> = FEATURE_COLS.to_vec();
        if !self.metadata.feature_cols.is_empty() && self.metadata.feature_cols != expected {
            return Err(BlameError::Model(format!(
                "feature order mismatch: {:?}",
                self.metadata.feature_cols
            )));
        }
        Ok(())
    }

    pub fn vocabulary(&self) -> CircuitVocabulary {
        CircuitVocabulary::new(self.metadata.circuit_classes.clone())
    }

    pub fn metrics(&self) -> ModelMetrics {
        ModelMetrics {
            mae_seconds: self.metadata.mae_seconds,
            r2_score: self.metadata.r2_score,
        }
    }
}

/// Lap-time delta predictor. Holds the trained artifacts when there are any.
#[derive(Debug, Clone)]
pub struct Predictor {
    artifacts: Option<ModelArtifacts>,
    encoder: FeatureEncoder,
    policy: UnknownCircuitPolicy,
    default_median: f64,
}

impl Predictor {
    pub fn new(artifacts: Option<ModelArtifacts>, policy: UnknownCircuitPolicy) -> Self {
        let encoder = artifacts
            .as_ref()
            .map(|a| FeatureEncoder::new(a.vocabulary()))
            .unwrap_or_default();
        Self {
            artifacts,
            encoder,
            policy,
            default_median: DEFAULT_CIRCUIT_MEDIAN,
        }
    }

    pub fn fallback() -> Self {
        Self::new(None, UnknownCircuitPolicy::default())
    }

    /// Loads artifacts from `path`; any failure leaves the predictor on the fallback curve.
    pub fn from_path(path: Option<&Path>, policy: UnknownCircuitPolicy) -> Self {
        let artifacts = match path {
            Some(p) => match ModelArtifacts::load(p) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("model artifacts unavailable ({}), using fallback curve", e);
                    None
                }
            },
            None => {
                debug!("no model path configured, using fallback curve");
                None
            }
        };
        Self::new(artifacts, policy)
    }

    pub fn with_default_median(mut self, median: f64) -> Self {
        self.default_median = median;
        self
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn is_trained(&self) -> bool {
        self.artifacts.is_some()
    }

    pub fn metrics(&self) -> Option<ModelMetrics> {
        self.artifacts.as_ref().map(ModelArtifacts::metrics)
    }

    pub fn policy(&self) -> UnknownCircuitPolicy {
        self.policy
    }

    fn method(&self, circuit_known: bool) -> PredictionMethod {
        match (&self.artifacts, circuit_known, self.policy) {
            (None, _, _) => PredictionMethod::FallbackPolynomial,
            (Some(_), false, UnknownCircuitPolicy::Fallback) => PredictionMethod::FallbackPolynomial,
            (Some(_), _, _) => PredictionMethod::MlModel,
        }
    }

    pub fn method_for(&self, features: &FeatureVector) -> PredictionMethod {
        self.method(features.circuit_known)
    }

    /// Method used for every lap at `circuit`.
    pub fn method_for_circuit(&self, circuit: &str) -> PredictionMethod {
        let (_, known) = self.encoder.circuit_code(circuit);
        self.method(known)
    }

    /// Predicted delta (s) against the circuit median. Never fails.
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        let artifacts = match (self.method_for(features), &self.artifacts) {
            (PredictionMethod::MlModel, Some(a)) => a,
            _ => return fallback_delta(features),
        };
        let raw = features.as_array();
        let scaled = artifacts.scaler.transform(ArrayView1::from(&raw[..]));
        let delta = artifacts.model.predict(scaled.view());
        if delta.is_finite() {
            delta
        } else {
            warn!("non-finite model output for {:?}, using fallback curve", features);
            fallback_delta(features)
        }
    }

    /// Median recorded for `circuit` at training time, if there is one.
    pub fn trained_median(&self, circuit: &str) -> Option<f64> {
        self.artifacts
            .as_ref()
            .and_then(|a| {
                let idx = self.encoder.vocabulary().index_of(circuit)?;
                a.metadata.circuit_medians.get(&idx).copied()
            })
            .filter(|m| m.is_finite() && *m > 0.0)
    }

    /// Historical median lap time for `circuit`.
    pub fn circuit_median(&self, circuit: &str) -> f64 {
        self.trained_median(circuit).unwrap_or(self.default_median)
    }
}
