//! Folds the six cost terms into totals, a position estimate and a verdict.

use crate::costs::{Estimate, NoSignal};
use crate::data::LapRecord;
use crate::model::{ModelMetrics, PredictionMethod};
use crate::simulator::CounterfactualResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Seconds of recoverable time worth one position.
pub const SECONDS_PER_POSITION: f64 = 2.5;
/// Seconds of car pace deficit per grid slot the car cannot climb past.
pub const PACE_PER_POSITION: f64 = 0.4;
/// Field size assumed when no session data is available at all.
pub const DEFAULT_FIELD_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlameFactor {
    QualifyingCost,
    TyreDegradation,
    PitExecution,
    StrategyError,
    CarPaceDeficit,
    IncidentImpact,
}

impl BlameFactor {
    /// Report order; ties for the primary cause go to the earlier entry.
    pub const ALL: [BlameFactor; 6] = [
        BlameFactor::QualifyingCost,
        BlameFactor::TyreDegradation,
        BlameFactor::PitExecution,
        BlameFactor::StrategyError,
        BlameFactor::CarPaceDeficit,
        BlameFactor::IncidentImpact,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            BlameFactor::QualifyingCost => "qualifying_cost",
            BlameFactor::TyreDegradation => "tyre_degradation",
            BlameFactor::PitExecution => "pit_execution",
            BlameFactor::StrategyError => "strategy_error",
            BlameFactor::CarPaceDeficit => "car_pace_deficit",
            BlameFactor::IncidentImpact => "incident_impact",
        }
    }
}

impl fmt::Display for BlameFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().replace('_', " "))
    }
}

/// Signed seconds per cause, ≤ 0. Every factor is always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BlameBreakdown {
    pub qualifying_cost: f64,
    pub tyre_degradation: f64,
    pub pit_execution: f64,
    pub strategy_error: f64,
    pub car_pace_deficit: f64,
    pub incident_impact: f64,
}

impl BlameBreakdown {
    pub fn get(&self, factor: BlameFactor) -> f64 {
        match factor {
            BlameFactor::QualifyingCost => self.qualifying_cost,
            BlameFactor::TyreDegradation => self.tyre_degradation,
            BlameFactor::PitExecution => self.pit_execution,
            BlameFactor::StrategyError => self.strategy_error,
            BlameFactor::CarPaceDeficit => self.car_pace_deficit,
            BlameFactor::IncidentImpact => self.incident_impact,
        }
    }

    fn set(&mut self, factor: BlameFactor, value: f64) {
        let slot = match factor {
            BlameFactor::QualifyingCost => &mut self.qualifying_cost,
            BlameFactor::TyreDegradation => &mut self.tyre_degradation,
            BlameFactor::PitExecution => &mut self.pit_execution,
            BlameFactor::StrategyError => &mut self.strategy_error,
            BlameFactor::CarPaceDeficit => &mut self.car_pace_deficit,
            BlameFactor::IncidentImpact => &mut self.incident_impact,
        };
        *slot = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlameFactor, f64)> + '_ {
        BlameFactor::ALL.into_iter().map(move |f| (f, self.get(f)))
    }

    /// `|Σ terms|`
    pub fn total_loss(&self) -> f64 {
        self.iter().map(|(_, v)| v).sum::<f64>().abs()
    }

    /// Most negative term, first in report order on ties.
    pub fn primary_cause(&self) -> BlameFactor {
        let mut primary = BlameFactor::QualifyingCost;
        let mut lowest = self.get(primary);
        for (factor, value) in self.iter() {
            if value < lowest {
                primary = factor;
                lowest = value;
            }
        }
        primary
    }
}

/// One estimate per factor, as produced by the estimators.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorEstimates {
    pub qualifying_cost: Estimate,
    pub tyre_degradation: Estimate,
    pub pit_execution: Estimate,
    pub strategy_error: Estimate,
    pub car_pace_deficit: Estimate,
    pub incident_impact: Estimate,
}

impl FactorEstimates {
    fn get(&self, factor: BlameFactor) -> &Estimate {
        match factor {
            BlameFactor::QualifyingCost => &self.qualifying_cost,
            BlameFactor::TyreDegradation => &self.tyre_degradation,
            BlameFactor::PitExecution => &self.pit_execution,
            BlameFactor::StrategyError => &self.strategy_error,
            BlameFactor::CarPaceDeficit => &self.car_pace_deficit,
            BlameFactor::IncidentImpact => &self.incident_impact,
        }
    }

    /// Breakdown with no-signal terms booked as 0.0, plus the reasons.
    pub fn resolve(&self) -> (BlameBreakdown, BTreeMap<BlameFactor, NoSignal>) {
        let mut blame = BlameBreakdown::default();
        let mut reasons = BTreeMap::new();
        for factor in BlameFactor::ALL {
            match self.get(factor) {
                Ok(v) if v.is_finite() => blame.set(factor, (*v).min(0.0)),
                Ok(_) => {
                    reasons.insert(factor, NoSignal::NonFinite);
                }
                Err(reason) => {
                    reasons.insert(factor, reason.clone());
                }
            }
        }
        (blame, reasons)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEstimate {
    pub actual: u32,
    pub optimal: u32,
    pub positions_lost: u32,
}

impl PositionEstimate {
    pub fn compute(actual: u32, total_loss: f64, car_pace_deficit: f64) -> Self {
        let actual = actual.max(1);
        let pace = car_pace_deficit.abs();
        let recoverable = (total_loss - pace).max(0.0);
        let positions_recoverable = (recoverable / SECONDS_PER_POSITION).floor() as u32;
        let car_limited_floor = ((pace / PACE_PER_POSITION).floor() as u32 + 1).max(1);

        // the upper bound wins when the car floor sits behind the actual result
        let optimal = actual
            .saturating_sub(positions_recoverable)
            .max(car_limited_floor)
            .min(actual)
            .max(1);
        Self {
            actual,
            optimal,
            positions_lost: actual - optimal,
        }
    }
}

/// Final classified position: last recorded position, else the back of the field.
pub fn actual_position(driver_laps: &[LapRecord], field_size: usize) -> u32 {
    driver_laps
        .iter()
        .rev()
        .find_map(|l| l.position.filter(|p| *p > 0))
        .unwrap_or(if field_size > 0 { field_size as u32 } else { DEFAULT_FIELD_SIZE })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQuality {
    High,
    Medium,
    Low,
    Mock,
}

impl DataQuality {
    pub fn from_missing(missing: usize) -> Self {
        match missing {
            0 => DataQuality::High,
            1 | 2 => DataQuality::Medium,
            _ => DataQuality::Low,
        }
    }
}

pub fn verdict(
    driver: &str,
    gp: &str,
    year: i32,
    blame: &BlameBreakdown,
    primary: BlameFactor,
    positions_lost: u32,
) -> String {
    let total = blame.total_loss();
    let share = if total > 0.0 {
        (blame.get(primary).abs() / total * 100.0).round()
    } else {
        0.0
    };
    format!(
        "{} at {} {}: The primary performance killer was {} accounting for {:.0}% of the total {:.1}s deficit. \
         Strategy decisions cost {:.2}s; tyre management added {:.2}s. \
         Combined these errors dropped the driver {} position{} from theoretical optimum.",
        driver,
        year,
        gp,
        primary,
        share,
        total,
        blame.strategy_error.abs(),
        blame.tyre_degradation.abs(),
        positions_lost,
        if positions_lost == 1 { "" } else { "s" }
    )
}

/// Full autopsy result for one driver in one race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopsyReport {
    pub driver: String,
    pub gp: String,
    pub year: i32,
    pub blame: BlameBreakdown,
    pub total_loss: f64,
    pub primary_cause: BlameFactor,
    pub position: PositionEstimate,
    pub verdict: String,
    pub telemetry_source: String,
    pub data_quality: DataQuality,
    pub method: PredictionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_metrics: Option<ModelMetrics>,
    pub circuit_in_vocabulary: bool,
    /// Set when an unseen circuit pushed the model onto the fallback curve.
    pub low_confidence: bool,
    pub no_signal: BTreeMap<BlameFactor, NoSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterfactual: Option<CounterfactualResult>,
    pub computed_at: DateTime<Utc>,
    pub from_cache: bool,
}

/// Builds the report core from the six estimates.
///
/// Source tags and model details are left at neutral values for the caller to
/// fill in.
pub fn aggregate(
    driver: &str,
    gp: &str,
    year: i32,
    estimates: &FactorEstimates,
    driver_laps: &[LapRecord],
    field_size: usize,
) -> AutopsyReport {
    let (blame, no_signal) = estimates.resolve();
    let total_loss = blame.total_loss();
    let primary_cause = blame.primary_cause();
    let position = PositionEstimate::compute(
        actual_position(driver_laps, field_size),
        total_loss,
        blame.car_pace_deficit,
    );
    let verdict = verdict(driver, gp, year, &blame, primary_cause, position.positions_lost);

    debug!(
        "{} {} {}: total {:.3}s, primary {}, P{} -> P{}, {} factor(s) without signal",
        year,
        gp,
        driver,
        total_loss,
        primary_cause.key(),
        position.actual,
        position.optimal,
        no_signal.len()
    );

    AutopsyReport {
        driver: driver.to_string(),
        gp: gp.to_string(),
        year,
        blame,
        total_loss,
        primary_cause,
        position,
        verdict,
        telemetry_source: String::new(),
        data_quality: DataQuality::from_missing(no_signal.len()),
        method: PredictionMethod::FallbackPolynomial,
        model_metrics: None,
        circuit_in_vocabulary: false,
        low_confidence: false,
        no_signal,
        counterfactual: None,
        computed_at: Utc::now(),
        from_cache: false,
    }
}
