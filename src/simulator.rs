use crate::data::{first_pit_lap, Compound, LapRecord};
use crate::features::LapState;
use crate::model::{PredictionMethod, Predictor};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Share of the starting fuel load burnt by the flag.
pub const FUEL_BURN_FRACTION: f64 = 0.95;

pub fn fuel_load(lap: u32, total_laps: u32) -> f64 {
    if total_laps == 0 {
        return 1.0;
    }
    1.0 - (lap as f64 / total_laps as f64) * FUEL_BURN_FRACTION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMethod {
    MlModel,
    FallbackPolynomial,
    NoLapData,
    NoPitFound,
}

impl SimulationMethod {
    pub fn tag(&self) -> &'static str {
        match self {
            SimulationMethod::MlModel => "ml_model",
            SimulationMethod::FallbackPolynomial => "fallback_polynomial",
            SimulationMethod::NoLapData => "no_lap_data",
            SimulationMethod::NoPitFound => "no_pit_found",
        }
    }
}

impl From<PredictionMethod> for SimulationMethod {
    fn from(m: PredictionMethod) -> Self {
        match m {
            PredictionMethod::MlModel => SimulationMethod::MlModel,
            PredictionMethod::FallbackPolynomial => SimulationMethod::FallbackPolynomial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualResult {
    pub actual_pit_lap: Option<u32>,
    pub alt_pit_lap: u32,
    pub actual_total_s: f64,
    pub counter_total_s: f64,
    /// Positive when the actual strategy was slower than the alternative.
    pub delta_s: f64,
    pub method: SimulationMethod,
}

impl CounterfactualResult {
    fn empty(actual_pit_lap: Option<u32>, alt_pit_lap: u32, method: SimulationMethod) -> Self {
        Self {
            actual_pit_lap,
            alt_pit_lap,
            actual_total_s: 0.0,
            counter_total_s: 0.0,
            delta_s: 0.0,
            method,
        }
    }
}

/// Inputs held fixed across both timelines.
#[derive(Debug, Clone, Copy)]
pub struct RaceContext<'a> {
    pub circuit: &'a str,
    pub season: i32,
    pub track_temp: f64,
    pub driver_rank: f64,
}

/// What the replay needs from the observed race.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayPlan {
    pub total_laps: u32,
    pub actual_pit_lap: u32,
    pub start_compound: Compound,
    pub start_age: u32,
    /// Taken from the lap after the actual stop, whichever stop lap is replayed.
    pub post_pit_compound: Compound,
}

impl ReplayPlan {
    /// `None` when the driver has no laps or never stopped.
    pub fn from_laps(driver_laps: &[LapRecord]) -> Option<Self> {
        let first = driver_laps.first()?;
        let total_laps = driver_laps.iter().map(|l| l.lap_number).max()?;
        let actual_pit_lap = first_pit_lap(driver_laps)?;
        let post_pit_compound = driver_laps
            .iter()
            .find(|l| l.lap_number > actual_pit_lap)
            .map_or(first.compound, |l| l.compound);
        Some(Self {
            total_laps,
            actual_pit_lap,
            start_compound: first.compound,
            start_age: first.tyre_age.saturating_sub(1),
            post_pit_compound,
        })
    }
}

/// Replays a driver's race under two pit-lap hypotheses.
pub struct CounterfactualSimulator<'p> {
    predictor: &'p Predictor,
}

impl<'p> CounterfactualSimulator<'p> {
    pub fn new(predictor: &'p Predictor) -> Self {
        Self { predictor }
    }

    /// Total race time with the tyres changed at the start of `pit_lap`.
    pub fn race_time(&self, plan: &ReplayPlan, pit_lap: u32, ctx: &RaceContext<'_>) -> f64 {
        let encoder = self.predictor.encoder();
        let median = self.predictor.circuit_median(ctx.circuit);
        let mut compound = plan.start_compound;
        let mut tyre_age = plan.start_age as f64;
        let mut total = 0.0;

        for lap in 1..=plan.total_laps {
            if lap == pit_lap {
                compound = plan.post_pit_compound;
                tyre_age = 0.0;
            }
            tyre_age += 1.0;
            let fv = encoder.encode(&LapState {
                tyre_age,
                compound,
                fuel_load: fuel_load(lap, plan.total_laps),
                lap_number: lap,
                track_temp: ctx.track_temp,
                driver_rank: ctx.driver_rank,
                circuit: ctx.circuit,
                season: ctx.season,
            });
            total += median + self.predictor.predict(&fv);
        }
        total
    }

    pub fn simulate(
        &self,
        driver_laps: &[LapRecord],
        driver: &str,
        alt_pit_lap: u32,
        ctx: &RaceContext<'_>,
    ) -> CounterfactualResult {
        if driver_laps.is_empty() {
            debug!("{}: no laps to replay", driver);
            return CounterfactualResult::empty(None, alt_pit_lap, SimulationMethod::NoLapData);
        }
        let plan = match ReplayPlan::from_laps(driver_laps) {
            Some(p) => p,
            None => {
                debug!("{}: no pit stop in lap log", driver);
                return CounterfactualResult::empty(None, alt_pit_lap, SimulationMethod::NoPitFound);
            }
        };
        self.simulate_plan(&plan, driver, alt_pit_lap, ctx)
    }

    pub fn simulate_plan(
        &self,
        plan: &ReplayPlan,
        driver: &str,
        alt_pit_lap: u32,
        ctx: &RaceContext<'_>,
    ) -> CounterfactualResult {
        let alt_pit_lap = alt_pit_lap.clamp(1, plan.total_laps.max(1));
        let actual_total_s = self.race_time(plan, plan.actual_pit_lap, ctx);
        let counter_total_s = self.race_time(plan, alt_pit_lap, ctx);
        let delta_s = actual_total_s - counter_total_s;
        debug!(
            "{}: pit L{} vs L{} -> {:.3}s",
            driver, plan.actual_pit_lap, alt_pit_lap, delta_s
        );
        CounterfactualResult {
            actual_pit_lap: Some(plan.actual_pit_lap),
            alt_pit_lap,
            actual_total_s,
            counter_total_s,
            delta_s,
            method: self.predictor.method_for_circuit(ctx.circuit).into(),
        }
    }
}
