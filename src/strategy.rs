use crate::costs::{as_cost, Estimate, NoSignal};
use crate::data::{driver_rank, LapRecord};
use crate::model::Predictor;
use crate::simulator::{CounterfactualResult, CounterfactualSimulator, RaceContext, ReplayPlan, SimulationMethod};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Offsets tried either side of the actual stop.
pub const PIT_OFFSETS: [u32; 3] = [3, 6, 9];
pub const EARLIEST_PIT_LAP: u32 = 3;
/// Candidates never stop later than this many laps before the flag.
pub const LATE_PIT_MARGIN: u32 = 5;

/// Alternative stop laps around `actual`, clamped into the legal window.
pub fn candidate_laps(actual: u32, total_laps: u32) -> Vec<u32> {
    let upper = total_laps.saturating_sub(LATE_PIT_MARGIN).max(EARLIEST_PIT_LAP);
    PIT_OFFSETS
        .iter()
        .flat_map(|o| [actual.saturating_sub(*o), actual.saturating_add(*o)])
        .map(|lap| lap.max(EARLIEST_PIT_LAP).min(upper))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// Negated best saving, ≤ 0.
    pub cost_s: f64,
    /// Best alternative with a positive saving, if any.
    pub best: Option<CounterfactualResult>,
    pub method: SimulationMethod,
    pub candidates: Vec<CounterfactualResult>,
}

impl StrategyOutcome {
    fn without_signal(method: SimulationMethod) -> Self {
        Self {
            cost_s: 0.0,
            best: None,
            method,
            candidates: Vec::new(),
        }
    }

    pub fn as_estimate(&self) -> Estimate {
        match self.method {
            SimulationMethod::NoLapData => Err(NoSignal::NoLapData),
            SimulationMethod::NoPitFound => Err(NoSignal::NoPitStop),
            _ => Ok(self.cost_s),
        }
    }
}

/// Local search over the actual stop and six shifted alternatives.
pub struct StrategyErrorEstimator<'p> {
    simulator: CounterfactualSimulator<'p>,
    default_rank: f64,
}

impl<'p> StrategyErrorEstimator<'p> {
    pub fn new(predictor: &'p Predictor, default_rank: f64) -> Self {
        Self {
            simulator: CounterfactualSimulator::new(predictor),
            default_rank,
        }
    }

    pub fn estimate(
        &self,
        driver_laps: &[LapRecord],
        race_laps: &[LapRecord],
        driver: &str,
        circuit: &str,
        season: i32,
        track_temp: f64,
    ) -> StrategyOutcome {
        if driver_laps.is_empty() {
            return StrategyOutcome::without_signal(SimulationMethod::NoLapData);
        }
        let plan = match ReplayPlan::from_laps(driver_laps) {
            Some(p) => p,
            None => return StrategyOutcome::without_signal(SimulationMethod::NoPitFound),
        };
        let ctx = RaceContext {
            circuit,
            season,
            track_temp,
            driver_rank: driver_rank(race_laps, driver).unwrap_or(self.default_rank),
        };

        let candidates: Vec<CounterfactualResult> = candidate_laps(plan.actual_pit_lap, plan.total_laps)
            .into_iter()
            .map(|alt| self.simulator.simulate_plan(&plan, driver, alt, &ctx))
            .collect();

        let mut best: Option<&CounterfactualResult> = None;
        for c in candidates.iter().filter(|c| c.delta_s > 0.0) {
            if best.map_or(true, |b| c.delta_s > b.delta_s) {
                best = Some(c);
            }
        }
        let saving = best.map_or(0.0, |b| b.delta_s);
        let method = candidates
            .first()
            .map_or(SimulationMethod::FallbackPolynomial, |c| c.method);

        debug!(
            "{}: actual stop L{}, best alternative {:?} saves {:.3}s",
            driver,
            plan.actual_pit_lap,
            best.map(|b| b.alt_pit_lap),
            saving
        );

        StrategyOutcome {
            cost_s: as_cost(saving).unwrap_or(0.0),
            best: best.cloned(),
            method,
            candidates,
        }
    }
}
