//! Runs every estimator for one driver and assembles the report.

use crate::blame::{aggregate, AutopsyReport, DataQuality, FactorEstimates};
use crate::config::{EngineConfig, UnknownCircuitPolicy};
use crate::costs::{car_pace_deficit, incident_impact, pit_execution_cost, qualifying_cost, stop_benchmark, tyre_degradation_cost};
use crate::data::{driver_rank, median, CsvLapProvider, LapDataProvider, Session, SessionKind};
use crate::mock::{MockLapProvider, MOCK_SOURCE_TAG};
use crate::model::Predictor;
use crate::simulator::{CounterfactualResult, CounterfactualSimulator, RaceContext};
use crate::strategy::StrategyErrorEstimator;
use crate::{BlameError, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Upper bound on drivers in one `compare` call.
pub const MAX_COMPARE_DRIVERS: usize = 5;

/// Reference lap for the tyre estimator: the trained circuit median, else this
/// race's clean-lap median, else the configured default.
fn reference_lap(predictor: &Predictor, race: &Session, config: &EngineConfig) -> f64 {
    if let Some(m) = predictor.trained_median(&race.event_name) {
        return m;
    }
    let clean: Vec<f64> = race
        .laps
        .iter()
        .filter(|l| l.is_clean())
        .filter_map(|l| l.lap_time_s)
        .collect();
    median(&clean).unwrap_or(config.default_circuit_median)
}

/// Stop benchmark for pit execution: `team_avg_stop_s` unless the field
/// median was asked for.
fn pit_benchmark(race: &Session, config: &EngineConfig) -> f64 {
    if config.field_stop_benchmark {
        stop_benchmark(&race.laps, config.team_avg_stop_s)
    } else {
        config.team_avg_stop_s
    }
}

/// Full blame breakdown for `driver` in one race.
///
/// The race session is required; a missing qualifying session only costs the
/// qualifying signal.
pub fn full_autopsy(
    provider: &dyn LapDataProvider,
    predictor: &Predictor,
    config: &EngineConfig,
    year: i32,
    gp: &str,
    driver: &str,
) -> Result<AutopsyReport> {
    let race = provider.get_session(year, gp, SessionKind::Race)?;
    let quali = match provider.get_session(year, gp, SessionKind::Qualifying) {
        Ok(q) => Some(q),
        Err(e) => {
            warn!("qualifying unavailable for {} {}: {}", year, gp, e);
            None
        }
    };

    let driver_laps = race.driver_laps(driver);
    if driver_laps.is_empty() {
        warn!("{} has no laps in {} {}", driver, year, gp);
    }
    let circuit = race.event_name.as_str();
    let track_temp = race.track_temp(config.default_track_temp);
    let ctx = RaceContext {
        circuit,
        season: year,
        track_temp,
        driver_rank: driver_rank(&race.laps, driver).unwrap_or(config.default_driver_rank),
    };

    let strategy = StrategyErrorEstimator::new(predictor, config.default_driver_rank).estimate(
        &driver_laps,
        &race.laps,
        driver,
        circuit,
        year,
        track_temp,
    );
    let estimates = FactorEstimates {
        qualifying_cost: qualifying_cost(&race, quali.as_ref(), driver),
        tyre_degradation: tyre_degradation_cost(&driver_laps, predictor, &ctx, reference_lap(predictor, &race, config)),
        pit_execution: pit_execution_cost(&driver_laps, pit_benchmark(&race, config)),
        strategy_error: strategy.as_estimate(),
        car_pace_deficit: car_pace_deficit(&race.laps, driver),
        incident_impact: incident_impact(&race.messages, &driver_laps),
    };

    let mut report = aggregate(driver, gp, year, &estimates, &driver_laps, race.drivers().len());

    let (_, in_vocabulary) = predictor.encoder().circuit_code(circuit);
    report.telemetry_source = provider.source_tag().to_string();
    report.method = predictor.method_for_circuit(circuit);
    report.model_metrics = predictor.metrics();
    report.circuit_in_vocabulary = predictor.is_trained() && in_vocabulary;
    report.low_confidence =
        predictor.is_trained() && !in_vocabulary && predictor.policy() == UnknownCircuitPolicy::Fallback;
    report.counterfactual = strategy.best;
    if report.telemetry_source == MOCK_SOURCE_TAG {
        report.data_quality = DataQuality::Mock;
    }

    info!(
        "{} {} {}: lost {:.3}s, primary {} | P{} (optimal P{}) | {:?} via {}",
        year,
        gp,
        driver,
        report.total_loss,
        report.primary_cause.key(),
        report.position.actual,
        report.position.optimal,
        report.data_quality,
        report.method.tag()
    );
    Ok(report)
}

type CacheKey = (i32, String, String);

fn cache_key(year: i32, gp: &str, driver: &str) -> CacheKey {
    (year, gp.trim().to_lowercase(), driver.trim().to_uppercase())
}

/// Owns the data source, predictor and a report cache.
pub struct BlameEngine {
    provider: Box<dyn LapDataProvider>,
    mock: MockLapProvider,
    predictor: Predictor,
    config: EngineConfig,
    cache: HashMap<CacheKey, AutopsyReport>,
}

impl BlameEngine {
    pub fn new(provider: Box<dyn LapDataProvider>, predictor: Predictor, config: EngineConfig) -> Self {
        Self {
            provider,
            mock: MockLapProvider::new(),
            predictor,
            config,
            cache: HashMap::new(),
        }
    }

    /// CSV provider rooted at `config.data_dir`, predictor from `config.model_path`.
    pub fn from_config(config: EngineConfig) -> Self {
        let predictor = Predictor::from_path(config.model_path.as_deref(), config.unknown_circuit_policy)
            .with_default_median(config.default_circuit_median);
        let provider = CsvLapProvider::new(config.data_dir.clone());
        Self::new(Box::new(provider), predictor, config)
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn can_fall_back(&self, err: &BlameError) -> bool {
        self.config.mock_fallback && matches!(err, BlameError::SourceUnavailable { .. })
    }

    pub fn autopsy(&mut self, year: i32, gp: &str, driver: &str) -> Result<AutopsyReport> {
        let key = cache_key(year, gp, driver);
        if let Some(hit) = self.cache.get(&key) {
            debug!("cache hit for {:?}", key);
            let mut report = hit.clone();
            report.from_cache = true;
            return Ok(report);
        }

        let report = match full_autopsy(self.provider.as_ref(), &self.predictor, &self.config, year, gp, driver) {
            Ok(r) => r,
            Err(e) if self.can_fall_back(&e) => {
                warn!("{}; serving synthetic data", e);
                full_autopsy(&self.mock, &self.predictor, &self.config, year, gp, driver)?
            }
            Err(e) => return Err(e),
        };
        self.cache.insert(key, report.clone());
        Ok(report)
    }

    /// Side-by-side autopsies for drivers of the same race.
    pub fn compare(&mut self, year: i32, gp: &str, drivers: &[&str]) -> Result<Vec<AutopsyReport>> {
        if drivers.len() > MAX_COMPARE_DRIVERS {
            return Err(BlameError::TooManyDrivers {
                max: MAX_COMPARE_DRIVERS,
                got: drivers.len(),
            });
        }
        drivers.iter().map(|d| self.autopsy(year, gp, d)).collect()
    }

    fn race_session(&self, year: i32, gp: &str) -> Result<Session> {
        match self.provider.get_session(year, gp, SessionKind::Race) {
            Ok(s) => Ok(s),
            Err(e) if self.can_fall_back(&e) => {
                warn!("{}; serving synthetic data", e);
                self.mock.get_session(year, gp, SessionKind::Race)
            }
            Err(e) => Err(e),
        }
    }

    /// Replays the race with the first stop moved to `alt_pit_lap`.
    pub fn simulate(&self, year: i32, gp: &str, driver: &str, alt_pit_lap: u32) -> Result<CounterfactualResult> {
        let race = self.race_session(year, gp)?;
        let ctx = RaceContext {
            circuit: &race.event_name,
            season: year,
            track_temp: race.track_temp(self.config.default_track_temp),
            driver_rank: driver_rank(&race.laps, driver).unwrap_or(self.config.default_driver_rank),
        };
        let sim = CounterfactualSimulator::new(&self.predictor);
        Ok(sim.simulate(&race.driver_laps(driver), driver, alt_pit_lap, &ctx))
    }
}
