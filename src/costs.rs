//! Independent cost estimators.
//!
//! Each estimator turns raw session data into one signed cost (seconds, ≤ 0).
//! When the inputs cannot support an estimate the estimator says why through
//! [`NoSignal`] instead of guessing; the aggregator books those as 0.0.

use crate::data::{clean_medians, median, pit_out_laps, stints, LapRecord, RaceControlMessage, Session};
use crate::features::LapState;
use crate::model::Predictor;
use crate::simulator::{fuel_load, RaceContext};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Traffic cost per grid slot behind pole.
pub const GRID_SLOT_COST_S: f64 = 0.12;
/// Share of excess lap time booked against tyre management.
pub const TYRE_ATTRIBUTION: f64 = 0.6;
pub const TYRE_COST_CAP_S: f64 = 8.0;
/// Minimum stint length worth judging.
pub const MIN_STINT_LAPS: usize = 3;
/// Field medians trimmed from each end before taking the reference pace.
pub const FIELD_TRIM: usize = 3;
/// Stops needed before the field median replaces the configured benchmark.
pub const MIN_FIELD_STOPS: usize = 3;
pub const YELLOW_COST_S: f64 = 0.08;
pub const MISSED_SC_PIT_COST_S: f64 = 1.2;
/// A stop within this many laps of a deployment counts as using it.
pub const SC_PIT_WINDOW_LAPS: u32 = 2;

/// Why an estimator produced no number.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoSignal {
    #[error("no laps recorded for driver")]
    NoLapData,
    #[error("no clean green-flag laps")]
    NoCleanLaps,
    #[error("qualifying session unavailable")]
    NoQualifyingSession,
    #[error("no timed qualifying lap for driver")]
    NoQualifyingLap,
    #[error("no pit stop in lap log")]
    NoPitStop,
    #[error("pit stops without usable in/out timings")]
    NoPitTimings,
    #[error("field too small to trim ({0} drivers)")]
    InsufficientField(usize),
    #[error("race control log is empty")]
    NoRaceControl,
    #[error("estimate was not a finite number")]
    NonFinite,
}

pub type Estimate = std::result::Result<f64, NoSignal>;

pub fn round_ms(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Books a non-negative loss as a signed cost at millisecond resolution.
pub fn as_cost(loss: f64) -> Estimate {
    if !loss.is_finite() {
        return Err(NoSignal::NonFinite);
    }
    let cost = -round_ms(loss.max(0.0));
    Ok(if cost == 0.0 { 0.0 } else { cost })
}

/// Grid slot: recorded grid, else qualifying rank, else pole.
pub fn grid_position(race: &Session, quali: &Session, driver: &str) -> u32 {
    let key = driver.to_uppercase();
    if let Some(g) = race.grid.get(&key) {
        return *g;
    }
    let mine = match quali.best_lap(driver) {
        Some(t) => t,
        None => return 1,
    };
    let faster = quali
        .drivers()
        .iter()
        .filter(|d| !d.eq_ignore_ascii_case(driver))
        .filter_map(|d| quali.best_lap(d))
        .filter(|t| *t < mine)
        .count();
    faster as u32 + 1
}

/// `-(gap_to_pole + max(0, (grid − 1) × 0.12))`
pub fn qualifying_cost(race: &Session, quali: Option<&Session>, driver: &str) -> Estimate {
    let quali = quali.ok_or(NoSignal::NoQualifyingSession)?;
    let best = quali.best_lap(driver).ok_or(NoSignal::NoQualifyingLap)?;
    let pole = quali.pole_lap().ok_or(NoSignal::NoQualifyingLap)?;
    let gap_to_pole = (best - pole).max(0.0);
    let grid = grid_position(race, quali, driver);
    let traffic = (grid.saturating_sub(1) as f64 * GRID_SLOT_COST_S).max(0.0);
    as_cost(gap_to_pole + traffic)
}

/// Excess over the predicted lap in every judged stint, 60% attributed to the
/// tyres and capped at 8 s.
pub fn tyre_degradation_cost(
    driver_laps: &[LapRecord],
    predictor: &Predictor,
    ctx: &RaceContext<'_>,
    reference_s: f64,
) -> Estimate {
    if driver_laps.is_empty() {
        return Err(NoSignal::NoLapData);
    }
    let total_laps = driver_laps.iter().map(|l| l.lap_number).max().unwrap_or(0);
    let encoder = predictor.encoder();

    let mut judged = 0usize;
    let mut loss = 0.0;
    for stint in stints(driver_laps) {
        let clean: Vec<&LapRecord> = stint.into_iter().filter(|l| l.is_clean()).collect();
        if clean.len() < MIN_STINT_LAPS {
            continue;
        }
        for lap in clean {
            let actual = match lap.lap_time_s {
                Some(t) => t,
                None => continue,
            };
            let fv = encoder.encode(&LapState {
                tyre_age: lap.tyre_age as f64,
                compound: lap.compound,
                fuel_load: fuel_load(lap.lap_number, total_laps),
                lap_number: lap.lap_number,
                track_temp: ctx.track_temp,
                driver_rank: ctx.driver_rank,
                circuit: ctx.circuit,
                season: ctx.season,
            });
            let predicted = reference_s + predictor.predict(&fv);
            let excess = (actual - predicted).max(0.0);
            if excess.is_finite() {
                loss += excess * TYRE_ATTRIBUTION;
                judged += 1;
            }
        }
    }
    if judged == 0 {
        return Err(NoSignal::NoCleanLaps);
    }
    as_cost(loss.min(TYRE_COST_CAP_S))
}

/// Stationary time for each stop: a pit-in timestamp paired with the first
/// pit-out timestamp at or after it.
pub fn stop_durations(driver_laps: &[LapRecord]) -> Vec<f64> {
    let mut out = Vec::new();
    for (i, lap) in driver_laps.iter().enumerate() {
        let t_in = match lap.pit_in_s {
            Some(t) => t,
            None => continue,
        };
        let t_out = driver_laps[i..]
            .iter()
            .filter_map(|l| l.pit_out_s)
            .find(|t| *t >= t_in);
        if let Some(t_out) = t_out {
            let d = t_out - t_in;
            if d.is_finite() {
                out.push(d);
            }
        }
    }
    out
}

/// Field median stop when enough stops were timed, else `default_s`.
pub fn stop_benchmark(race_laps: &[LapRecord], default_s: f64) -> f64 {
    let mut drivers: Vec<&str> = race_laps.iter().map(|l| l.driver.as_str()).collect();
    drivers.sort_unstable();
    drivers.dedup();

    let mut all = Vec::new();
    for d in drivers {
        let mut laps: Vec<LapRecord> = race_laps.iter().filter(|l| l.driver == d).cloned().collect();
        laps.sort_by_key(|l| l.lap_number);
        all.extend(stop_durations(&laps));
    }
    if all.len() >= MIN_FIELD_STOPS {
        median(&all).unwrap_or(default_s)
    } else {
        default_s
    }
}

/// `-Σ max(0, stop_time − benchmark)`
pub fn pit_execution_cost(driver_laps: &[LapRecord], benchmark_s: f64) -> Estimate {
    if driver_laps.is_empty() {
        return Err(NoSignal::NoLapData);
    }
    let has_stop = driver_laps.iter().any(|l| l.pit_in_s.is_some() || l.pit_out_s.is_some());
    if !has_stop {
        return Err(NoSignal::NoPitStop);
    }
    let stops = stop_durations(driver_laps);
    if stops.is_empty() {
        return Err(NoSignal::NoPitTimings);
    }
    as_cost(stops.iter().map(|s| (s - benchmark_s).max(0.0)).sum())
}

/// Driver's clean median against the trimmed field median.
pub fn car_pace_deficit(race_laps: &[LapRecord], driver: &str) -> Estimate {
    let medians = clean_medians(race_laps);
    let mine = medians
        .iter()
        .find(|(d, _)| d.eq_ignore_ascii_case(driver))
        .map(|(_, m)| *m)
        .ok_or(NoSignal::NoCleanLaps)?;

    let mut field: Vec<f64> = medians.values().copied().collect();
    if field.len() <= FIELD_TRIM * 2 {
        return Err(NoSignal::InsufficientField(field.len()));
    }
    field.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let reference = median(&field[FIELD_TRIM..field.len() - FIELD_TRIM]).ok_or(NoSignal::NonFinite)?;
    as_cost(mine - reference)
}

/// Lap a deployment message belongs to for this driver.
fn message_lap(msg: &RaceControlMessage, driver_laps: &[LapRecord]) -> Option<u32> {
    if let Some(l) = msg.lap {
        return Some(l);
    }
    driver_laps
        .iter()
        .find(|l| l.session_time_s.map_or(false, |t| t >= msg.time_s))
        .map(|l| l.lap_number)
}

/// `-(yellows × 0.08 + missed safety-car stops × 1.2)`
pub fn incident_impact(messages: &[RaceControlMessage], driver_laps: &[LapRecord]) -> Estimate {
    if messages.is_empty() {
        return Err(NoSignal::NoRaceControl);
    }
    // race control writes flags in upper case; lower-case mentions count too
    let yellows = messages
        .iter()
        .filter(|m| m.message.to_uppercase().contains("YELLOW"))
        .count();

    let pit_laps = pit_out_laps(driver_laps);
    let missed = messages
        .iter()
        .filter(|m| m.message.to_uppercase().contains("SAFETY CAR DEPLOYED"))
        .filter_map(|m| message_lap(m, driver_laps))
        .filter(|sc| !pit_laps.iter().any(|p| p.abs_diff(*sc) <= SC_PIT_WINDOW_LAPS))
        .count();

    as_cost(yellows as f64 * YELLOW_COST_S + missed as f64 * MISSED_SC_PIT_COST_S)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::{lap, one_stop_race};
    use crate::data::Compound;
    use std::collections::BTreeMap;

    fn msg(time_s: f64, lap: Option<u32>, text: &str) -> RaceControlMessage {
        RaceControlMessage {
            time_s,
            lap,
            message: text.to_string(),
        }
    }

    fn quali(times: &[(&str, f64)]) -> Session {
        Session {
            year: 2024,
            event_name: "Monaco".into(),
            laps: times
                .iter()
                .map(|(d, t)| lap(d, 1, *t, Compound::Soft, 1, 1))
                .collect(),
            ..Default::default()
        }
    }

    fn field(n: usize, laps_each: u32) -> Vec<LapRecord> {
        let mut out = Vec::new();
        for k in 0..n {
            for lap_n in 1..=laps_each {
                out.push(lap(&format!("D{:02}", k), lap_n, 90.0 + k as f64 * 0.1, Compound::Medium, lap_n, 1));
            }
        }
        out
    }

    #[test]
    fn test_qualifying_cost_uses_grid_then_rank() {
        let q = quali(&[("VER", 70.0), ("LEC", 70.3), ("HAM", 70.5)]);
        let mut race = Session::default();
        assert_eq!(qualifying_cost(&race, Some(&q), "HAM"), Ok(-0.74));
        assert_eq!(qualifying_cost(&race, Some(&q), "VER"), Ok(0.0));

        race.grid = BTreeMap::from([("HAM".to_string(), 10)]);
        assert_eq!(qualifying_cost(&race, Some(&q), "ham"), Ok(-1.58));
    }

    #[test]
    fn test_qualifying_cost_without_session() {
        let race = Session::default();
        assert_eq!(qualifying_cost(&race, None, "VER"), Err(NoSignal::NoQualifyingSession));
        let q = quali(&[("VER", 70.0)]);
        assert_eq!(qualifying_cost(&race, Some(&q), "SAR"), Err(NoSignal::NoQualifyingLap));
    }

    #[test]
    fn test_pit_execution_against_benchmark() {
        // one_stop_race pairs 500.0 in with 523.1 out
        let laps = one_stop_race();
        assert_eq!(stop_durations(&laps).len(), 1);
        assert_eq!(pit_execution_cost(&laps, 20.0), Ok(-3.1));
        assert_eq!(pit_execution_cost(&laps, 25.0), Ok(0.0));
    }

    #[test]
    fn test_pit_execution_sums_excess_over_benchmark() {
        let mut laps = one_stop_race();
        laps[5].pit_out_s = Some(503.0);
        assert_eq!(pit_execution_cost(&laps, 2.4), Ok(-0.6));

        // a second stop adds its own excess, a quick one adds nothing
        laps[7].pit_in_s = Some(700.0);
        laps[8].pit_out_s = Some(702.0);
        assert_eq!(pit_execution_cost(&laps, 2.4), Ok(-0.6));
        laps[8].pit_out_s = Some(703.4);
        assert_eq!(pit_execution_cost(&laps, 2.4), Ok(-1.6));
    }

    #[test]
    fn test_pit_execution_without_stops() {
        let laps: Vec<LapRecord> = (1..=5).map(|n| lap("A", n, 90.0, Compound::Hard, n, 1)).collect();
        assert_eq!(pit_execution_cost(&laps, 2.4), Err(NoSignal::NoPitStop));

        let mut out_only = laps.clone();
        out_only[2].pit_out_s = Some(10.0);
        assert_eq!(pit_execution_cost(&out_only, 2.4), Err(NoSignal::NoPitTimings));
        assert_eq!(pit_execution_cost(&[], 2.4), Err(NoSignal::NoLapData));
    }

    #[test]
    fn test_stop_benchmark_needs_enough_stops() {
        let laps = one_stop_race();
        assert_eq!(stop_benchmark(&laps, 2.4), 2.4);

        let mut field = Vec::new();
        for (d, dur) in [("A", 2.0), ("B", 3.0), ("C", 4.0)] {
            for mut l in one_stop_race() {
                l.driver = d.to_string();
                if l.pit_out_s.is_some() {
                    l.pit_out_s = Some(500.0 + dur);
                }
                field.push(l);
            }
        }
        assert_eq!(stop_benchmark(&field, 2.4), 3.0);
    }

    #[test]
    fn test_car_pace_deficit_trims_field() {
        let laps = field(10, 5);
        // D09 is 0.9s off D00; trimmed field D03..D06 has median 90.45
        assert_eq!(car_pace_deficit(&laps, "D09"), Ok(-0.45));
        assert_eq!(car_pace_deficit(&laps, "D00"), Ok(0.0));
        assert_eq!(car_pace_deficit(&laps, "XXX"), Err(NoSignal::NoCleanLaps));
        assert_eq!(car_pace_deficit(&field(6, 5), "D05"), Err(NoSignal::InsufficientField(6)));
    }

    #[test]
    fn test_incident_impact_counts_yellows_and_missed_sc() {
        let laps = one_stop_race();
        let messages = vec![
            msg(10.0, Some(1), "YELLOW IN TRACK SECTOR 3"),
            msg(20.0, Some(1), "CLEAR IN TRACK SECTOR 3"),
            msg(30.0, Some(2), "Double yellow in sector 7"),
            // pit out on lap 6 is within two laps of lap 4
            msg(350.0, Some(4), "SAFETY CAR DEPLOYED"),
            // resolved by session time to lap 9, nowhere near a stop
            msg(880.0, None, "SAFETY CAR DEPLOYED"),
        ];
        assert_eq!(incident_impact(&messages, &laps), Ok(-1.36));
        assert_eq!(incident_impact(&[], &laps), Err(NoSignal::NoRaceControl));
    }

    #[test]
    fn test_tyre_degradation_cap_and_attribution() {
        let p = Predictor::fallback();
        let ctx = RaceContext {
            circuit: "Monaco",
            season: 2024,
            track_temp: 35.0,
            driver_rank: 10.0,
        };
        // flat 100s laps against a 99s reference and a small fallback delta
        let laps: Vec<LapRecord> = (1..=4).map(|n| lap("A", n, 100.0, Compound::Hard, n, 1)).collect();
        let expected: f64 = (1..=4)
            .map(|n| {
                let fuel = fuel_load(n, 4);
                let predicted = 99.0 + (n as f64 * 0.03 + (1.0 - fuel) * 0.08);
                (100.0 - predicted) * TYRE_ATTRIBUTION
            })
            .sum();
        assert_eq!(tyre_degradation_cost(&laps, &p, &ctx, 99.0), Ok(-round_ms(expected)));

        assert_eq!(tyre_degradation_cost(&laps, &p, &ctx, 80.0), Ok(-TYRE_COST_CAP_S));
        assert_eq!(tyre_degradation_cost(&laps, &p, &ctx, 120.0), Ok(0.0));

        let short = &laps[..2];
        assert_eq!(tyre_degradation_cost(short, &p, &ctx, 99.0), Err(NoSignal::NoCleanLaps));
    }

    #[test]
    fn test_costs_are_never_positive() {
        for loss in [0.0, 1.234_56, -3.0, 1e-5] {
            let c = as_cost(loss).unwrap();
            assert!(c <= 0.0);
            assert!(!(c == 0.0 && c.is_sign_negative()));
        }
        assert_eq!(as_cost(f64::NAN), Err(NoSignal::NonFinite));
    }
}
