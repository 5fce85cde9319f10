//! Offline trainer: historical race sessions → [`ModelArtifacts`].

use crate::data::{driver_rank, median, Session};
use crate::features::{CircuitVocabulary, FeatureEncoder, LapState, FEATURE_COLS, N_FEATURES};
use crate::data::Compound;
use crate::model::{DegradationCurve, DegradationCurves, FeatureScaler, LinearDeltaModel, ModelArtifacts, ModelMetadata};
use crate::simulator::fuel_load;
use crate::{BlameError, Result};
use ndarray::{Array1, Array2};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Minimum usable laps before a fit is attempted.
pub const MIN_TRAINING_LAPS: usize = 10;

/// Every n-th sample is held out for evaluation.
const HOLDOUT_STRIDE: usize = 5;

/// Laps needed on one compound at one circuit before a curve is fitted.
pub const MIN_CURVE_SAMPLES: usize = 10;

// laps outside this band around the session median are usually VSC/SC laps that
// slipped through the track status filter
const OUTLIER_LOW: f64 = 0.97;
const OUTLIER_HIGH: f64 = 1.06;

/// One clean lap ready for encoding.
#[derive(Debug, Clone)]
pub struct TrainingLap {
    pub circuit: String,
    pub season: i32,
    pub lap_time_s: f64,
    pub tyre_age: f64,
    pub compound: Compound,
    pub fuel_load: f64,
    pub lap_number: u32,
    pub track_temp: f64,
    pub driver_rank: f64,
}

/// Clean laps from one race, with fuel, rank and temperature filled in.
pub fn extract_laps(session: &Session, default_track_temp: f64, default_rank: f64) -> Vec<TrainingLap> {
    let clean: Vec<_> = session.laps.iter().filter(|l| l.is_clean()).collect();
    if clean.is_empty() {
        return Vec::new();
    }
    let total_laps = clean.iter().map(|l| l.lap_number).max().unwrap_or(1).max(1);
    let times: Vec<f64> = clean.iter().filter_map(|l| l.lap_time_s).collect();
    let med = match median(&times) {
        Some(m) => m,
        None => return Vec::new(),
    };
    let track_temp = session.track_temp(default_track_temp);

    let ranks: BTreeMap<String, f64> = session
        .drivers()
        .into_iter()
        .filter_map(|d| driver_rank(&session.laps, &d).map(|r| (d, r)))
        .collect();

    let laps: Vec<TrainingLap> = clean
        .into_iter()
        .filter_map(|l| {
            let t = l.lap_time_s?;
            if t >= med * OUTLIER_HIGH || t <= med * OUTLIER_LOW {
                return None;
            }
            Some(TrainingLap {
                circuit: session.event_name.clone(),
                season: session.year,
                lap_time_s: t,
                tyre_age: l.tyre_age as f64,
                compound: l.compound,
                fuel_load: fuel_load(l.lap_number, total_laps),
                lap_number: l.lap_number,
                track_temp,
                driver_rank: ranks.get(&l.driver).copied().unwrap_or(default_rank),
            })
        })
        .collect();

    debug!(
        "{} {}: {} training laps after outlier filter",
        session.year,
        session.event_name,
        laps.len()
    );
    laps
}

fn mae(pred: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    (pred - truth).mapv(f64::abs).mean().unwrap_or(0.0)
}

fn r2(pred: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let mean = truth.mean().unwrap_or(0.0);
    let ss_tot = truth.mapv(|t| (t - mean).powi(2)).sum();
    let ss_res = (truth - pred).mapv(|r| r * r).sum();
    if ss_tot <= f64::EPSILON {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    }
}

/// Quadratic lap time against tyre age for every circuit and dry or
/// intermediate compound with enough laps.
pub fn degradation_curves(laps: &[TrainingLap]) -> DegradationCurves {
    let mut points: BTreeMap<(&str, Compound), Vec<(f64, f64)>> = BTreeMap::new();
    for lap in laps.iter().filter(|l| l.compound != Compound::Wet) {
        points
            .entry((lap.circuit.as_str(), lap.compound))
            .or_default()
            .push((lap.tyre_age, lap.lap_time_s));
    }

    let mut curves = DegradationCurves::new();
    for ((circuit, compound), pts) in points {
        if pts.len() < MIN_CURVE_SAMPLES {
            continue;
        }
        match DegradationCurve::fit(&pts) {
            Some(curve) => {
                debug!(
                    "{} {}: {:.3}s/lap mid-stint, cliff at {:?}",
                    circuit, compound, curve.rates.mid, curve.cliff_lap
                );
                curves.entry(circuit.to_string()).or_default().insert(compound, curve);
            }
            None => warn!("{} {}: no usable degradation curve", circuit, compound),
        }
    }
    curves
}

/// Fits the lap-time delta model over every usable lap in `sessions`.
pub fn train(sessions: &[Session], default_track_temp: f64, default_rank: f64) -> Result<ModelArtifacts> {
    let laps: Vec<TrainingLap> = sessions
        .iter()
        .flat_map(|s| extract_laps(s, default_track_temp, default_rank))
        .collect();
    if laps.len() < MIN_TRAINING_LAPS {
        return Err(BlameError::Model(format!(
            "need at least {} clean laps, found {}",
            MIN_TRAINING_LAPS,
            laps.len()
        )));
    }

    // label encoding follows sorted circuit names
    let classes: Vec<String> = laps
        .iter()
        .map(|l| l.circuit.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let encoder = FeatureEncoder::new(CircuitVocabulary::new(classes.clone()));

    let mut per_circuit: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for lap in &laps {
        let (idx, _) = encoder.circuit_code(&lap.circuit);
        per_circuit.entry(idx).or_default().push(lap.lap_time_s);
    }
    let circuit_medians: BTreeMap<usize, f64> = per_circuit
        .into_iter()
        .filter_map(|(idx, times)| median(&times).map(|m| (idx, m)))
        .collect();

    let mut train_rows = Vec::new();
    let mut train_y = Vec::new();
    let mut test_rows = Vec::new();
    let mut test_y = Vec::new();
    for (i, lap) in laps.iter().enumerate() {
        let fv = encoder.encode(&LapState {
            tyre_age: lap.tyre_age,
            compound: lap.compound,
            fuel_load: lap.fuel_load,
            lap_number: lap.lap_number,
            track_temp: lap.track_temp,
            driver_rank: lap.driver_rank,
            circuit: &lap.circuit,
            season: lap.season,
        });
        let (idx, _) = encoder.circuit_code(&lap.circuit);
        let target = lap.lap_time_s - circuit_medians.get(&idx).copied().unwrap_or(lap.lap_time_s);
        if i % HOLDOUT_STRIDE == HOLDOUT_STRIDE - 1 {
            test_rows.extend_from_slice(&fv.as_array());
            test_y.push(target);
        } else {
            train_rows.extend_from_slice(&fv.as_array());
            train_y.push(target);
        }
    }

    let to_matrix = |rows: Vec<f64>, n: usize| {
        Array2::from_shape_vec((n, N_FEATURES), rows).map_err(|e| BlameError::Model(e.to_string()))
    };
    let x_train = to_matrix(train_rows, train_y.len())?;
    let x_test = to_matrix(test_rows, test_y.len())?;
    let y_train = Array1::from_vec(train_y);
    let y_test = Array1::from_vec(test_y);

    let scaler = FeatureScaler::fit(&x_train)?;
    let model = LinearDeltaModel::fit(&scaler.transform_rows(&x_train), &y_train)?;

    let x_eval = scaler.transform_rows(&x_test);
    let pred: Array1<f64> = x_eval.rows().into_iter().map(|row| model.predict(row)).collect();
    let (mae_s, r2_s) = (mae(&pred, &y_test), r2(&pred, &y_test));

    let feature_importance = model.importance(&FEATURE_COLS);
    let deg_curves = degradation_curves(&laps);

    info!(
        "Trained on {} laps, held out {} | MAE {:.3}s | R² {:.3} | {} circuits",
        y_train.len(),
        y_test.len(),
        mae_s,
        r2_s,
        classes.len()
    );

    Ok(ModelArtifacts {
        scaler,
        model,
        metadata: ModelMetadata {
            trained_at: chrono::Utc::now().to_rfc3339(),
            training_laps: y_train.len(),
            test_laps: y_test.len(),
            mae_seconds: mae_s,
            r2_score: r2_s,
            feature_cols: FEATURE_COLS.iter().map(|s| s.to_string()).collect(),
            circuit_medians,
            circuit_classes: classes,
            feature_importance,
        },
        deg_curves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::lap;
    use crate::data::Compound;
    use crate::model::Predictor;
    use crate::UnknownCircuitPolicy;

    // twenty laps per driver, lap time grows 0.1s per lap of tyre age
    fn session(event: &str, base: f64) -> Session {
        let mut laps = Vec::new();
        for (k, driver) in ["AAA", "BBB", "CCC"].iter().enumerate() {
            for n in 1..=20 {
                laps.push(lap(driver, n, base + k as f64 * 0.2 + n as f64 * 0.1, Compound::Medium, n, 1));
            }
        }
        Session {
            year: 2024,
            event_name: event.to_string(),
            laps,
            track_temps: vec![36.0],
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_drops_outliers_and_dirty_laps() {
        let mut s = session("Monaco", 74.0);
        s.laps[3].lap_time_s = Some(120.0);
        s.laps[4].track_status = "4".into();
        let laps = extract_laps(&s, 35.0, 10.0);
        assert_eq!(laps.len(), 58);
        assert!(laps.iter().all(|l| l.lap_time_s < 100.0));
        assert!(laps.iter().all(|l| l.track_temp == 36.0));
        let last = laps.iter().find(|l| l.lap_number == 20).unwrap();
        assert!((last.fuel_load - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_train_builds_usable_artifacts() {
        let sessions = vec![session("Monaco", 74.0), session("Bahrain", 93.0)];
        let artifacts = train(&sessions, 35.0, 10.0).unwrap();

        assert_eq!(artifacts.metadata.circuit_classes, vec!["Bahrain".to_string(), "Monaco".to_string()]);
        assert_eq!(artifacts.metadata.training_laps + artifacts.metadata.test_laps, 120);
        assert!(artifacts.metadata.mae_seconds < 0.1);
        assert!(artifacts.validate().is_ok());

        let imp = &artifacts.metadata.feature_importance;
        assert_eq!(imp.len(), N_FEATURES);
        assert!(imp.values().all(|v| (0.0..=1.0).contains(v)));
        assert!((imp.values().sum::<f64>() - 1.0).abs() < 1e-3);

        // lap time is linear in tyre age at 0.1s/lap
        let monaco = &artifacts.deg_curves["Monaco"][&Compound::Medium];
        assert_eq!(monaco.samples, 60);
        assert!((monaco.rates.mid - 0.1).abs() < 1e-3);
        assert_eq!(monaco.cliff_lap, None);
        assert!(artifacts.deg_curves["Bahrain"].contains_key(&Compound::Medium));

        let p = Predictor::new(Some(artifacts), UnknownCircuitPolicy::Midpoint);
        assert!(p.circuit_median("Monaco") > 74.0 && p.circuit_median("Monaco") < 77.0);
        assert!(p.circuit_median("Bahrain") > 93.0);
    }

    #[test]
    fn test_degradation_curves_skip_thin_and_wet_stints() {
        let mut laps = extract_laps(&session("Suzuka", 92.0), 35.0, 10.0);
        for l in laps.iter_mut().take(9) {
            l.compound = Compound::Soft;
        }
        for l in laps.iter_mut().skip(9).take(15) {
            l.compound = Compound::Wet;
        }
        let curves = degradation_curves(&laps);
        let suzuka = &curves["Suzuka"];
        assert_eq!(suzuka.keys().copied().collect::<Vec<_>>(), vec![Compound::Medium]);
        assert_eq!(suzuka[&Compound::Medium].samples, 36);
    }

    #[test]
    fn test_train_refuses_tiny_dataset() {
        let mut s = session("Monaco", 74.0);
        s.laps.truncate(5);
        assert!(matches!(train(&[s], 35.0, 10.0), Err(BlameError::Model(_))));
    }
}
