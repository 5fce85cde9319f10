use blame_engine::blame::DataQuality;
use blame_engine::data::CsvLapProvider;
use blame_engine::{
    train, BlameEngine, BlameFactor, EngineConfig, LapDataProvider, PredictionMethod, SessionKind,
    UnknownCircuitPolicy,
};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const DRIVERS: [&str; 8] = ["VER", "LEC", "NOR", "HAM", "PIA", "RUS", "ALO", "GAS"];
const LAPS: u32 = 30;

// eight one-stop drivers, SOFT then HARD, with timed stops and a safety car
fn write_race(root: &Path, year: i32, gp: &str) {
    let dir = root.join(year.to_string()).join(gp);
    fs::create_dir_all(&dir).unwrap();

    let mut laps = String::from("Driver,LapNumber,LapTime,TyreLife,Compound,Stint,PitInTime,PitOutTime,TrackStatus,Position,Time\n");
    let mut quali = laps.clone();
    let mut grid = String::from("Driver,GridPosition\n");

    for (k, driver) in DRIVERS.iter().enumerate() {
        let stop = 12 + (k as u32 % 4);
        let mut clock = 0.0;
        let mut pit_in = 0.0;
        for n in 1..=LAPS {
            let (compound, stint, age) = if n <= stop { ("SOFT", 1, n) } else { ("HARD", 2, n - stop) };
            let rate = if n <= stop { 0.08 } else { 0.03 };
            let t = 90.0 + k as f64 * 0.2 + age as f64 * rate + (n % 3) as f64 * 0.01;
            clock += t;
            let pit_in_col = if n == stop {
                pit_in = clock;
                format!("{:.3}", clock)
            } else {
                String::new()
            };
            let pit_out_col = if n == stop + 1 {
                format!("{:.3}", pit_in + 2.3 + k as f64 * 0.1)
            } else {
                String::new()
            };
            writeln!(
                laps,
                "{},{},{:.3},{},{},{},{},{},1,{},{:.3}",
                driver,
                n,
                t,
                age,
                compound,
                stint,
                pit_in_col,
                pit_out_col,
                k + 1,
                clock
            )
            .unwrap();
        }
        for n in 1..=2 {
            writeln!(quali, "{},{},{:.3},1,SOFT,{},,,1,,", driver, n, 80.0 + k as f64 * 0.15 + n as f64 * 0.05, n).unwrap();
        }
        writeln!(grid, "{},{}", driver, k + 1).unwrap();
    }

    fs::write(dir.join("R_laps.csv"), laps).unwrap();
    fs::write(dir.join("Q_laps.csv"), quali).unwrap();
    fs::write(dir.join("R_grid.csv"), grid).unwrap();
    fs::write(dir.join("R_weather.csv"), "Time,TrackTemp\n0,41.0\n600,43.0\n1200,42.0\n").unwrap();
    fs::write(
        dir.join("R_messages.csv"),
        "Time,Lap,Message\n400.0,5,YELLOW IN TRACK SECTOR 2\n1800.0,20,SAFETY CAR DEPLOYED\n",
    )
    .unwrap();
}

fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: root.to_path_buf(),
        mock_fallback: false,
        ..Default::default()
    }
}

#[test]
fn test_csv_race_gives_full_signal_report() {
    let root = tempdir().unwrap();
    write_race(root.path(), 2024, "Sakhir");

    let mut engine = BlameEngine::from_config(config(root.path()));
    let report = engine.autopsy(2024, "Sakhir", "GAS").unwrap();

    assert_eq!(report.telemetry_source, "csv");
    assert_eq!(report.data_quality, DataQuality::High, "{:?}", report.no_signal);
    assert!(report.no_signal.is_empty());
    assert_eq!(report.method, PredictionMethod::FallbackPolynomial);
    assert!(report.model_metrics.is_none());

    assert_eq!(report.position.actual, 8);
    assert!(report.position.optimal <= report.position.actual);
    assert_eq!(report.total_loss, report.blame.total_loss());
    assert!(report.blame.iter().all(|(_, v)| v <= 0.0));
    // slowest car: 1.4s off the field leader, field median sits in between
    assert!(report.blame.car_pace_deficit < 0.0);
    // grid 8 at 0.12 per slot plus 1.05s to pole
    assert_eq!(report.blame.qualifying_cost, -1.89);
    // one yellow plus a safety car on lap 20 with no stop nearby
    assert_eq!(report.blame.incident_impact, -1.28);
    assert!(report.verdict.starts_with("GAS at 2024 Sakhir:"));

    let json = serde_json::to_value(&report).unwrap();
    for factor in BlameFactor::ALL {
        assert!(json["blame"].get(factor.key()).is_some());
    }
}

#[test]
fn test_missing_race_without_fallback_is_an_error() {
    let root = tempdir().unwrap();
    let mut engine = BlameEngine::from_config(config(root.path()));
    assert!(engine.autopsy(2024, "Sakhir", "VER").is_err());

    let mut fallback = BlameEngine::from_config(EngineConfig {
        mock_fallback: true,
        ..config(root.path())
    });
    let report = fallback.autopsy(2024, "Sakhir", "VER").unwrap();
    assert_eq!(report.data_quality, DataQuality::Mock);
    assert_eq!(report.telemetry_source, "mock_data");
}

#[test]
fn test_trained_model_flows_into_report() {
    let root = tempdir().unwrap();
    write_race(root.path(), 2024, "Sakhir");
    write_race(root.path(), 2024, "Jeddah");

    let provider = CsvLapProvider::new(root.path());
    let session = provider.get_session(2024, "Sakhir", SessionKind::Race).unwrap();
    let artifacts = train::train(&[session], 35.0, 10.0).unwrap();
    let model_path = root.path().join("model.json");
    artifacts.save(&model_path).unwrap();

    let mut engine = BlameEngine::from_config(EngineConfig {
        model_path: Some(model_path.clone()),
        ..config(root.path())
    });
    assert!(engine.predictor().is_trained());
    let report = engine.autopsy(2024, "Sakhir", "LEC").unwrap();
    assert_eq!(report.method, PredictionMethod::MlModel);
    assert!(report.circuit_in_vocabulary);
    assert!(!report.low_confidence);
    assert!(report.model_metrics.is_some());
    assert!(report.position.optimal <= report.position.actual);

    // an unseen circuit under the strict policy drops to the fallback curve
    let mut strict = BlameEngine::from_config(EngineConfig {
        model_path: Some(model_path),
        unknown_circuit_policy: UnknownCircuitPolicy::Fallback,
        ..config(root.path())
    });
    let unseen = strict.autopsy(2024, "Jeddah", "LEC").unwrap();
    assert_eq!(unseen.method, PredictionMethod::FallbackPolynomial);
    assert!(!unseen.circuit_in_vocabulary);
    assert!(unseen.low_confidence);
}

#[test]
fn test_compare_uses_cache() {
    let root = tempdir().unwrap();
    write_race(root.path(), 2023, "Monza");

    let mut engine = BlameEngine::from_config(config(root.path()));
    let first = engine.autopsy(2023, "Monza", "NOR").unwrap();
    let reports = engine.compare(2023, "Monza", &["VER", "NOR"]).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(!reports[0].from_cache);
    assert!(reports[1].from_cache);
    assert_eq!(reports[1].blame, first.blame);
    assert_eq!(engine.cache_len(), 2);
}
