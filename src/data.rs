use crate::{BlameError, Result};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Track status value for a green-flag lap.
pub const GREEN_FLAG: &str = "1";
/// Rows claiming a lap, stint or tyre age beyond this are rejected.
pub const MAX_LAP_NUMBER: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compound {
    Soft,
    Medium,
    Hard,
    Intermediate,
    Wet,
}

impl Compound {
    pub const ALL: [Compound; 5] = [
        Compound::Soft,
        Compound::Medium,
        Compound::Hard,
        Compound::Intermediate,
        Compound::Wet,
    ];

    /// Case-insensitive parse. Anything unrecognised is treated as MEDIUM.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "SOFT" => Compound::Soft,
            "MEDIUM" => Compound::Medium,
            "HARD" => Compound::Hard,
            "INTERMEDIATE" => Compound::Intermediate,
            "WET" => Compound::Wet,
            _ => Compound::Medium,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compound::Soft => "SOFT",
            Compound::Medium => "MEDIUM",
            Compound::Hard => "HARD",
            Compound::Intermediate => "INTERMEDIATE",
            Compound::Wet => "WET",
        }
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Race,
    Qualifying,
}

impl SessionKind {
    pub fn code(&self) -> &'static str {
        match self {
            SessionKind::Race => "R",
            SessionKind::Qualifying => "Q",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One observed lap for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    pub driver: String,
    pub lap_number: u32,
    pub lap_time_s: Option<f64>,
    pub tyre_age: u32,
    pub compound: Compound,
    pub stint: u32,
    /// Session time (s) the car crossed the pit entry line.
    pub pit_in_s: Option<f64>,
    /// Session time (s) the car left the pit lane.
    pub pit_out_s: Option<f64>,
    pub track_status: String,
    pub position: Option<u32>,
    /// Session time (s) at the end of the lap.
    pub session_time_s: Option<f64>,
}

impl LapRecord {
    /// Green flag, timed, and neither an in-lap nor an out-lap.
    pub fn is_clean(&self) -> bool {
        self.lap_time_s.map_or(false, |t| t.is_finite() && t > 0.0)
            && self.track_status == GREEN_FLAG
            && self.pit_in_s.is_none()
            && self.pit_out_s.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceControlMessage {
    pub time_s: f64,
    pub lap: Option<u32>,
    pub message: String,
}

/// Everything the engine reads about one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub year: i32,
    pub event_name: String,
    pub laps: Vec<LapRecord>,
    pub messages: Vec<RaceControlMessage>,
    pub track_temps: Vec<f64>,
    pub grid: BTreeMap<String, u32>,
}

impl Session {
    /// Laps for one driver, sorted by lap number.
    pub fn driver_laps(&self, driver: &str) -> Vec<LapRecord> {
        let mut laps: Vec<LapRecord> = self
            .laps
            .iter()
            .filter(|l| l.driver.eq_ignore_ascii_case(driver))
            .cloned()
            .collect();
        laps.sort_by_key(|l| l.lap_number);
        laps
    }

    pub fn drivers(&self) -> BTreeSet<String> {
        self.laps.iter().map(|l| l.driver.clone()).collect()
    }

    /// Median of the weather series, or `default` when there is none.
    pub fn track_temp(&self, default: f64) -> f64 {
        let temps: Vec<f64> = self.track_temps.iter().copied().filter(|t| t.is_finite()).collect();
        median(&temps).unwrap_or(default)
    }

    /// Fastest timed lap in the session for one driver.
    pub fn best_lap(&self, driver: &str) -> Option<f64> {
        self.laps
            .iter()
            .filter(|l| l.driver.eq_ignore_ascii_case(driver))
            .filter_map(|l| l.lap_time_s)
            .filter(|t| t.is_finite() && *t > 0.0)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
    }

    /// Fastest timed lap of anyone in the session.
    pub fn pole_lap(&self) -> Option<f64> {
        self.laps
            .iter()
            .filter_map(|l| l.lap_time_s)
            .filter(|t| t.is_finite() && *t > 0.0)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median clean-lap time per driver.
pub fn clean_medians(laps: &[LapRecord]) -> BTreeMap<String, f64> {
    let mut per_driver: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for lap in laps.iter().filter(|l| l.is_clean()) {
        if let Some(t) = lap.lap_time_s {
            per_driver.entry(lap.driver.clone()).or_default().push(t);
        }
    }
    per_driver
        .into_iter()
        .filter_map(|(d, times)| median(&times).map(|m| (d, m)))
        .collect()
}

/// Rank of `driver` by median clean-lap pace (1 = fastest). Ties share the
/// average of the ranks they span.
pub fn driver_rank(laps: &[LapRecord], driver: &str) -> Option<f64> {
    let medians = clean_medians(laps);
    let (_, mine) = medians.iter().find(|(d, _)| d.eq_ignore_ascii_case(driver))?;
    let faster = medians.values().filter(|m| *m < mine).count() as f64;
    let tied = medians.values().filter(|m| *m == mine).count() as f64;
    Some(faster + (tied + 1.0) / 2.0)
}

/// Lap on which the first stop was made: the first in-lap, or the lap before
/// the first out-lap when only pit-out times were recorded.
pub fn first_pit_lap(driver_laps: &[LapRecord]) -> Option<u32> {
    if let Some(lap) = driver_laps.iter().find(|l| l.pit_in_s.is_some()) {
        return Some(lap.lap_number);
    }
    driver_laps
        .iter()
        .find(|l| l.pit_out_s.is_some() && l.lap_number > 1)
        .map(|l| l.lap_number - 1)
}

/// Laps the car left the pit lane on (out-laps).
pub fn pit_out_laps(driver_laps: &[LapRecord]) -> Vec<u32> {
    driver_laps
        .iter()
        .filter(|l| l.pit_out_s.is_some())
        .map(|l| l.lap_number)
        .collect()
}

// splits a driver's laps into stints. a new stint starts when the stint id changes
// or right after an in-lap, whichever the provider recorded.
pub fn stints(driver_laps: &[LapRecord]) -> Vec<Vec<&LapRecord>> {
    let mut out: Vec<Vec<&LapRecord>> = Vec::new();
    let mut current: Vec<&LapRecord> = Vec::new();

    for (i, lap) in driver_laps.iter().enumerate() {
        let prev = if i > 0 { driver_laps.get(i - 1) } else { None };
        let boundary = prev.map_or(false, |p| p.stint != lap.stint || p.pit_in_s.is_some());
        if boundary && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        current.push(lap);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Source of raw per-lap session data.
pub trait LapDataProvider {
    fn get_session(&self, year: i32, gp: &str, kind: SessionKind) -> Result<Session>;

    /// Short tag describing where the data came from, surfaced in reports.
    fn source_tag(&self) -> &'static str;
}

// renaming the columns we need from the exported lap tables
#[derive(Debug, Deserialize)]
struct RawLap {
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "LapNumber", deserialize_with = "csv::invalid_option")]
    lap_number: Option<f64>,
    #[serde(rename = "LapTime", default, deserialize_with = "csv::invalid_option")]
    lap_time: Option<f64>,
    #[serde(rename = "TyreLife", default, deserialize_with = "csv::invalid_option")]
    tyre_life: Option<f64>,
    #[serde(rename = "Compound", default)]
    compound: String,
    #[serde(rename = "Stint", default, deserialize_with = "csv::invalid_option")]
    stint: Option<f64>,
    #[serde(rename = "PitInTime", default, deserialize_with = "csv::invalid_option")]
    pit_in_time: Option<f64>,
    #[serde(rename = "PitOutTime", default, deserialize_with = "csv::invalid_option")]
    pit_out_time: Option<f64>,
    #[serde(rename = "TrackStatus", default)]
    track_status: String,
    #[serde(rename = "Position", default, deserialize_with = "csv::invalid_option")]
    position: Option<f64>,
    #[serde(rename = "Time", default, deserialize_with = "csv::invalid_option")]
    time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "Time", deserialize_with = "csv::invalid_option")]
    time: Option<f64>,
    #[serde(rename = "Lap", default, deserialize_with = "csv::invalid_option")]
    lap: Option<f64>,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawWeather {
    #[serde(rename = "TrackTemp", deserialize_with = "csv::invalid_option")]
    track_temp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawGrid {
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "GridPosition", deserialize_with = "csv::invalid_option")]
    grid_position: Option<f64>,
}

/// Reads sessions from `<root>/<year>/<gp>/<R|Q>_laps.csv` plus optional
/// `R_messages.csv`, `R_weather.csv` and `R_grid.csv` alongside.
pub struct CsvLapProvider {
    root: PathBuf,
}

impl CsvLapProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, year: i32, gp: &str) -> PathBuf {
        self.root.join(year.to_string()).join(gp)
    }

    fn read_laps(path: &Path) -> Result<Vec<LapRecord>> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut laps = Vec::new();
        let mut skipped = 0usize;

        for res in reader.deserialize::<RawLap>() {
            let raw = match res {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("skipping malformed lap row: {}", e);
                    skipped += 1;
                    continue;
                }
            };
            let lap_number = match raw.lap_number {
                Some(n) if (1.0..=MAX_LAP_NUMBER).contains(&n) => n.round() as u32,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let out_of_range = |v: Option<f64>| v.map_or(false, |v| !v.is_finite() || v > MAX_LAP_NUMBER);
            if raw.driver.trim().is_empty() || out_of_range(raw.tyre_life) || out_of_range(raw.stint) {
                skipped += 1;
                continue;
            }
            laps.push(LapRecord {
                driver: raw.driver.trim().to_uppercase(),
                lap_number,
                lap_time_s: raw.lap_time.filter(|t| t.is_finite() && *t > 0.0),
                tyre_age: raw.tyre_life.filter(|t| *t >= 0.0).map_or(0, |t| t.round() as u32),
                compound: Compound::parse(&raw.compound),
                stint: raw.stint.filter(|s| *s >= 0.0).map_or(1, |s| s.round() as u32),
                pit_in_s: raw.pit_in_time,
                pit_out_s: raw.pit_out_time,
                track_status: raw.track_status.trim().to_string(),
                position: raw.position.filter(|p| *p >= 1.0).map(|p| p.round() as u32),
                session_time_s: raw.time,
            });
        }

        info!("Loaded {} laps from {:?} ({} skipped)", laps.len(), path, skipped);
        Ok(laps)
    }

    fn read_optional<T, F>(path: &Path, mut f: F) -> Vec<T>
    where
        F: FnMut(&mut csv::Reader<File>) -> Vec<T>,
    {
        if !path.exists() {
            debug!("optional table {:?} not present", path);
            return Vec::new();
        }
        match ReaderBuilder::new().has_headers(true).from_path(path) {
            Ok(mut reader) => f(&mut reader),
            Err(e) => {
                warn!("could not open {:?}: {}", path, e);
                Vec::new()
            }
        }
    }
}

impl LapDataProvider for CsvLapProvider {
    fn get_session(&self, year: i32, gp: &str, kind: SessionKind) -> Result<Session> {
        let dir = self.session_dir(year, gp);
        let laps_path = dir.join(format!("{}_laps.csv", kind.code()));
        if !laps_path.is_file() {
            return Err(BlameError::SourceUnavailable {
                year,
                gp: gp.to_string(),
                session: kind,
                path: laps_path,
            });
        }
        let laps = Self::read_laps(&laps_path)?;

        let prefix = kind.code();
        let messages = Self::read_optional(&dir.join(format!("{}_messages.csv", prefix)), |r| {
            r.deserialize::<RawMessage>()
                .filter_map(|row| row.ok())
                .filter_map(|m| {
                    m.time.map(|t| RaceControlMessage {
                        time_s: t,
                        lap: m.lap.filter(|l| *l >= 1.0).map(|l| l.round() as u32),
                        message: m.message,
                    })
                })
                .collect()
        });
        let track_temps = Self::read_optional(&dir.join(format!("{}_weather.csv", prefix)), |r| {
            r.deserialize::<RawWeather>()
                .filter_map(|row| row.ok())
                .filter_map(|w| w.track_temp)
                .collect()
        });
        let grid = Self::read_optional(&dir.join(format!("{}_grid.csv", prefix)), |r| {
            r.deserialize::<RawGrid>()
                .filter_map(|row| row.ok())
                .filter_map(|g| {
                    g.grid_position
                        .filter(|p| *p >= 1.0)
                        .map(|p| (g.driver.trim().to_uppercase(), p.round() as u32))
                })
                .collect()
        });

        Ok(Session {
            year,
            event_name: gp.to_string(),
            laps,
            messages,
            track_temps,
            grid: grid.into_iter().collect(),
        })
    }

    fn source_tag(&self) -> &'static str {
        "csv"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    pub(crate) fn lap(driver: &str, n: u32, time: f64, compound: Compound, age: u32, stint: u32) -> LapRecord {
        LapRecord {
            driver: driver.to_string(),
            lap_number: n,
            lap_time_s: Some(time),
            tyre_age: age,
            compound,
            stint,
            pit_in_s: None,
            pit_out_s: None,
            track_status: GREEN_FLAG.to_string(),
            position: Some(5),
            session_time_s: Some(n as f64 * time),
        }
    }

    // DRIVER1 boxes at the end of lap 5: 5 laps on MEDIUM, 4 on HARD
    pub(crate) fn one_stop_race() -> Vec<LapRecord> {
        let mut laps = Vec::new();
        for n in 1..=9 {
            let (compound, age, stint) = if n <= 5 { (Compound::Medium, n, 1) } else { (Compound::Hard, n - 5, 2) };
            let mut l = lap("DRIVER1", n, 100.0 + age as f64 * 0.1, compound, age, stint);
            if n == 5 {
                l.pit_in_s = Some(500.0);
            }
            if n == 6 {
                l.pit_out_s = Some(523.1);
            }
            laps.push(l);
        }
        laps
    }

    #[test]
    fn test_compound_parse_is_case_insensitive() {
        assert_eq!(Compound::parse("soft"), Compound::Soft);
        assert_eq!(Compound::parse(" Intermediate "), Compound::Intermediate);
        assert_eq!(Compound::parse("C3"), Compound::Medium);
        assert_eq!(Compound::parse(""), Compound::Medium);
    }

    #[test]
    fn test_stints_split_on_pit() {
        let laps = one_stop_race();
        let stints = stints(&laps);
        assert_eq!(stints.len(), 2);
        assert_eq!(stints[0].len(), 5);
        assert_eq!(stints[1].len(), 4);
        assert!(stints[1].iter().all(|l| l.compound == Compound::Hard));
    }

    #[test]
    fn test_first_pit_lap_prefers_in_lap() {
        let laps = one_stop_race();
        assert_eq!(first_pit_lap(&laps), Some(5));

        let mut out_only = laps.clone();
        out_only[4].pit_in_s = None;
        assert_eq!(first_pit_lap(&out_only), Some(5));

        let no_stop: Vec<LapRecord> = (1..=5).map(|n| lap("D", n, 90.0, Compound::Soft, n, 1)).collect();
        assert_eq!(first_pit_lap(&no_stop), None);
    }

    #[test]
    fn test_driver_rank_and_median() {
        let mut laps = Vec::new();
        for n in 1..=3 {
            laps.push(lap("AAA", n, 90.0, Compound::Soft, n, 1));
            laps.push(lap("BBB", n, 91.0, Compound::Soft, n, 1));
            laps.push(lap("CCC", n, 91.0, Compound::Soft, n, 1));
        }
        assert_eq!(driver_rank(&laps, "AAA"), Some(1.0));
        assert_eq!(driver_rank(&laps, "bbb"), Some(2.5));
        assert_eq!(driver_rank(&laps, "ZZZ"), None);
        assert_eq!(median(&[3.0, 1.0, 2.0, 10.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_csv_provider_reads_session_tree() {
        let root = tempdir().unwrap();
        let dir = root.path().join("2024").join("Monaco");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("R_laps.csv"),
            "Driver,LapNumber,LapTime,TyreLife,Compound,Stint,PitInTime,PitOutTime,TrackStatus,Position,Time\n\
             ver,1,75.2,1,soft,1,,,1,1,75.2\n\
             VER,2,75.0,2,SOFT,1,150.0,,1,1,150.2\n\
             VER,3,95.1,1,HARD,2,,172.0,1,2,245.3\n\
             ,4,74.0,1,HARD,2,,,1,2,320.0\n\
             VER,x,74.0,1,HARD,2,,,1,2,320.0\n",
        )
        .unwrap();
        fs::write(dir.join("R_weather.csv"), "Time,TrackTemp\n0,40.0\n60,44.0\n120,bad\n").unwrap();
        fs::write(
            dir.join("R_messages.csv"),
            "Time,Lap,Message\n100.0,2,YELLOW IN TRACK SECTOR 4\n200.0,,SAFETY CAR DEPLOYED\n",
        )
        .unwrap();

        let provider = CsvLapProvider::new(root.path());
        let session = provider.get_session(2024, "Monaco", SessionKind::Race).unwrap();
        assert_eq!(session.laps.len(), 3);
        assert_eq!(session.laps[0].driver, "VER");
        assert_eq!(session.laps[0].compound, Compound::Soft);
        assert_eq!(session.laps[1].pit_in_s, Some(150.0));
        assert_eq!(session.track_temp(35.0), 42.0);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].lap, None);
        assert!(session.grid.is_empty());
        assert_eq!(session.driver_laps("VER").last().and_then(|l| l.position), Some(2));
    }

    #[test]
    fn test_csv_provider_rejects_implausible_lap_numbers() {
        let root = tempdir().unwrap();
        let dir = root.path().join("2024").join("Imola");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("R_laps.csv"),
            "Driver,LapNumber,LapTime,TyreLife,Compound,Stint,PitInTime,PitOutTime,TrackStatus,Position,Time\n\
             VER,1,90.0,1,SOFT,1,,,1,1,90.0\n\
             VER,9e12,90.0,2,SOFT,1,180.0,,1,1,180.0\n\
             VER,2,90.0,1e15,SOFT,1,,,1,1,180.0\n\
             VER,3,90.0,3,SOFT,inf,,,1,1,270.0\n\
             VER,0,90.0,3,SOFT,1,,,1,1,270.0\n",
        )
        .unwrap();

        let session = CsvLapProvider::new(root.path())
            .get_session(2024, "Imola", SessionKind::Race)
            .unwrap();
        let numbers: Vec<u32> = session.laps.iter().map(|l| l.lap_number).collect();
        assert_eq!(numbers, vec![1]);
    }

    #[test]
    fn test_csv_provider_missing_laps_is_unavailable() {
        let root = tempdir().unwrap();
        let provider = CsvLapProvider::new(root.path());
        let err = provider.get_session(2023, "Suzuka", SessionKind::Qualifying).unwrap_err();
        assert!(matches!(err, BlameError::SourceUnavailable { session: SessionKind::Qualifying, .. }));
    }
}
