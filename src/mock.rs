//! Deterministic synthetic sessions for when the real lap source is unreachable.
//!
//! Every (year, gp) pair hashes to its own seed, so the same request always
//! yields the same race: a 20-car, 56-lap, one-stop SOFT → MEDIUM race with a
//! qualifying session, a few yellow flags and sometimes a safety car.

use crate::data::{Compound, LapDataProvider, LapRecord, RaceControlMessage, Session, SessionKind, GREEN_FLAG};
use crate::simulator::fuel_load;
use crate::Result;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

pub const MOCK_DRIVERS: [&str; 20] = [
    "VER", "PER", "LEC", "SAI", "HAM", "RUS", "NOR", "PIA", "ALO", "STR", "GAS", "OCO", "ALB", "SAR", "TSU",
    "RIC", "HUL", "MAG", "BOT", "ZHO",
];
pub const MOCK_RACE_LAPS: u32 = 56;
/// `source_tag` of the synthetic provider, surfaced as the report's telemetry source.
pub const MOCK_SOURCE_TAG: &str = "mock_data";

const SAFETY_CAR_STATUS: &str = "4";
const SAFETY_CAR_LAPS: u32 = 3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// xorshift64* stream.
struct MockRng(u64);

impl MockRng {
    fn seeded(year: i32, gp: &str, stream: &str) -> Self {
        let key = format!("{}|{}|{}", year, gp.trim().to_lowercase(), stream);
        Self(fnv1a64(key.as_bytes()) | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.unit()
    }

    fn int(&mut self, lo: u32, hi: u32) -> u32 {
        lo + (self.next_u64() % u64::from(hi - lo + 1)) as u32
    }
}

#[derive(Debug, Clone)]
struct DriverProfile {
    code: &'static str,
    /// Seconds per lap off the ideal car.
    pace: f64,
    pit_lap: u32,
    stop_s: f64,
}

#[derive(Debug, Clone)]
struct RaceShape {
    base_lap_s: f64,
    track_temp: f64,
    safety_car_lap: Option<u32>,
    drivers: Vec<DriverProfile>,
}

impl RaceShape {
    fn new(year: i32, gp: &str) -> Self {
        let mut rng = MockRng::seeded(year, gp, "race");
        let base_lap_s = rng.range(78.0, 98.0);
        let track_temp = rng.range(28.0, 48.0);
        let safety_car_lap = if rng.unit() < 0.4 { Some(rng.int(28, 42)) } else { None };
        let drivers = MOCK_DRIVERS
            .iter()
            .enumerate()
            .map(|(i, code)| DriverProfile {
                code: *code,
                pace: i as f64 * 0.09 + rng.range(0.0, 0.35),
                pit_lap: rng.int(18, 28),
                stop_s: rng.range(2.1, 3.8),
            })
            .collect();
        Self {
            base_lap_s,
            track_temp,
            safety_car_lap,
            drivers,
        }
    }

    fn under_safety_car(&self, lap: u32) -> bool {
        self.safety_car_lap
            .map_or(false, |sc| lap >= sc && lap < sc + SAFETY_CAR_LAPS)
    }
}

fn degradation_rate(compound: Compound) -> f64 {
    match compound {
        Compound::Soft => 0.085,
        Compound::Medium => 0.05,
        _ => 0.035,
    }
}

/// Synthetic data source. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockLapProvider;

impl MockLapProvider {
    pub fn new() -> Self {
        Self
    }

    fn qualifying_times(shape: &RaceShape, year: i32, gp: &str) -> Vec<(&'static str, Vec<f64>)> {
        let mut rng = MockRng::seeded(year, gp, "quali");
        shape
            .drivers
            .iter()
            .map(|d| {
                let times: Vec<f64> = (0..3)
                    .map(|_| shape.base_lap_s - 8.0 + d.pace * 0.8 + rng.range(0.0, 0.4))
                    .collect();
                (d.code, times)
            })
            .collect()
    }

    fn grid(shape: &RaceShape, year: i32, gp: &str) -> BTreeMap<String, u32> {
        let mut best: Vec<(&str, f64)> = Self::qualifying_times(shape, year, gp)
            .into_iter()
            .map(|(code, times)| (code, times.into_iter().fold(f64::INFINITY, f64::min)))
            .collect();
        best.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        best.into_iter()
            .enumerate()
            .map(|(i, (code, _))| (code.to_string(), i as u32 + 1))
            .collect()
    }

    fn qualifying(&self, year: i32, gp: &str) -> Session {
        let shape = RaceShape::new(year, gp);
        let laps = Self::qualifying_times(&shape, year, gp)
            .into_iter()
            .flat_map(|(code, times)| {
                times.into_iter().enumerate().map(move |(i, t)| LapRecord {
                    driver: code.to_string(),
                    lap_number: i as u32 + 1,
                    lap_time_s: Some(t),
                    tyre_age: 1,
                    compound: Compound::Soft,
                    stint: i as u32 + 1,
                    pit_in_s: None,
                    pit_out_s: None,
                    track_status: GREEN_FLAG.to_string(),
                    position: None,
                    session_time_s: None,
                })
            })
            .collect();
        Session {
            year,
            event_name: gp.to_string(),
            laps,
            track_temps: vec![shape.track_temp],
            ..Default::default()
        }
    }

    fn race(&self, year: i32, gp: &str) -> Session {
        let shape = RaceShape::new(year, gp);
        let mut rng = MockRng::seeded(year, gp, "laps");
        let mut laps = Vec::with_capacity(shape.drivers.len() * MOCK_RACE_LAPS as usize);

        for d in &shape.drivers {
            let mut clock = 0.0;
            let mut last_pit_in = None;
            for n in 1..=MOCK_RACE_LAPS {
                let stopped = n > d.pit_lap;
                let (compound, stint, tyre_age) = if stopped {
                    (Compound::Medium, 2, n - d.pit_lap)
                } else {
                    (Compound::Soft, 1, n)
                };
                let mut t = shape.base_lap_s
                    + d.pace
                    + tyre_age as f64 * degradation_rate(compound)
                    + fuel_load(n, MOCK_RACE_LAPS) * 1.8
                    + rng.range(-0.15, 0.15);
                let sc = shape.under_safety_car(n);
                if sc {
                    t += 28.0;
                }
                if n == d.pit_lap {
                    t += 9.0;
                }
                if n == d.pit_lap + 1 {
                    t += 12.0 + d.stop_s;
                }
                clock += t;

                let pit_in_s = if n == d.pit_lap { Some(clock) } else { None };
                if pit_in_s.is_some() {
                    last_pit_in = pit_in_s;
                }
                let pit_out_s = if n == d.pit_lap + 1 { last_pit_in.map(|p| p + d.stop_s) } else { None };

                laps.push(LapRecord {
                    driver: d.code.to_string(),
                    lap_number: n,
                    lap_time_s: Some(t),
                    tyre_age,
                    compound,
                    stint,
                    pit_in_s,
                    pit_out_s,
                    track_status: if sc { SAFETY_CAR_STATUS.to_string() } else { GREEN_FLAG.to_string() },
                    position: None,
                    session_time_s: Some(clock),
                });
            }
        }
        assign_positions(&mut laps);

        let mut messages = Vec::new();
        for _ in 0..rng.int(1, 4) {
            let lap = rng.int(2, MOCK_RACE_LAPS - 1);
            messages.push(RaceControlMessage {
                time_s: lap as f64 * shape.base_lap_s,
                lap: Some(lap),
                message: format!("YELLOW IN TRACK SECTOR {}", rng.int(1, 20)),
            });
        }
        if let Some(sc) = shape.safety_car_lap {
            messages.push(RaceControlMessage {
                time_s: (sc - 1) as f64 * shape.base_lap_s,
                lap: Some(sc),
                message: "SAFETY CAR DEPLOYED".to_string(),
            });
        }
        messages.sort_by(|a, b| a.time_s.partial_cmp(&b.time_s).unwrap_or(Ordering::Equal));

        debug!(
            "mock race {} {}: base {:.2}s, safety car {:?}",
            year, gp, shape.base_lap_s, shape.safety_car_lap
        );

        Session {
            year,
            event_name: gp.to_string(),
            laps,
            messages,
            track_temps: vec![shape.track_temp - 1.0, shape.track_temp, shape.track_temp + 1.5],
            grid: Self::grid(&shape, year, gp),
        }
    }
}

// running order at the end of each lap, by elapsed session time
fn assign_positions(laps: &mut [LapRecord]) {
    let mut by_lap: BTreeMap<u32, Vec<(f64, usize)>> = BTreeMap::new();
    for (i, l) in laps.iter().enumerate() {
        by_lap
            .entry(l.lap_number)
            .or_default()
            .push((l.session_time_s.unwrap_or(f64::INFINITY), i));
    }
    for order in by_lap.values_mut() {
        order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        for (pos, (_, i)) in order.iter().enumerate() {
            laps[*i].position = Some(pos as u32 + 1);
        }
    }
}

impl LapDataProvider for MockLapProvider {
    fn get_session(&self, year: i32, gp: &str, kind: SessionKind) -> Result<Session> {
        Ok(match kind {
            SessionKind::Race => self.race(year, gp),
            SessionKind::Qualifying => self.qualifying(year, gp),
        })
    }

    fn source_tag(&self) -> &'static str {
        MOCK_SOURCE_TAG
    }
}
