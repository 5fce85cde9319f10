//! Lap state → fixed-order numeric feature vector.

use crate::data::Compound;
use serde::{Deserialize, Serialize};

/// Column order the model is trained and evaluated in.
pub const FEATURE_COLS: [&str; 10] = [
    "tyre_age",
    "tyre_life_pct",
    "past_cliff",
    "compound_code",
    "fuel_load",
    "lap_number",
    "track_temp",
    "driver_rank",
    "circuit_code",
    "season",
];

pub const N_FEATURES: usize = FEATURE_COLS.len();

/// Upper clamp for `tyre_life_pct`; values above 1.0 mean the set ran past nominal life.
pub const MAX_LIFE_PCT: f64 = 1.5;

/// Ordinal code; wets sit at 0 and softs at 4.
pub fn compound_code(compound: Compound) -> f64 {
    match compound {
        Compound::Wet => 0.0,
        Compound::Intermediate => 1.0,
        Compound::Hard => 2.0,
        Compound::Medium => 3.0,
        Compound::Soft => 4.0,
    }
}

pub fn compound_from_code(code: f64) -> Option<Compound> {
    Compound::ALL
        .into_iter()
        .find(|c| compound_code(*c) == code.round())
}

/// Nominal stint length in laps.
pub fn max_age(compound: Compound) -> f64 {
    match compound {
        Compound::Soft => 25.0,
        Compound::Medium => 35.0,
        Compound::Hard => 50.0,
        Compound::Intermediate => 30.0,
        Compound::Wet => 40.0,
    }
}

/// Age past which the compound falls off a cliff.
pub fn cliff_age(compound: Compound) -> f64 {
    match compound {
        Compound::Soft => 20.0,
        Compound::Medium => 30.0,
        Compound::Hard => 45.0,
        Compound::Intermediate => 25.0,
        Compound::Wet => 35.0,
    }
}

pub fn tyre_life_pct(tyre_age: f64, compound: Compound) -> f64 {
    (tyre_age / max_age(compound)).clamp(0.0, MAX_LIFE_PCT)
}

/// Circuit names in the order they were label-encoded at training time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitVocabulary {
    classes: Vec<String>,
}

impl CircuitVocabulary {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn index_of(&self, circuit: &str) -> Option<usize> {
        self.classes
            .iter()
            .position(|c| c.eq_ignore_ascii_case(circuit.trim()))
    }

    /// Index used for circuits the model never saw.
    pub fn midpoint(&self) -> usize {
        self.classes.len() / 2
    }

    pub fn decode(&self, code: f64) -> Option<&str> {
        if code < 0.0 || !code.is_finite() {
            return None;
        }
        self.classes.get(code.round() as usize).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub tyre_age: f64,
    pub tyre_life_pct: f64,
    pub past_cliff: f64,
    pub compound_code: f64,
    pub fuel_load: f64,
    pub lap_number: f64,
    pub track_temp: f64,
    pub driver_rank: f64,
    pub circuit_code: f64,
    pub season: f64,
    /// Not a model input: whether `circuit_code` came from the vocabulary.
    #[serde(default = "known")]
    pub circuit_known: bool,
}

fn known() -> bool {
    true
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; N_FEATURES] {
        [
            self.tyre_age,
            self.tyre_life_pct,
            self.past_cliff,
            self.compound_code,
            self.fuel_load,
            self.lap_number,
            self.track_temp,
            self.driver_rank,
            self.circuit_code,
            self.season,
        ]
    }

    pub fn compound(&self) -> Option<Compound> {
        compound_from_code(self.compound_code)
    }
}

/// Raw lap state before encoding.
#[derive(Debug, Clone, Copy)]
pub struct LapState<'a> {
    pub tyre_age: f64,
    pub compound: Compound,
    pub fuel_load: f64,
    pub lap_number: u32,
    pub track_temp: f64,
    pub driver_rank: f64,
    pub circuit: &'a str,
    pub season: i32,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureEncoder {
    vocabulary: CircuitVocabulary,
}

impl FeatureEncoder {
    pub fn new(vocabulary: CircuitVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &CircuitVocabulary {
        &self.vocabulary
    }

    /// Circuit index plus whether it was found; unseen circuits get the midpoint.
    pub fn circuit_code(&self, circuit: &str) -> (usize, bool) {
        match self.vocabulary.index_of(circuit) {
            Some(i) => (i, true),
            None => (self.vocabulary.midpoint(), false),
        }
    }

    pub fn encode(&self, state: &LapState<'_>) -> FeatureVector {
        let tyre_age = state.tyre_age.max(0.0);
        let (circuit_code, circuit_known) = self.circuit_code(state.circuit);
        FeatureVector {
            tyre_age,
            tyre_life_pct: tyre_life_pct(tyre_age, state.compound),
            past_cliff: if tyre_age > cliff_age(state.compound) { 1.0 } else { 0.0 },
            compound_code: compound_code(state.compound),
            fuel_load: state.fuel_load,
            lap_number: state.lap_number as f64,
            track_temp: state.track_temp,
            driver_rank: state.driver_rank,
            circuit_code: circuit_code as f64,
            season: state.season as f64,
            circuit_known,
        }
    }

    pub fn decode_circuit(&self, features: &FeatureVector) -> Option<&str> {
        self.vocabulary.decode(features.circuit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FeatureEncoder {
        FeatureEncoder::new(CircuitVocabulary::new(vec![
            "Bahrain Grand Prix".into(),
            "British Grand Prix".into(),
            "Italian Grand Prix".into(),
            "Japanese Grand Prix".into(),
            "Monaco Grand Prix".into(),
        ]))
    }

    fn state(age: f64, compound: Compound, circuit: &str) -> LapState<'_> {
        LapState {
            tyre_age: age,
            compound,
            fuel_load: 0.5,
            lap_number: 30,
            track_temp: 38.0,
            driver_rank: 4.0,
            circuit,
            season: 2024,
        }
    }

    #[test]
    fn test_tyre_life_pct_bounds() {
        let enc = encoder();
        let fresh = enc.encode(&state(0.0, Compound::Soft, "Monaco Grand Prix"));
        assert_eq!(fresh.tyre_life_pct, 0.0);
        assert_eq!(fresh.past_cliff, 0.0);

        let ancient = enc.encode(&state(400.0, Compound::Hard, "Monaco Grand Prix"));
        assert_eq!(ancient.tyre_life_pct, MAX_LIFE_PCT);
        assert_eq!(ancient.past_cliff, 1.0);

        let mid = enc.encode(&state(35.0, Compound::Medium, "Monaco Grand Prix"));
        assert_eq!(mid.tyre_life_pct, 1.0);
    }

    #[test]
    fn test_cliff_is_strictly_greater() {
        let enc = encoder();
        assert_eq!(enc.encode(&state(20.0, Compound::Soft, "x")).past_cliff, 0.0);
        assert_eq!(enc.encode(&state(21.0, Compound::Soft, "x")).past_cliff, 1.0);
    }

    #[test]
    fn test_unknown_compound_encodes_as_medium() {
        let enc = encoder();
        let v = enc.encode(&state(10.0, Compound::parse("hypersoft"), "x"));
        assert_eq!(v.compound_code, compound_code(Compound::Medium));
        assert_eq!(v.tyre_life_pct, 10.0 / 35.0);
    }

    #[test]
    fn test_unseen_circuit_uses_midpoint() {
        let enc = encoder();
        let v = enc.encode(&state(5.0, Compound::Soft, "Las Vegas Grand Prix"));
        assert_eq!(v.circuit_code, 2.0);
        assert!(!v.circuit_known);

        let empty = FeatureEncoder::default();
        assert_eq!(empty.encode(&state(5.0, Compound::Soft, "anything")).circuit_code, 0.0);
    }

    #[test]
    fn test_compound_and_circuit_round_trip() {
        let enc = encoder();
        for compound in Compound::ALL {
            for circuit in enc.vocabulary().classes().to_vec() {
                let v = enc.encode(&state(12.0, compound, &circuit));
                assert!(v.circuit_known);
                assert_eq!(v.compound(), Some(compound));
                assert_eq!(enc.decode_circuit(&v), Some(circuit.as_str()));
            }
        }
    }

    #[test]
    fn test_as_array_follows_column_order() {
        let v = encoder().encode(&state(7.0, Compound::Hard, "British Grand Prix"));
        let arr = v.as_array();
        assert_eq!(arr[0], 7.0);
        assert_eq!(arr[3], 2.0);
        assert_eq!(arr[5], 30.0);
        assert_eq!(arr[8], 1.0);
        assert_eq!(arr[9], 2024.0);
    }
}
