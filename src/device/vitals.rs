//! Synthetic vital signs
//!
//! Each parameter follows a bounded random walk around a resting baseline,
//! so consecutive readings look like one patient rather than white noise.

use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::BTreeMap;

use crate::types::SensorValue;

/// One simulated parameter.
#[derive(Debug, Clone, Copy)]
struct VitalSpec {
    name: &'static str,
    baseline: f64,
    /// Std-dev of the per-step change.
    step: f64,
    min: f64,
    max: f64,
    decimals: i32,
}

const VITALS: &[VitalSpec] = &[
    VitalSpec { name: "heart_rate", baseline: 75.0, step: 1.5, min: 60.0, max: 100.0, decimals: 1 },
    VitalSpec { name: "blood_pressure_systolic", baseline: 120.0, step: 1.5, min: 100.0, max: 140.0, decimals: 1 },
    VitalSpec { name: "blood_pressure_diastolic", baseline: 78.0, step: 1.0, min: 60.0, max: 90.0, decimals: 1 },
    VitalSpec { name: "temperature", baseline: 36.8, step: 0.05, min: 36.1, max: 37.8, decimals: 1 },
    VitalSpec { name: "oxygen_saturation", baseline: 98.0, step: 0.3, min: 95.0, max: 100.0, decimals: 1 },
    VitalSpec { name: "respiratory_rate", baseline: 16.0, step: 0.5, min: 12.0, max: 20.0, decimals: 1 },
    VitalSpec { name: "glucose_level", baseline: 100.0, step: 2.0, min: 70.0, max: 140.0, decimals: 1 },
    VitalSpec { name: "ecg_voltage", baseline: 0.5, step: 0.3, min: -0.5, max: 1.5, decimals: 3 },
    VitalSpec { name: "brain_activity", baseline: 10.5, step: 0.4, min: 8.0, max: 13.0, decimals: 2 },
];

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

pub struct VitalsGenerator {
    rng: StdRng,
    current: Vec<f64>,
}

impl VitalsGenerator {
    /// Seeded for reproducible runs, entropy otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            current: VITALS.iter().map(|v| v.baseline).collect(),
        }
    }

    /// Parameter names in emission order.
    pub fn parameter_names() -> impl Iterator<Item = &'static str> {
        VITALS.iter().map(|v| v.name)
    }

    /// Advance every parameter one step and return the new values.
    pub fn next_values(&mut self) -> BTreeMap<String, SensorValue> {
        VITALS
            .iter()
            .zip(self.current.iter_mut())
            .map(|(vital, value)| {
                let drift = (vital.baseline - *value) * 0.1;
                let z: f64 = self.rng.sample(StandardNormal);
                let step = z * vital.step;
                *value = (*value + drift + step).clamp(vital.min, vital.max);
                (
                    vital.name.to_string(),
                    SensorValue::Number(round_to(*value, vital.decimals)),
                )
            })
            .collect()
    }
}
