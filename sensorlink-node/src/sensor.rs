//! Simulated temperature/humidity sensor
//!
//! The session only needs something that yields readings; the simulator is a
//! smoothed random walk so dashboards show plausible curves.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sensorlink_protocol::Reading;

const TEMPERATURE_RANGE: (f64, f64) = (15.0, 30.0);
const HUMIDITY_RANGE: (f64, f64) = (30.0, 80.0);
const TEMPERATURE_STEP: f64 = 0.5;
const HUMIDITY_STEP: f64 = 2.0;

/// Source of readings for the data emitter
pub trait SensorSource: Send + 'static {
    fn next_reading(&mut self) -> Reading;
}

pub struct SensorSimulator {
    temperature: f64,
    humidity: f64,
    rng: StdRng,
}

impl SensorSimulator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible sequence (tests, demos)
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            temperature: midpoint(TEMPERATURE_RANGE),
            humidity: midpoint(HUMIDITY_RANGE),
            rng,
        }
    }
}

impl Default for SensorSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SensorSimulator {
    fn next_reading(&mut self) -> Reading {
        self.temperature = step(self.temperature, self.rng.gen_range(-TEMPERATURE_STEP..=TEMPERATURE_STEP), TEMPERATURE_RANGE);
        self.humidity = step(self.humidity, self.rng.gen_range(-HUMIDITY_STEP..=HUMIDITY_STEP), HUMIDITY_RANGE);
        Reading::new(self.temperature, self.humidity)
    }
}

fn midpoint((low, high): (f64, f64)) -> f64 {
    (low + high) / 2.0
}

fn step(value: f64, delta: f64, (low, high): (f64, f64)) -> f64 {
    round1((value + delta).clamp(low, high))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
