//! Sensor Seam

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),
}

/// One raw sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metrics: BTreeMap<String, f64>,
    pub captured_at: DateTime<Utc>,
}

/// Source of metric samples
pub trait Sensor: Send + Sync {
    fn sample(&mut self) -> Result<Sample, SensorError>;
}

/// Percent of samples that are temperature excursions
const EXCURSION_PERCENT: u64 = 15;

/// Deterministic cold-chain sensor: mostly 4-6 °C, with occasional
/// excursions anywhere in -2..12 °C, and 30-70 % humidity
pub struct SimulatedSensor {
    seed: u64,
    tick: u64,
}

impl SimulatedSensor {
    pub fn new(seed: u64) -> Self {
        info!("Creating simulated sensor (seed {})", seed);
        Self { seed, tick: 0 }
    }

    fn hash(&self, channel: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        self.tick.hash(&mut hasher);
        channel.hash(&mut hasher);
        hasher.finish()
    }

    /// Uniform value in `[low, high)`, rounded to hundredths
    fn uniform(&self, channel: &str, low: f64, high: f64) -> f64 {
        let unit = (self.hash(channel) % 10_000) as f64 / 10_000.0;
        ((low + unit * (high - low)) * 100.0).round() / 100.0
    }
}

impl Sensor for SimulatedSensor {
    fn sample(&mut self) -> Result<Sample, SensorError> {
        let excursion = self.hash("excursion") % 100 < EXCURSION_PERCENT;
        let temperature = if excursion {
            self.uniform("temperature", -2.0, 12.0)
        } else {
            self.uniform("temperature", 4.0, 6.0)
        };
        let humidity = self.uniform("humidity", 30.0, 70.0);
        self.tick += 1;

        let mut metrics = BTreeMap::new();
        metrics.insert("temperature".to_string(), temperature);
        metrics.insert("humidity".to_string(), humidity);
        Ok(Sample {
            metrics,
            captured_at: Utc::now(),
        })
    }
}
