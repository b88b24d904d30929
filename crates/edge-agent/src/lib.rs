//! Edge Agent
//!
//! Samples a sensor on a fixed cadence and submits each reading to the
//! ingestion service. While the service is unreachable, readings are held
//! in a durable bounded queue and replayed in order once it returns.

mod agent;
mod client;
pub mod config;
mod sensor;

pub use agent::{AgentError, AgentHandle, AgentState, EdgeAgent, TickReport};
pub use client::{ClientError, HttpIngestClient, IngestClient, LocalIngestClient};
pub use config::AgentConfig;
pub use sensor::{Sample, Sensor, SensorError, SimulatedSensor};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
pub fn init_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
