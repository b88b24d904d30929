//! Edge Agent Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use storage::OverflowPolicy;

/// Default config file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "edge-agent.toml";

/// Environment variable prefix, e.g. `PHARMACHAIN_EDGE__INGEST_URL`
pub const ENV_PREFIX: &str = "PHARMACHAIN_EDGE";

/// Edge agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Batch or shipment the sensor travels with
    pub subject_id: String,
    pub sensor_id: String,
    pub location: String,
    /// Sampling cadence in milliseconds (default: 5000)
    pub sample_interval_ms: u64,
    /// Total submission attempts per live reading before going offline
    pub submit_attempts: u32,
    /// Fixed pause between attempts
    pub retry_backoff_ms: u64,
    /// Upper bound on any single submission or probe
    pub submit_timeout_ms: u64,
    /// Connectivity probe period while offline
    pub probe_interval_ms: u64,
    /// Queued items replayed per tick while draining
    pub drain_batch_size: usize,
    pub queue_path: PathBuf,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Base URL of the ingestion server
    pub ingest_url: String,
    pub sensor_seed: u64,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            subject_id: "BATCH-001".to_string(),
            sensor_id: "SENSOR-001".to_string(),
            location: "In Transit".to_string(),
            sample_interval_ms: 5000,
            submit_attempts: 3,
            retry_backoff_ms: 500,
            submit_timeout_ms: 2000,
            probe_interval_ms: 10_000,
            drain_batch_size: 100,
            queue_path: PathBuf::from("data/edge-queue.db"),
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::RejectNewest,
            ingest_url: "http://127.0.0.1:8080".to_string(),
            sensor_seed: 42,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load from an optional TOML file, then `PHARMACHAIN_EDGE__*`
    /// environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let file = path.unwrap_or(DEFAULT_CONFIG_FILE);
        config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
