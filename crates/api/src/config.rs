//! Server Configuration

use alerting::ThresholdTable;
use ingestion::{IdempotencyConfig, IngestionConfig, ValidationConfig};
use ledger::LedgerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default config file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "pharmachain.toml";

/// Environment variable prefix, e.g. `PHARMACHAIN__BIND`
pub const ENV_PREFIX: &str = "PHARMACHAIN";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// SQLite database holding the ledger and the alert book
    pub database_path: PathBuf,
    /// Keep the ledger and alerts in memory only
    pub in_memory: bool,
    pub thresholds: ThresholdTable,
    pub validation: ValidationConfig,
    pub idempotency: IdempotencyConfig,
    pub rejection_log_capacity: usize,
    pub ledger: LedgerConfig,
    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ingestion = IngestionConfig::default();
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("data/pharmachain.db"),
            in_memory: false,
            thresholds: ThresholdTable::default(),
            validation: ingestion.validation,
            idempotency: ingestion.idempotency,
            rejection_log_capacity: ingestion.rejection_log_capacity,
            ledger: LedgerConfig::default(),
            metrics_enabled: true,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional TOML file, then `PHARMACHAIN__*` environment
    /// overrides
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

    pub fn ingestion(&self) -> IngestionConfig {
        IngestionConfig {
            validation: self.validation.clone(),
            idempotency: self.idempotency.clone(),
            rejection_log_capacity: self.rejection_log_capacity,
        }
    }
}
