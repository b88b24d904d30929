//! PharmaChain Edge Agent - Main Entry Point

use anyhow::Context;
use edge_agent::{init_logging, AgentConfig, EdgeAgent, HttpIngestClient, SimulatedSensor};
use std::sync::Arc;
use storage::{OfflineQueue, SqliteQueue};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = AgentConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.log_level);

    info!("=== PharmaChain Edge Agent v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Subject {} / sensor {} -> {}",
        config.subject_id, config.sensor_id, config.ingest_url
    );

    let queue: Arc<dyn OfflineQueue> = Arc::new(
        SqliteQueue::open(&config.queue_path, config.queue_capacity, config.overflow_policy)
            .with_context(|| format!("Failed to open queue {}", config.queue_path.display()))?,
    );
    let client = HttpIngestClient::new(&config.ingest_url, config.submit_timeout())?;
    let sensor = Box::new(SimulatedSensor::new(config.sensor_seed));

    let mut agent = EdgeAgent::new(config, sensor, client, queue)?;
    let handle = agent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.stop();
        }
    });

    agent.run().await?;
    Ok(())
}
