//! Cold-Chain Ledger Server - Main Entry Point

use api::{init_logging, run_server, ServerConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = ServerConfig::load(config_path.as_deref())?;
    init_logging(&config.log_level);

    info!("=== PharmaChain Ledger v{} ===", env!("CARGO_PKG_VERSION"));

    let metrics = if config.metrics_enabled {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    run_server(config, metrics).await
}
