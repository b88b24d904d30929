//! Cold-Chain Ledger API Server
//!
//! REST surface over the ingestion service, the alert book and the event
//! ledger: reading submission, alert review, chain exploration and
//! verification.

use alerting::{AlertBook, SqliteAlertStore};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ingestion::{IngestError, IngestionService};
use ledger::{Explorer, Ledger, LedgerStore, MemoryLedgerStore, SqliteLedgerStore, Verifier};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod error;
mod routes;

pub use config::{ServerConfig, DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use error::{ApiError, ErrorBody};

/// Application state shared across handlers
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub ledger: Arc<Ledger>,
    pub alerts: Arc<AlertBook>,
    pub explorer: Explorer,
    pub verifier: Verifier,
    /// Prometheus handle, present when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire the ledger, a memory-only alert book and the ingestion service
    /// over a store
    pub fn new(store: Arc<dyn LedgerStore>, config: &ServerConfig) -> Result<Self, IngestError> {
        Self::with_alerts(store, Arc::new(AlertBook::new()), config)
    }

    /// Open the configured database, or memory stores when `in_memory` is set
    pub fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        if config.in_memory {
            info!("Using in-memory ledger and alert book");
            return Ok(Self::new(Arc::new(MemoryLedgerStore::new()), config)?);
        }

        let store = SqliteLedgerStore::open(&config.database_path)?;
        let alert_store = SqliteAlertStore::open(&config.database_path)?;
        let alerts = AlertBook::with_store(Arc::new(alert_store))?;
        info!("Using database at {}", config.database_path.display());
        Ok(Self::with_alerts(Arc::new(store), Arc::new(alerts), config)?)
    }

    /// Wire the services and rebuild alert records and idempotency tokens
    /// from the ledger
    pub fn with_alerts(
        store: Arc<dyn LedgerStore>,
        alerts: Arc<AlertBook>,
        config: &ServerConfig,
    ) -> Result<Self, IngestError> {
        let ledger = Arc::new(Ledger::with_config(store, config.ledger.clone()));
        let ingestion = Arc::new(IngestionService::new(
            ledger.clone(),
            alerts.clone(),
            config.thresholds.clone(),
            config.ingestion(),
        )?);
        ingestion.recover()?;

        Ok(Self {
            explorer: Explorer::new(ledger.clone()),
            verifier: Verifier::new(ledger.clone()),
            ingestion,
            ledger,
            alerts,
            metrics: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentStatus,
    pub stats: LedgerStats,
}

/// Component status
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub ledger: ComponentHealth,
    pub alerts: ComponentHealth,
}

/// Individual component health
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            detail: None,
        }
    }

    fn degraded(detail: impl ToString) -> Self {
        Self {
            status: "degraded".to_string(),
            detail: Some(detail.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerStats {
    pub subject_count: usize,
    pub alert_count: usize,
    pub unacknowledged_alerts: usize,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/readings", post(routes::readings::submit_reading))
        .route("/api/v1/rejections", get(routes::readings::get_rejections))
        .route("/api/v1/alerts", get(routes::alerts::get_alerts))
        .route("/api/v1/alerts/:id/ack", post(routes::alerts::acknowledge_alert))
        .route("/api/v1/subjects", get(routes::subjects::list_subjects))
        .route("/api/v1/subjects/:subject_id/chain", get(routes::subjects::get_chain))
        .route("/api/v1/subjects/:subject_id/verify", get(routes::subjects::verify_chain))
        .route(
            "/api/v1/subjects/:subject_id/entries/:index/verify",
            get(routes::subjects::verify_entry),
        )
        .route("/api/v1/subjects/:subject_id/custody", post(routes::subjects::record_custody))
        .route("/api/v1/subjects/:subject_id/approvals", post(routes::subjects::record_approval))
        .route("/api/v1/verify", get(routes::subjects::verify_all))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let (ledger_health, subject_count) = match state.ledger.subjects() {
        Ok(subjects) => (ComponentHealth::ok(), subjects.len()),
        Err(e) => (ComponentHealth::degraded(e), 0),
    };
    let status = if ledger_health.status == "ok" {
        "healthy"
    } else {
        "degraded"
    };

    let response = HealthResponse {
        status: status.to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stats: LedgerStats {
            subject_count,
            alert_count: state.alerts.len(),
            unacknowledged_alerts: state.alerts.pending_count(),
        },
        components: ComponentStatus {
            ledger: ledger_health,
            alerts: ComponentHealth::ok(),
        },
    };

    Json(response)
}

/// Prometheus exposition
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => {
            metrics::gauge!("pharmachain_unacknowledged_alerts")
                .set(state.alerts.pending_count() as f64);
            handle.render().into_response()
        }
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

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

/// Run the server
pub async fn run_server(
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
) -> anyhow::Result<()> {
    let mut state = AppState::open(&config)?;
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let report = state.verifier.verify_all()?;
    if report.all_valid() {
        info!(
            "Startup verification passed: {} chains, {} entries",
            report.subjects_checked, report.entries_checked
        );
    } else {
        tracing::warn!(
            "Startup verification found {} broken chain(s)",
            report.invalid_chains
        );
    }

    let app = create_router(Arc::new(state));

    info!("Starting API server on {}", config.bind);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
