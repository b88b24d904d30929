//! Ingestion Client Seam

use ingestion::{ErrorKind, IngestionService, Reading, SubmitOutcome};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Submission failures as seen by the agent
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// Server refused the payload; never retry
    #[error("Rejected: {0}")]
    Rejected(String),
    /// Server reachable but unable to ingest right now
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

/// Transport to the ingestion service
pub trait IngestClient: Send + Sync {
    fn submit(
        &self,
        reading: &Reading,
    ) -> impl Future<Output = Result<SubmitOutcome, ClientError>> + Send;

    /// Cheap connectivity check
    fn probe(&self) -> impl Future<Output = Result<(), ClientError>> + Send;
}

impl<C: IngestClient> IngestClient for Arc<C> {
    fn submit(
        &self,
        reading: &Reading,
    ) -> impl Future<Output = Result<SubmitOutcome, ClientError>> + Send {
        (**self).submit(reading)
    }

    fn probe(&self) -> impl Future<Output = Result<(), ClientError>> + Send {
        (**self).probe()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// HTTP client for the ingestion server
pub struct HttpIngestClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIngestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        info!("Creating HTTP ingest client for {}", base_url);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Network(format!("timeout: {}", e))
    } else {
        ClientError::Network(e.to_string())
    }
}

impl IngestClient for HttpIngestClient {
    async fn submit(&self, reading: &Reading) -> Result<SubmitOutcome, ClientError> {
        let response = self
            .client
            .post(self.url("/api/v1/readings"))
            .json(reading)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SubmitOutcome>()
                .await
                .map_err(|e| ClientError::Protocol(e.to_string()));
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.message,
            Err(_) => status.to_string(),
        };
        debug!("Ingest returned {}: {}", status, message);

        Err(match status.as_u16() {
            400 | 422 => ClientError::Rejected(message),
            code if code >= 500 => ClientError::Unavailable(message),
            _ => ClientError::Protocol(format!("{}: {}", status, message)),
        })
    }

    async fn probe(&self) -> Result<(), ClientError> {
        let response = self
            .client
            .get(self.url("/api/v1/health"))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Unavailable(response.status().to_string()))
        }
    }
}

/// Client that calls an ingestion service in the same process
pub struct LocalIngestClient {
    service: Arc<IngestionService>,
}

impl LocalIngestClient {
    pub fn new(service: Arc<IngestionService>) -> Self {
        Self { service }
    }
}

impl IngestClient for LocalIngestClient {
    async fn submit(&self, reading: &Reading) -> Result<SubmitOutcome, ClientError> {
        let service = self.service.clone();
        let reading = reading.clone();
        let result = tokio::task::spawn_blocking(move || service.submit(reading))
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        result.map_err(|e| match e.kind() {
            ErrorKind::Rejected => ClientError::Rejected(e.to_string()),
            ErrorKind::RetryLater => ClientError::Unavailable(e.to_string()),
        })
    }

    async fn probe(&self) -> Result<(), ClientError> {
        Ok(())
    }
}
