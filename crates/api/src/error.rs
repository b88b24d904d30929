//! API Error Mapping

use alerting::AlertError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ingestion::{ErrorKind, IngestError};
use ledger::LedgerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    /// Request body or parameters could not be decoded
    #[error("{message}")]
    BadRequest { status: StatusCode, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Ingest(e) => match e.kind() {
                ErrorKind::Rejected => (StatusCode::UNPROCESSABLE_ENTITY, "rejected"),
                ErrorKind::RetryLater => (StatusCode::SERVICE_UNAVAILABLE, "retry_later"),
            },
            ApiError::Ledger(e) => match e {
                LedgerError::InvalidPayload(_) => (StatusCode::UNPROCESSABLE_ENTITY, "rejected"),
                LedgerError::EntryNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                LedgerError::ChainIntegrityViolation { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "integrity_violation")
                }
                LedgerError::StorageUnavailable(_)
                | LedgerError::ConcurrentAppendConflict { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "retry_later")
                }
            },
            ApiError::Alert(AlertError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Alert(_) => (StatusCode::SERVICE_UNAVAILABLE, "retry_later"),
            ApiError::BadRequest { status, .. } => (*status, "rejected"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        }
        let body = ErrorBody {
            error: kind.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
