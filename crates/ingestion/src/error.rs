//! Ingestion Error Types

use crate::validator::ValidationError;
use alerting::AlertError;
use ledger::LedgerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a caller should do about a failed submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Payload rejected; never retry
    Rejected,
    /// Transient; retry with backoff
    RetryLater,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Rejected => "rejected",
            ErrorKind::RetryLater => "retry_later",
        }
    }
}

/// Errors returned by the ingestion service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Reading classified as invalid (non-finite metric)
    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    /// Same token is being processed right now. Not an acknowledgment:
    /// the first attempt may still fail and release the token.
    #[error("Duplicate submission in flight for {subject_id} (token {token})")]
    DuplicateInFlight { subject_id: String, token: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Alert(#[from] AlertError),

    #[error("Ingestion unavailable: {0}")]
    Unavailable(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation(_) | IngestError::InvalidReading(_) => ErrorKind::Rejected,
            IngestError::Ledger(LedgerError::InvalidPayload(_)) => ErrorKind::Rejected,
            IngestError::DuplicateInFlight { .. }
            | IngestError::Ledger(_)
            | IngestError::Alert(_)
            | IngestError::Unavailable(_) => ErrorKind::RetryLater,
        }
    }
}
