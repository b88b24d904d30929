//! Ledger Error Types

use thiserror::Error;

/// Errors surfaced by ledger operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// Payload cannot be canonically serialized
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Another writer kept winning the race for the next index
    #[error("Concurrent append conflict on {subject_id} after {attempts} attempts")]
    ConcurrentAppendConflict { subject_id: String, attempts: u32 },

    /// Durable store could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Verification found a broken link or hash
    #[error("Chain integrity violation for {subject_id} at index {index}")]
    ChainIntegrityViolation { subject_id: String, index: u64 },

    #[error("Entry {index} not found for {subject_id}")]
    EntryNotFound { subject_id: String, index: u64 },
}

/// Errors from a [`crate::LedgerStore`] implementation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic index check failed
    #[error("Index conflict for {subject_id}: expected {expected}, got {actual}")]
    IndexConflict {
        subject_id: String,
        expected: u64,
        actual: u64,
    },

    /// Stored data could not be decoded
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IndexConflict { subject_id, .. } => LedgerError::ConcurrentAppendConflict {
                subject_id,
                attempts: 1,
            },
            other => LedgerError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
