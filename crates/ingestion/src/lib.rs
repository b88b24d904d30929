//! Ingestion Service
//!
//! Validates and de-duplicates incoming sensor readings, classifies them
//! against the threshold table and appends them, plus any alert they raise,
//! to the ledger.

mod error;
mod idempotency;
mod reading;
mod service;
mod validator;

pub use error::{ErrorKind, IngestError};
pub use idempotency::{IdempotencyConfig, IdempotencyWindow};
pub use reading::{MetricValue, Reading};
pub use service::{
    AlertRef, IngestionConfig, IngestionService, RecoveryReport, RejectionRecord, SubmitOutcome,
};
pub use validator::{ValidatedReading, ValidationConfig, ValidationError, Validator};
