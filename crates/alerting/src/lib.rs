//! Alerting System
//!
//! Provides threshold classification of metric readings into severity tiers
//! and the book of alert records raised from non-normal readings, optionally
//! persisted through an [`AlertStore`].

mod classifier;
mod manager;
mod store;

pub use classifier::{
    classify, Classification, ClassifierConfig, SafeRange, Severity, ThresholdTable, Violation,
};
pub use manager::{AlertBook, AlertQuery, AlertRecord, NewAlert};
pub use store::{AlertStore, SqliteAlertStore};

use thiserror::Error;

/// Alerting errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlertError {
    #[error("Alert {0} not found")]
    NotFound(u64),
    #[error("Invalid threshold for {metric}: {reason}")]
    InvalidThreshold { metric: String, reason: String },
    #[error("Alert book unavailable: {0}")]
    Unavailable(String),
}
