//! Storage Layer
//!
//! Bounded FIFO queue for readings awaiting delivery, in memory or
//! persisted to a SQLite database that survives restarts.

mod queue;
mod sqlite;

pub use sqlite::SqliteQueue;
pub use queue::{EnqueueOutcome, MemoryQueue, OfflineQueue, OverflowPolicy, QueueItem};

use thiserror::Error;

/// Queue errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Corrupt queue item: {0}")]
    Corrupt(String),
    /// Bounded capacity reached under [`OverflowPolicy::RejectNewest`]
    #[error("Queue full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}
