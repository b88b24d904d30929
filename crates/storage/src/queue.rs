//! Queue Model and In-Memory Queue

use crate::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// A buffered reading awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonic per queue; preserves enqueue order across restarts
    pub seq: u64,
    /// Serialized reading
    pub reading: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// What to do when an enqueue hits capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new item with [`QueueError::Full`]
    #[default]
    RejectNewest,
    /// Evict the oldest item to make room
    DropOldest,
}

/// Result of a successful enqueue
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Accepted { seq: u64 },
    /// The new item was accepted and this one was evicted
    Evicted { seq: u64, evicted: QueueItem },
}

impl EnqueueOutcome {
    pub fn seq(&self) -> u64 {
        match self {
            EnqueueOutcome::Accepted { seq } | EnqueueOutcome::Evicted { seq, .. } => *seq,
        }
    }
}

/// Durable FIFO owned by a single edge agent
pub trait OfflineQueue: Send + Sync {
    fn enqueue(&self, reading: Vec<u8>) -> Result<EnqueueOutcome, QueueError>;

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError>;

    /// Remove the oldest item once its delivery is acknowledged
    fn remove_oldest(&self) -> Result<Option<QueueItem>, QueueError>;

    fn len(&self) -> Result<usize, QueueError>;

    fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Count a failed delivery of the oldest item; returns its new count
    fn record_attempt(&self) -> Result<Option<u32>, QueueError>;

    fn capacity(&self) -> usize;
}

/// Contents of a [`MemoryQueue`]
#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    items: VecDeque<QueueItem>,
}

impl QueueState {
    fn push(
        &mut self,
        reading: Vec<u8>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut evicted = None;
        if self.items.len() >= capacity {
            match policy {
                OverflowPolicy::RejectNewest => {
                    error!("Offline queue full ({} items), rejecting new reading", capacity);
                    return Err(QueueError::Full { capacity });
                }
                OverflowPolicy::DropOldest => {
                    evicted = self.items.pop_front();
                    if let Some(item) = &evicted {
                        error!(
                            "Offline queue full ({} items), dropped oldest seq {}",
                            capacity, item.seq
                        );
                    }
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(QueueItem {
            seq,
            reading,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        });
        debug!("Enqueued seq {} ({} queued)", seq, self.items.len());

        Ok(match evicted {
            Some(evicted) => EnqueueOutcome::Evicted { seq, evicted },
            None => EnqueueOutcome::Accepted { seq },
        })
    }

    fn record_attempt(&mut self) -> Option<u32> {
        let head = self.items.front_mut()?;
        head.attempt_count = head.attempt_count.saturating_add(1);
        Some(head.attempt_count)
    }
}

pub(crate) fn lock_error<E: std::fmt::Display>(e: E) -> QueueError {
    QueueError::Lock(e.to_string())
}

/// Volatile queue, mainly for tests and diskless deployments
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl MemoryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        info!(
            "Creating in-memory offline queue (capacity {}, {:?})",
            capacity, policy
        );
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            policy,
        }
    }
}

impl OfflineQueue for MemoryQueue {
    fn enqueue(&self, reading: Vec<u8>) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().map_err(lock_error)?;
        state.push(reading, self.capacity, self.policy)
    }

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        let state = self.state.lock().map_err(lock_error)?;
        Ok(state.items.front().cloned())
    }

    fn remove_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state.lock().map_err(lock_error)?;
        Ok(state.items.pop_front())
    }

    fn len(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().map_err(lock_error)?;
        Ok(state.items.len())
    }

    fn record_attempt(&self) -> Result<Option<u32>, QueueError> {
        let mut state = self.state.lock().map_err(lock_error)?;
        Ok(state.record_attempt())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
