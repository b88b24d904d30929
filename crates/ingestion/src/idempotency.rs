//! Idempotency Window
//!
//! Remembers recent submissions by `(subject_id, token)` so redelivered
//! readings return their original outcome instead of appending again.

use crate::error::IngestError;
use crate::service::SubmitOutcome;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Longest honoured token lifetime; larger configured values are clamped
const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Idempotency window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Tokens remembered before the oldest is evicted
    pub capacity: usize,
    /// Seconds a token is remembered
    pub ttl_secs: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Progress recorded for a submission whose alert step failed
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PartialSubmission {
    pub(crate) reading_index: u64,
    pub(crate) entry_hash: String,
    /// Set once the `AlertRaised` entry is committed
    pub(crate) alert_entry_index: Option<u64>,
}

#[derive(Debug, Clone)]
enum TokenState {
    InFlight { resuming: Option<PartialSubmission> },
    Partial(PartialSubmission),
    Completed(SubmitOutcome),
}

#[derive(Debug)]
struct Slot {
    state: TokenState,
    generation: u64,
    inserted_at: DateTime<Utc>,
}

/// Settled token state rebuilt from the ledger
#[derive(Debug, Clone)]
pub(crate) enum Restored {
    Partial(PartialSubmission),
    Completed(SubmitOutcome),
}

/// Outcome of claiming a token
#[derive(Debug)]
pub(crate) enum Admission {
    /// First sighting; the caller owns the token until it settles it
    Fresh,
    /// The reading is already on the ledger; finish the alert step
    Resume(PartialSubmission),
    /// Already processed
    Completed(SubmitOutcome),
}

type Key = (String, String);

#[derive(Default)]
struct WindowState {
    slots: HashMap<Key, Slot>,
    order: VecDeque<(Key, u64)>,
    next_generation: u64,
}

/// Bounded, time-limited record of recent idempotency tokens
pub struct IdempotencyWindow {
    state: Mutex<WindowState>,
    config: IdempotencyConfig,
}

impl IdempotencyWindow {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
            config,
        }
    }

    /// Tokens currently remembered
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn begin(
        &self,
        subject_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Admission, IngestError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| IngestError::Unavailable(format!("Lock error: {}", e)))?;
        self.expire(&mut state, now);

        let key = (subject_id.to_string(), token.to_string());
        if let Some(slot) = state.slots.get_mut(&key) {
            return match &slot.state {
                TokenState::InFlight { .. } => Err(IngestError::DuplicateInFlight {
                    subject_id: key.0,
                    token: key.1,
                }),
                TokenState::Completed(outcome) => Ok(Admission::Completed(outcome.clone())),
                TokenState::Partial(partial) => {
                    let partial = partial.clone();
                    slot.state = TokenState::InFlight {
                        resuming: Some(partial.clone()),
                    };
                    debug!("Resuming partial submission {}/{}", key.0, key.1);
                    Ok(Admission::Resume(partial))
                }
            };
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.slots.insert(
            key.clone(),
            Slot {
                state: TokenState::InFlight { resuming: None },
                generation,
                inserted_at: now,
            },
        );
        state.order.push_back((key, generation));

        // In-flight tokens are never evicted; the window may briefly run over
        // capacity while they settle.
        let mut pinned = Vec::new();
        while state.slots.len() > self.config.capacity.max(1) {
            let Some((old, gen)) = state.order.pop_front() else {
                break;
            };
            match state.slots.get(&old) {
                Some(slot) if slot.generation == gen => {
                    if matches!(slot.state, TokenState::InFlight { .. }) {
                        pinned.push((old, gen));
                    } else {
                        debug!("Evicting idempotency token {}/{}", old.0, old.1);
                        state.slots.remove(&old);
                    }
                }
                _ => {}
            }
        }
        for entry in pinned.into_iter().rev() {
            state.order.push_front(entry);
        }

        Ok(Admission::Fresh)
    }

    /// Re-seed a settled token recovered from the ledger. Returns false
    /// when the token was already present.
    pub(crate) fn restore(
        &self,
        subject_id: &str,
        token: &str,
        settled: Restored,
        inserted_at: DateTime<Utc>,
    ) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!("Idempotency window unavailable: {}", e);
                return false;
            }
        };
        let key = (subject_id.to_string(), token.to_string());
        if state.slots.contains_key(&key) {
            return false;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        let token_state = match settled {
            Restored::Partial(partial) => TokenState::Partial(partial),
            Restored::Completed(outcome) => TokenState::Completed(outcome),
        };
        state.slots.insert(
            key.clone(),
            Slot {
                state: token_state,
                generation,
                inserted_at,
            },
        );
        state.order.push_back((key, generation));
        true
    }

    pub(crate) fn ttl(&self) -> Duration {
        Duration::seconds(self.config.ttl_secs.clamp(0, MAX_TTL_SECS))
    }

    /// Forget a token whose submission appended nothing. A resumed
    /// submission falls back to its partial progress instead.
    pub(crate) fn release(&self, subject_id: &str, token: &str) {
        self.update(subject_id, token, |slot| match &slot.state {
            TokenState::InFlight {
                resuming: Some(partial),
            } => {
                slot.state = TokenState::Partial(partial.clone());
                true
            }
            _ => false,
        });
    }

    pub(crate) fn mark_partial(&self, subject_id: &str, token: &str, partial: PartialSubmission) {
        self.update(subject_id, token, |slot| {
            slot.state = TokenState::Partial(partial);
            true
        });
    }

    pub(crate) fn complete(&self, subject_id: &str, token: &str, outcome: SubmitOutcome) {
        self.update(subject_id, token, |slot| {
            slot.state = TokenState::Completed(outcome);
            true
        });
    }

    /// Apply `f` to the token's slot; the slot is dropped when `f` returns false
    fn update(&self, subject_id: &str, token: &str, f: impl FnOnce(&mut Slot) -> bool) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!("Idempotency window unavailable: {}", e);
                return;
            }
        };
        let key = (subject_id.to_string(), token.to_string());
        let keep = match state.slots.get_mut(&key) {
            Some(slot) => f(slot),
            None => return,
        };
        if !keep {
            state.slots.remove(&key);
        }
    }

    fn expire(&self, state: &mut WindowState, now: DateTime<Utc>) {
        let ttl = self.ttl();
        while let Some((key, gen)) = state.order.front().cloned() {
            let Some(slot) = state.slots.get(&key) else {
                state.order.pop_front();
                continue;
            };
            if slot.generation != gen {
                state.order.pop_front();
                continue;
            }
            if now - slot.inserted_at < ttl || matches!(slot.state, TokenState::InFlight { .. }) {
                break;
            }
            state.order.pop_front();
            state.slots.remove(&key);
        }
    }
}

impl Default for IdempotencyWindow {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}
