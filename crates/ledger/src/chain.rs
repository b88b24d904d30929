//! Ledger Implementation

use crate::canonical::GENESIS_HASH;
use crate::entry::{EventPayload, LedgerEntry};
use crate::error::{LedgerError, StoreError};
use crate::store::LedgerStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Retries with a refreshed head after losing an index race (default: 3)
    pub max_conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// Why verification stopped at an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored index does not match position in the chain
    IndexMismatch,
    /// `prev_hash` does not match the predecessor's `curr_hash`
    BrokenLink,
    /// Recomputed hash differs from `curr_hash`
    HashMismatch,
    /// Declared event type disagrees with the payload variant
    EventTypeMismatch,
    /// Payload can no longer be canonicalized
    InvalidPayload,
}

/// Result of verifying one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub subject_id: String,
    pub valid: bool,
    pub first_broken_index: Option<u64>,
    pub failure: Option<BreakKind>,
    /// Entries visible when the scan started; validity covers only these
    pub entries_checked: u64,
    pub head_hash: Option<String>,
}

impl ChainVerification {
    /// Turn an invalid result into [`LedgerError::ChainIntegrityViolation`]
    pub fn into_result(self) -> Result<Self, LedgerError> {
        match self.first_broken_index {
            Some(index) => Err(LedgerError::ChainIntegrityViolation {
                subject_id: self.subject_id,
                index,
            }),
            None => Ok(self),
        }
    }
}

/// Result of recomputing a single entry's hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryVerification {
    pub subject_id: String,
    pub index: u64,
    pub valid: bool,
    pub stored_hash: String,
    pub calculated_hash: Option<String>,
    pub entry: LedgerEntry,
}

/// Per-subject writer locks
#[derive(Default)]
struct WriterLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriterLocks {
    fn for_subject(&self, subject_id: &str) -> Result<Arc<Mutex<()>>, LedgerError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| LedgerError::StorageUnavailable(format!("Lock error: {}", e)))?;
        Ok(locks.entry(subject_id.to_string()).or_default().clone())
    }

    /// Drop a subject's lock once no writer holds or waits on it
    fn release(&self, subject_id: &str) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        if locks
            .get(subject_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(subject_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Append-only, hash-chained event ledger.
///
/// Appends to one subject are serialized; different subjects never contend.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    writers: WriterLocks,
    config: LedgerConfig,
}

impl Ledger {
    /// Create a ledger over a store with default configuration
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        info!("Creating ledger with config: {:?}", config);
        Self {
            store,
            writers: WriterLocks::default(),
            config,
        }
    }

    /// Append an event to a subject's chain.
    ///
    /// The first append to a subject creates its genesis entry. Losing the
    /// optimistic index check to another writer is retried with the fresh
    /// head up to `max_conflict_retries` times.
    pub fn append(
        &self,
        subject_id: &str,
        payload: EventPayload,
    ) -> Result<LedgerEntry, LedgerError> {
        if subject_id.trim().is_empty() {
            return Err(LedgerError::InvalidPayload("subject_id is empty".to_string()));
        }
        let canonical = payload.canonical_bytes()?;

        let writer = self.writers.for_subject(subject_id)?;
        let result = match writer.lock() {
            Ok(_guard) => self.append_locked(subject_id, &payload, &canonical),
            Err(e) => Err(LedgerError::StorageUnavailable(format!("Lock error: {}", e))),
        };
        drop(writer);
        self.writers.release(subject_id);
        result
    }

    /// Append with the subject's writer lock held
    fn append_locked(
        &self,
        subject_id: &str,
        payload: &EventPayload,
        canonical: &[u8],
    ) -> Result<LedgerEntry, LedgerError> {
        let event_type = payload.event_type();
        let attempts = self.config.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let (index, prev_hash) = match self.store.head(subject_id)? {
                Some(head) => (head.index + 1, head.curr_hash),
                None => (0, GENESIS_HASH.to_string()),
            };

            let entry =
                LedgerEntry::seal(subject_id, index, payload.clone(), canonical, prev_hash);
            match self.store.append(entry.clone()) {
                Ok(()) => {
                    debug!("Appended {} #{} to {}", event_type, index, subject_id);
                    metrics::counter!(
                        "pharmachain_ledger_appends_total",
                        "event_type" => event_type.as_str()
                    )
                    .increment(1);
                    return Ok(entry);
                }
                Err(StoreError::IndexConflict { expected, .. }) => {
                    warn!(
                        "Index race on {} (tried {}, store at {}), attempt {}/{}",
                        subject_id, index, expected, attempt, attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::ConcurrentAppendConflict {
            subject_id: subject_id.to_string(),
            attempts,
        })
    }

    /// Full chain for a subject in index order
    pub fn get_chain(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.scan(subject_id)?)
    }

    pub fn get_entry(&self, subject_id: &str, index: u64) -> Result<LedgerEntry, LedgerError> {
        self.store
            .read_entry(subject_id, index)?
            .ok_or_else(|| LedgerError::EntryNotFound {
                subject_id: subject_id.to_string(),
                index,
            })
    }

    pub fn subjects(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self.store.subjects()?)
    }

    pub fn chain_len(&self, subject_id: &str) -> Result<u64, LedgerError> {
        Ok(self.store.chain_len(subject_id)?)
    }

    /// Verify a subject's chain as of the entries visible right now.
    ///
    /// Each entry must sit at its own index, link to its predecessor's hash
    /// (genesis for entry 0), declare its payload's event type and hash to
    /// its stored `curr_hash`. The first failure is reported.
    pub fn verify_chain(&self, subject_id: &str) -> Result<ChainVerification, LedgerError> {
        let entries = self.store.scan(subject_id)?;
        Ok(verify_entries(subject_id, &entries))
    }

    /// Recompute a single entry's hash against its stored value
    pub fn verify_entry(
        &self,
        subject_id: &str,
        index: u64,
    ) -> Result<EntryVerification, LedgerError> {
        let entry = self.get_entry(subject_id, index)?;
        let calculated_hash = entry.compute_hash().ok();
        Ok(EntryVerification {
            subject_id: subject_id.to_string(),
            index,
            valid: calculated_hash.as_deref() == Some(entry.curr_hash.as_str())
                && entry.event_type == entry.payload.event_type(),
            stored_hash: entry.curr_hash.clone(),
            calculated_hash,
            entry,
        })
    }
}

fn verify_entries(subject_id: &str, entries: &[LedgerEntry]) -> ChainVerification {
    let mut prev_hash = GENESIS_HASH;
    let mut broken = None;

    for (position, entry) in entries.iter().enumerate() {
        let position = position as u64;
        let failure = if entry.index != position {
            Some(BreakKind::IndexMismatch)
        } else if entry.prev_hash != prev_hash {
            Some(BreakKind::BrokenLink)
        } else if entry.event_type != entry.payload.event_type() {
            Some(BreakKind::EventTypeMismatch)
        } else {
            match entry.compute_hash() {
                Ok(hash) if hash == entry.curr_hash => None,
                Ok(_) => Some(BreakKind::HashMismatch),
                Err(_) => Some(BreakKind::InvalidPayload),
            }
        };

        if let Some(kind) = failure {
            warn!(
                "Chain {} broken at index {}: {:?}",
                subject_id, position, kind
            );
            broken = Some((position, kind));
            break;
        }
        prev_hash = entry.curr_hash.as_str();
    }

    ChainVerification {
        subject_id: subject_id.to_string(),
        valid: broken.is_none(),
        first_broken_index: broken.map(|(i, _)| i),
        failure: broken.map(|(_, k)| k),
        entries_checked: entries.len() as u64,
        head_hash: entries.last().map(|e| e.curr_hash.clone()),
    }
}
