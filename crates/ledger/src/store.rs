//! Ledger Storage Seam

use crate::entry::LedgerEntry;
use crate::error::StoreError;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Durable, append-only store keyed by `(subject_id, index)`.
///
/// `append` performs an optimistic index check: it must fail with
/// [`StoreError::IndexConflict`] unless `entry.index` equals the current
/// length of the subject's chain.
pub trait LedgerStore: Send + Sync {
    fn read_entry(&self, subject_id: &str, index: u64) -> Result<Option<LedgerEntry>, StoreError>;

    /// Latest committed entry of a chain
    fn head(&self, subject_id: &str) -> Result<Option<LedgerEntry>, StoreError>;

    fn append(&self, entry: LedgerEntry) -> Result<(), StoreError>;

    /// All entries of a chain in index order
    fn scan(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Known subjects in lexicographic order
    fn subjects(&self) -> Result<Vec<String>, StoreError>;

    fn chain_len(&self, subject_id: &str) -> Result<u64, StoreError> {
        Ok(self.head(subject_id)?.map_or(0, |e| e.index + 1))
    }
}

/// Entries live in one arena; each chain is a list of arena slots.
#[derive(Default)]
pub(crate) struct Arena {
    entries: Vec<LedgerEntry>,
    chains: BTreeMap<String, Vec<usize>>,
}

impl Arena {
    pub(crate) fn check_next(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let expected = self
            .chains
            .get(&entry.subject_id)
            .map_or(0, |slots| slots.len() as u64);
        if entry.index != expected {
            return Err(StoreError::IndexConflict {
                subject_id: entry.subject_id.clone(),
                expected,
                actual: entry.index,
            });
        }
        Ok(())
    }

    /// Push without checking; callers run `check_next` first
    pub(crate) fn push(&mut self, entry: LedgerEntry) {
        let slot = self.entries.len();
        self.chains
            .entry(entry.subject_id.clone())
            .or_default()
            .push(slot);
        self.entries.push(entry);
    }

    pub(crate) fn get(&self, subject_id: &str, index: u64) -> Option<&LedgerEntry> {
        let slots = self.chains.get(subject_id)?;
        let slot = *slots.get(usize::try_from(index).ok()?)?;
        self.entries.get(slot)
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, subject_id: &str, index: u64) -> Option<&mut LedgerEntry> {
        let slots = self.chains.get(subject_id)?;
        let slot = *slots.get(usize::try_from(index).ok()?)?;
        self.entries.get_mut(slot)
    }

    pub(crate) fn head(&self, subject_id: &str) -> Option<&LedgerEntry> {
        let slot = *self.chains.get(subject_id)?.last()?;
        self.entries.get(slot)
    }

    pub(crate) fn scan(&self, subject_id: &str) -> Vec<LedgerEntry> {
        self.chains
            .get(subject_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|&slot| self.entries.get(slot).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn subjects(&self) -> Vec<String> {
        self.chains.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) fn lock_error<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Unavailable(format!("Lock error: {}", e))
}

/// In-memory ledger store
pub struct MemoryLedgerStore {
    arena: RwLock<Arena>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        info!("Creating in-memory ledger store");
        Self {
            arena: RwLock::new(Arena::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arena>, StoreError> {
        self.arena.read().map_err(lock_error)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arena>, StoreError> {
        self.arena.write().map_err(lock_error)
    }

    /// Total entries across all chains
    pub fn entry_count(&self) -> usize {
        self.arena.read().map(|a| a.len()).unwrap_or(0)
    }

    /// Edit a stored entry in place, bypassing the append discipline
    #[cfg(test)]
    pub(crate) fn tamper<F: FnOnce(&mut LedgerEntry)>(&self, subject_id: &str, index: u64, f: F) {
        let mut arena = self.arena.write().unwrap();
        f(arena.get_mut(subject_id, index).unwrap());
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn read_entry(&self, subject_id: &str, index: u64) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.read()?.get(subject_id, index).cloned())
    }

    fn head(&self, subject_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.read()?.head(subject_id).cloned())
    }

    fn append(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        let mut arena = self.write()?;
        arena.check_next(&entry)?;
        arena.push(entry);
        Ok(())
    }

    fn scan(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.read()?.scan(subject_id))
    }

    fn subjects(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read()?.subjects())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::GENESIS_HASH;
    use crate::entry::{ApprovalDecided, EventPayload};

    fn entry(subject: &str, index: u64) -> LedgerEntry {
        let payload = EventPayload::ApprovalDecided(ApprovalDecided {
            authority: "FDA".into(),
            approved: true,
            reason: None,
        });
        let canonical = payload.canonical_bytes().unwrap();
        LedgerEntry::seal(subject, index, payload, &canonical, GENESIS_HASH.to_string())
    }

    #[test]
    fn test_append_and_read() {
        let store = MemoryLedgerStore::new();
        store.append(entry("A", 0)).unwrap();
        store.append(entry("B", 0)).unwrap();
        store.append(entry("A", 1)).unwrap();

        assert_eq!(store.chain_len("A").unwrap(), 2);
        assert_eq!(store.chain_len("B").unwrap(), 1);
        assert_eq!(store.chain_len("C").unwrap(), 0);
        assert_eq!(store.read_entry("A", 1).unwrap().unwrap().index, 1);
        assert!(store.read_entry("A", 2).unwrap().is_none());
        assert_eq!(store.head("A").unwrap().unwrap().index, 1);
        assert_eq!(store.subjects().unwrap(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(store.entry_count(), 3);
    }

    #[test]
    fn test_optimistic_index_check() {
        let store = MemoryLedgerStore::new();
        store.append(entry("A", 0)).unwrap();

        let err = store.append(entry("A", 0)).unwrap_err();
        assert_eq!(
            err,
            StoreError::IndexConflict {
                subject_id: "A".into(),
                expected: 1,
                actual: 0
            }
        );
        assert!(store.append(entry("A", 5)).is_err());
        assert_eq!(store.chain_len("A").unwrap(), 1);
    }

    #[test]
    fn test_scan_in_index_order() {
        let store = MemoryLedgerStore::new();
        for i in 0..3 {
            store.append(entry("A", i)).unwrap();
            store.append(entry("B", i)).unwrap();
        }
        let chain = store.scan("A").unwrap();
        assert_eq!(chain.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chain.iter().all(|e| e.subject_id == "A"));
    }
}
