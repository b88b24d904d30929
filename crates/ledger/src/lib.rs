//! Event Ledger
//!
//! Tamper-evident, append-only event chains keyed by subject (batch or
//! shipment). Every entry commits to its canonical payload, its index, its
//! event type and the hash of the entry before it, so any edit to stored
//! history breaks verification from that entry onward.

mod canonical;
mod chain;
mod entry;
mod error;
pub mod explorer;
mod sqlite;
mod store;
pub mod verifier;

pub use canonical::{canonical_json, chain_hash, sha256_hex, GENESIS_HASH};
pub use chain::{BreakKind, ChainVerification, EntryVerification, Ledger, LedgerConfig};
pub use entry::{
    AlertRaised, ApprovalDecided, CustodyTransferred, EventPayload, EventType, LedgerEntry,
    ReadingRecorded,
};
pub use error::{LedgerError, StoreError};
pub use explorer::{Explorer, SubjectSummary};
pub use sqlite::SqliteLedgerStore;
pub use store::{LedgerStore, MemoryLedgerStore};
pub use verifier::{VerificationReport, Verifier};
