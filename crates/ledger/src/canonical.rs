//! Canonical Serialization and Hashing
//!
//! Canonical form is compact JSON with object keys sorted at every depth and
//! numbers in shortest round-trip notation. Entry hashes are SHA-256 over
//! `canonical(payload) ‖ prev_hash ‖ index ‖ event_type`, rendered as
//! lowercase hex.

use crate::entry::EventType;
use crate::error::LedgerError;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// `prev_hash` of every chain's first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a value to canonical JSON bytes
pub fn canonical_json(value: &impl Serialize) -> Result<Vec<u8>, LedgerError> {
    let value =
        serde_json::to_value(value).map_err(|e| LedgerError::InvalidPayload(e.to_string()))?;
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted).map_err(|e| LedgerError::InvalidPayload(e.to_string()))
}

// Key order must not depend on how serde_json backs its maps.
fn sort_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, val) in entries {
                sorted.insert(key, sort_json(val));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json).collect()),
        other => other,
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash linking an entry to its predecessor
pub fn chain_hash(canonical: &[u8], prev_hash: &str, index: u64, event_type: EventType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.update(prev_hash.as_bytes());
    hasher.update(index.to_string().as_bytes());
    hasher.update(event_type.as_str().as_bytes());
    hex::encode(hasher.finalize())
}
