//! Ledger Entry and Event Payloads

use crate::canonical::{canonical_json, chain_hash};
use crate::error::LedgerError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of ledger event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ReadingRecorded,
    AlertRaised,
    CustodyTransferred,
    ApprovalDecided,
}

impl EventType {
    /// Name used as hash input
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ReadingRecorded => "ReadingRecorded",
            EventType::AlertRaised => "AlertRaised",
            EventType::CustodyTransferred => "CustodyTransferred",
            EventType::ApprovalDecided => "ApprovalDecided",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sensor reading accepted into the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecorded {
    pub sensor_id: String,
    pub location: String,
    /// RFC 3339, millisecond precision, `Z` suffix
    pub captured_at: String,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

impl ReadingRecorded {
    pub fn new(
        sensor_id: impl Into<String>,
        location: impl Into<String>,
        captured_at: DateTime<Utc>,
        metrics: BTreeMap<String, f64>,
        idempotency_token: Option<String>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            location: location.into(),
            captured_at: captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            metrics,
            idempotency_token,
        }
    }
}

/// A threshold violation raised from a recorded reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRaised {
    /// Ledger index of the reading that triggered the alert
    pub reading_index: u64,
    pub severity: String,
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_high: Option<f64>,
}

/// Hand-off between custodians (manufacturer, distributor, pharmacy)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodyTransferred {
    pub from_party: String,
    pub to_party: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Regulator decision on a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecided {
    pub authority: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed payload of a ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    ReadingRecorded(ReadingRecorded),
    AlertRaised(AlertRaised),
    CustodyTransferred(CustodyTransferred),
    ApprovalDecided(ApprovalDecided),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ReadingRecorded(_) => EventType::ReadingRecorded,
            EventPayload::AlertRaised(_) => EventType::AlertRaised,
            EventPayload::CustodyTransferred(_) => EventType::CustodyTransferred,
            EventPayload::ApprovalDecided(_) => EventType::ApprovalDecided,
        }
    }

    /// Canonical bytes of the variant body. The event type is hashed
    /// separately, so the tag is not part of this encoding.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        self.ensure_finite()?;
        match self {
            EventPayload::ReadingRecorded(p) => canonical_json(p),
            EventPayload::AlertRaised(p) => canonical_json(p),
            EventPayload::CustodyTransferred(p) => canonical_json(p),
            EventPayload::ApprovalDecided(p) => canonical_json(p),
        }
    }

    // serde_json would silently turn NaN and infinities into null.
    fn ensure_finite(&self) -> Result<(), LedgerError> {
        let non_finite = |what: &str, value: f64| {
            LedgerError::InvalidPayload(format!("{} is not finite: {}", what, value))
        };

        match self {
            EventPayload::ReadingRecorded(p) => {
                if let Some((name, value)) = p.metrics.iter().find(|(_, v)| !v.is_finite()) {
                    return Err(non_finite(name, *value));
                }
            }
            EventPayload::AlertRaised(p) => {
                let bounds = [
                    ("value", Some(p.value)),
                    ("safe_low", p.safe_low),
                    ("safe_high", p.safe_high),
                ];
                for (name, value) in bounds {
                    if let Some(v) = value.filter(|v| !v.is_finite()) {
                        return Err(non_finite(name, v));
                    }
                }
            }
            EventPayload::CustodyTransferred(_) | EventPayload::ApprovalDecided(_) => {}
        }
        Ok(())
    }
}

/// One immutable link of a subject's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub subject_id: String,
    /// 0-based position in the subject's chain
    pub index: u64,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub prev_hash: String,
    pub curr_hash: String,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build an entry whose hash commits to `canonical` (the payload's
    /// canonical bytes), `prev_hash` and `index`.
    pub(crate) fn seal(
        subject_id: &str,
        index: u64,
        payload: EventPayload,
        canonical: &[u8],
        prev_hash: String,
    ) -> Self {
        let event_type = payload.event_type();
        let curr_hash = chain_hash(canonical, &prev_hash, index, event_type);
        Self {
            subject_id: subject_id.to_string(),
            index,
            event_type,
            payload,
            prev_hash,
            curr_hash,
            recorded_at: Utc::now(),
        }
    }

    /// Recompute this entry's hash from its stored contents
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let canonical = self.payload.canonical_bytes()?;
        Ok(chain_hash(&canonical, &self.prev_hash, self.index, self.event_type))
    }
}
