//! Chain Explorer
//!
//! Read-only per-subject summaries derived from the ledger alone.

use crate::chain::Ledger;
use crate::entry::{ApprovalDecided, EventPayload, LedgerEntry};
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Share of readings without an alert required to call a subject compliant
pub const COMPLIANCE_THRESHOLD: f64 = 0.95;

/// Latest reading recorded for a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestReading {
    pub index: u64,
    pub sensor_id: String,
    pub location: String,
    pub captured_at: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Latest approval decision for a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestApproval {
    pub index: u64,
    #[serde(flatten)]
    pub decision: ApprovalDecided,
}

/// Overview of one subject's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSummary {
    pub subject_id: String,
    pub entry_count: u64,
    pub reading_count: u64,
    pub alert_count: u64,
    pub custody_transfers: u64,
    pub latest_reading: Option<LatestReading>,
    pub latest_approval: Option<LatestApproval>,
    /// Readings without an alert over all readings; `None` before the
    /// first reading
    pub compliance_rate: Option<f64>,
    pub compliant: bool,
    pub head_hash: Option<String>,
}

impl SubjectSummary {
    fn from_chain(subject_id: &str, chain: &[LedgerEntry]) -> Self {
        let mut summary = SubjectSummary {
            subject_id: subject_id.to_string(),
            entry_count: chain.len() as u64,
            reading_count: 0,
            alert_count: 0,
            custody_transfers: 0,
            latest_reading: None,
            latest_approval: None,
            compliance_rate: None,
            compliant: false,
            head_hash: chain.last().map(|e| e.curr_hash.clone()),
        };

        for entry in chain {
            match &entry.payload {
                EventPayload::ReadingRecorded(r) => {
                    summary.reading_count += 1;
                    summary.latest_reading = Some(LatestReading {
                        index: entry.index,
                        sensor_id: r.sensor_id.clone(),
                        location: r.location.clone(),
                        captured_at: r.captured_at.clone(),
                        metrics: r.metrics.clone(),
                    });
                }
                EventPayload::AlertRaised(_) => summary.alert_count += 1,
                EventPayload::CustodyTransferred(_) => summary.custody_transfers += 1,
                EventPayload::ApprovalDecided(decision) => {
                    summary.latest_approval = Some(LatestApproval {
                        index: entry.index,
                        decision: decision.clone(),
                    });
                }
            }
        }

        if summary.reading_count > 0 {
            let clean = summary.reading_count.saturating_sub(summary.alert_count);
            let rate = clean as f64 / summary.reading_count as f64;
            summary.compliance_rate = Some(rate);
            summary.compliant = rate >= COMPLIANCE_THRESHOLD;
        }
        summary
    }
}

/// Read-only browsing over the ledger
pub struct Explorer {
    ledger: Arc<Ledger>,
}

impl Explorer {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub fn subject_summary(&self, subject_id: &str) -> Result<SubjectSummary, LedgerError> {
        let chain = self.ledger.get_chain(subject_id)?;
        Ok(SubjectSummary::from_chain(subject_id, &chain))
    }

    /// Summaries for every known subject
    pub fn list_subjects(&self) -> Result<Vec<SubjectSummary>, LedgerError> {
        self.ledger
            .subjects()?
            .iter()
            .map(|s| self.subject_summary(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AlertRaised, CustodyTransferred, ReadingRecorded};
    use crate::store::MemoryLedgerStore;
    use chrono::Utc;

    fn reading(temp: f64, location: &str) -> EventPayload {
        let mut metrics = BTreeMap::new();
        metrics.insert("temperature".to_string(), temp);
        EventPayload::ReadingRecorded(ReadingRecorded::new(
            "SENSOR-003",
            location,
            Utc::now(),
            metrics,
            None,
        ))
    }

    fn alert(reading_index: u64) -> EventPayload {
        EventPayload::AlertRaised(AlertRaised {
            reading_index,
            severity: "warning".into(),
            metric: "temperature".into(),
            value: 9.0,
            safe_low: Some(2.0),
            safe_high: Some(8.0),
        })
    }

    #[test]
    fn test_summary_counts_and_latest() {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
        for _ in 0..19 {
            ledger.append("BATCH-1", reading(5.0, "Plant")).unwrap();
        }
        let idx = ledger.append("BATCH-1", reading(9.0, "Dock 2")).unwrap().index;
        ledger.append("BATCH-1", alert(idx)).unwrap();
        ledger
            .append(
                "BATCH-1",
                EventPayload::CustodyTransferred(CustodyTransferred {
                    from_party: "manufacturer".into(),
                    to_party: "distributor".into(),
                    location: "Dock 2".into(),
                    note: None,
                }),
            )
            .unwrap();
        ledger
            .append(
                "BATCH-1",
                EventPayload::ApprovalDecided(ApprovalDecided {
                    authority: "FDA".into(),
                    approved: true,
                    reason: None,
                }),
            )
            .unwrap();

        let explorer = Explorer::new(ledger);
        let summary = explorer.subject_summary("BATCH-1").unwrap();
        assert_eq!(summary.entry_count, 23);
        assert_eq!(summary.reading_count, 20);
        assert_eq!(summary.alert_count, 1);
        assert_eq!(summary.custody_transfers, 1);
        assert_eq!(summary.compliance_rate, Some(0.95));
        assert!(summary.compliant);

        let latest = summary.latest_reading.unwrap();
        assert_eq!(latest.index, idx);
        assert_eq!(latest.location, "Dock 2");
        assert_eq!(summary.latest_approval.unwrap().index, 22);
    }

    #[test]
    fn test_non_compliant_and_empty() {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
        let idx = ledger.append("BATCH-9", reading(12.0, "Truck")).unwrap().index;
        ledger.append("BATCH-9", alert(idx)).unwrap();
        ledger.append("BATCH-9", reading(5.0, "Truck")).unwrap();

        let explorer = Explorer::new(ledger);
        let summary = explorer.subject_summary("BATCH-9").unwrap();
        assert_eq!(summary.compliance_rate, Some(0.5));
        assert!(!summary.compliant);

        let empty = explorer.subject_summary("NONE").unwrap();
        assert_eq!(empty.entry_count, 0);
        assert_eq!(empty.compliance_rate, None);
        assert!(!empty.compliant);

        assert_eq!(explorer.list_subjects().unwrap().len(), 1);
    }
}
