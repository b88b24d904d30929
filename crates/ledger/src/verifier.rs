//! Whole-Ledger Verification
//!
//! Read-only sweep over every known subject. Each chain is certified only
//! up to the entries visible when its own scan started; appends that land
//! during the sweep are picked up by the next one.

use crate::chain::{BreakKind, ChainVerification, Ledger};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// An invalid chain found by a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokenChain {
    pub subject_id: String,
    pub first_broken_index: u64,
    pub failure: Option<BreakKind>,
}

/// Aggregate result of verifying every chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub subjects_checked: usize,
    pub valid_chains: usize,
    pub invalid_chains: usize,
    pub entries_checked: u64,
    pub broken: Vec<BrokenChain>,
    pub chains: Vec<ChainVerification>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sweep stopped before visiting every subject
    pub cancelled: bool,
}

impl VerificationReport {
    pub fn all_valid(&self) -> bool {
        self.invalid_chains == 0
    }
}

/// Ledger-wide integrity checker
pub struct Verifier {
    ledger: Arc<Ledger>,
}

impl Verifier {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Verify every known chain
    pub fn verify_all(&self) -> Result<VerificationReport, LedgerError> {
        self.verify_all_with_cancel(&AtomicBool::new(false))
    }

    /// Verify every known chain, stopping between subjects once `cancel`
    /// is set
    pub fn verify_all_with_cancel(
        &self,
        cancel: &AtomicBool,
    ) -> Result<VerificationReport, LedgerError> {
        let started_at = Utc::now();
        let subjects = self.ledger.subjects()?;
        info!("Verifying {} chains", subjects.len());

        let mut report = VerificationReport {
            subjects_checked: 0,
            valid_chains: 0,
            invalid_chains: 0,
            entries_checked: 0,
            broken: Vec::new(),
            chains: Vec::with_capacity(subjects.len()),
            started_at,
            finished_at: started_at,
            cancelled: false,
        };

        for subject_id in subjects {
            if cancel.load(Ordering::Relaxed) {
                info!(
                    "Verification cancelled after {} subjects",
                    report.subjects_checked
                );
                report.cancelled = true;
                break;
            }

            let result = self.ledger.verify_chain(&subject_id)?;
            report.subjects_checked += 1;
            report.entries_checked += result.entries_checked;

            match result.first_broken_index {
                None => report.valid_chains += 1,
                Some(index) => {
                    report.invalid_chains += 1;
                    report.broken.push(BrokenChain {
                        subject_id: subject_id.clone(),
                        first_broken_index: index,
                        failure: result.failure,
                    });
                }
            }
            report.chains.push(result);
        }

        report.finished_at = Utc::now();
        if report.all_valid() {
            info!(
                "Verified {} chains ({} entries): all valid",
                report.subjects_checked, report.entries_checked
            );
        } else {
            warn!(
                "Verified {} chains: {} invalid",
                report.subjects_checked, report.invalid_chains
            );
        }
        Ok(report)
    }
}
