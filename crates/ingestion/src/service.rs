//! Ingestion Service Implementation

use crate::error::IngestError;
use crate::idempotency::{
    Admission, IdempotencyConfig, IdempotencyWindow, PartialSubmission, Restored,
};
use crate::reading::Reading;
use crate::validator::{ValidatedReading, ValidationConfig, Validator};
use alerting::{
    AlertBook, Classification, NewAlert, SafeRange, Severity, ThresholdTable, Violation,
};
use chrono::{DateTime, Utc};
use ledger::{
    AlertRaised, ApprovalDecided, CustodyTransferred, EventPayload, Ledger, LedgerEntry,
    ReadingRecorded,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub validation: ValidationConfig,
    pub idempotency: IdempotencyConfig,
    /// Rejections kept for inspection
    pub rejection_log_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            idempotency: IdempotencyConfig::default(),
            rejection_log_capacity: 256,
        }
    }
}

/// Alert raised by a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRef {
    pub alert_id: u64,
    /// Index of the `AlertRaised` ledger entry
    pub ledger_index: u64,
}

/// Result of an accepted submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub subject_id: String,
    /// Index of the `ReadingRecorded` entry
    pub ledger_index: u64,
    pub severity: Severity,
    pub alert: Option<AlertRef>,
    pub entry_hash: String,
    /// Returned from the idempotency window rather than processed now
    pub duplicate: bool,
}

/// A reading that was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub subject_id: String,
    pub sensor_id: String,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// What [`IngestionService::recover`] rebuilt from the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub subjects: usize,
    /// Idempotency tokens re-seeded into the window
    pub tokens_restored: usize,
    /// `AlertRaised` entries that had no alert record
    pub alerts_restored: usize,
}

/// Validates, de-duplicates, classifies and records readings
pub struct IngestionService {
    ledger: Arc<Ledger>,
    alerts: Arc<AlertBook>,
    thresholds: ThresholdTable,
    validator: Validator,
    window: IdempotencyWindow,
    rejections: Mutex<VecDeque<RejectionRecord>>,
    config: IngestionConfig,
}

impl IngestionService {
    pub fn new(
        ledger: Arc<Ledger>,
        alerts: Arc<AlertBook>,
        thresholds: ThresholdTable,
        config: IngestionConfig,
    ) -> Result<Self, IngestError> {
        thresholds.validate()?;
        info!("Creating ingestion service with config: {:?}", config);
        Ok(Self {
            ledger,
            alerts,
            thresholds,
            validator: Validator::new(config.validation.clone()),
            window: IdempotencyWindow::new(config.idempotency.clone()),
            rejections: Mutex::new(VecDeque::new()),
            config,
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn alerts(&self) -> &Arc<AlertBook> {
        &self.alerts
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Submit one reading.
    ///
    /// Appends exactly one `ReadingRecorded` entry, plus an `AlertRaised`
    /// entry and alert record when the reading is out of range. A reading
    /// carrying an already-seen token returns the original outcome.
    pub fn submit(&self, reading: Reading) -> Result<SubmitOutcome, IngestError> {
        let now = Utc::now();
        let validated = match self.validator.validate(&reading, now) {
            Ok(v) => v,
            Err(e) => {
                self.reject(&reading.subject_id, &reading.sensor_id, e.to_string(), now);
                return Err(e.into());
            }
        };

        let classification = self.thresholds.classify_reading(&validated.metrics);
        if classification.severity == Severity::Invalid {
            let reason = classification
                .violation
                .as_ref()
                .map(|v| format!("{} is not finite ({})", v.metric, v.value))
                .unwrap_or_else(|| "non-finite metric".to_string());
            self.reject(&validated.subject_id, &validated.sensor_id, reason.clone(), now);
            return Err(IngestError::InvalidReading(reason));
        }

        let token = validated.idempotency_token.clone();
        let admission = match &token {
            Some(token) => self.window.begin(&validated.subject_id, token, now)?,
            None => Admission::Fresh,
        };

        let resume = match admission {
            Admission::Completed(mut outcome) => {
                info!(
                    "Duplicate reading for {} (token {:?}), returning index {}",
                    outcome.subject_id, token, outcome.ledger_index
                );
                metrics::counter!("pharmachain_duplicates_total").increment(1);
                outcome.duplicate = true;
                return Ok(outcome);
            }
            Admission::Resume(partial) => Some(partial),
            Admission::Fresh => None,
        };

        let result = self.process(&validated, &classification, resume);
        if let Some(token) = &token {
            let subject = &validated.subject_id;
            match &result {
                Ok(outcome) => self.window.complete(subject, token, outcome.clone()),
                Err((_, Some(progress))) => {
                    self.window.mark_partial(subject, token, progress.clone())
                }
                Err((_, None)) => self.window.release(subject, token),
            }
        }
        result.map_err(|(e, _)| e)
    }

    /// Run the append steps. On failure, also returns whatever progress
    /// was already committed to the ledger.
    fn process(
        &self,
        reading: &ValidatedReading,
        classification: &Classification,
        resume: Option<PartialSubmission>,
    ) -> Result<SubmitOutcome, (IngestError, Option<PartialSubmission>)> {
        let subject_id = &reading.subject_id;
        let mut progress = match resume {
            Some(partial) => partial,
            None => {
                let payload = EventPayload::ReadingRecorded(ReadingRecorded::new(
                    reading.sensor_id.clone(),
                    reading.location.clone(),
                    reading.captured_at,
                    reading.metrics.clone(),
                    reading.idempotency_token.clone(),
                ));
                let entry = self
                    .ledger
                    .append(subject_id, payload)
                    .map_err(|e| (IngestError::from(e), None))?;
                metrics::counter!(
                    "pharmachain_readings_total",
                    "severity" => classification.severity.as_str()
                )
                .increment(1);
                debug!(
                    "Recorded {} reading #{} for {}",
                    classification.severity, entry.index, subject_id
                );
                PartialSubmission {
                    reading_index: entry.index,
                    entry_hash: entry.curr_hash,
                    alert_entry_index: None,
                }
            }
        };

        let alert = match (&classification.violation, classification.severity.is_alert()) {
            (Some(violation), true) => {
                match self.raise_alert(reading, classification.severity, violation, &mut progress) {
                    Ok(alert) => Some(alert),
                    Err(e) => {
                        warn!(
                            "Alert step failed for {} reading #{}: {}",
                            subject_id, progress.reading_index, e
                        );
                        return Err((e, Some(progress)));
                    }
                }
            }
            _ => None,
        };

        Ok(SubmitOutcome {
            subject_id: subject_id.clone(),
            ledger_index: progress.reading_index,
            severity: classification.severity,
            alert,
            entry_hash: progress.entry_hash,
            duplicate: false,
        })
    }

    fn raise_alert(
        &self,
        reading: &ValidatedReading,
        severity: Severity,
        violation: &Violation,
        progress: &mut PartialSubmission,
    ) -> Result<AlertRef, IngestError> {
        let ledger_index = match progress.alert_entry_index {
            Some(index) => index,
            None => {
                let payload = EventPayload::AlertRaised(AlertRaised {
                    reading_index: progress.reading_index,
                    severity: severity.as_str().to_string(),
                    metric: violation.metric.clone(),
                    value: violation.value,
                    safe_low: violation.safe_range.map(|r| r.low),
                    safe_high: violation.safe_range.map(|r| r.high),
                });
                let entry = self.ledger.append(&reading.subject_id, payload)?;
                progress.alert_entry_index = Some(entry.index);
                entry.index
            }
        };

        let record = self.alerts.raise(NewAlert {
            subject_id: reading.subject_id.clone(),
            severity,
            metric: violation.metric.clone(),
            value: violation.value,
            message: violation.describe(),
            location: reading.location.clone(),
            reading_index: progress.reading_index,
            ledger_index,
        })?;
        metrics::counter!("pharmachain_alerts_raised_total", "severity" => severity.as_str())
            .increment(1);

        Ok(AlertRef {
            alert_id: record.id,
            ledger_index,
        })
    }

    /// Rebuild in-memory state from the ledger after a restart.
    ///
    /// Every `AlertRaised` entry without an alert record gets one, and tokens
    /// of readings still inside the idempotency TTL are re-seeded so a
    /// redelivery returns its original outcome. A reading whose alert step
    /// never committed is restored as partial and finishes on redelivery.
    pub fn recover(&self) -> Result<RecoveryReport, IngestError> {
        let horizon = Utc::now() - self.window.ttl();
        let mut report = RecoveryReport::default();
        let mut settled = Vec::new();

        for subject_id in self.ledger.subjects()? {
            let chain = self.ledger.get_chain(&subject_id)?;
            report.subjects += 1;

            let mut alert_entries: HashMap<u64, (u64, Severity)> = HashMap::new();
            for entry in &chain {
                let EventPayload::AlertRaised(raised) = &entry.payload else {
                    continue;
                };
                let Some(severity) = Severity::parse(&raised.severity) else {
                    warn!(
                        "Unknown severity {:?} on {} entry #{}",
                        raised.severity, subject_id, entry.index
                    );
                    continue;
                };
                alert_entries.insert(raised.reading_index, (entry.index, severity));
                if self.alerts.find_by_entry(&subject_id, entry.index)?.is_some() {
                    continue;
                }
                let location = match chain.get(raised.reading_index as usize) {
                    Some(LedgerEntry {
                        payload: EventPayload::ReadingRecorded(recorded),
                        ..
                    }) => recorded.location.clone(),
                    _ => String::new(),
                };
                let alert = recovered_alert(entry, raised, severity, location);
                self.alerts.raise_recovered(alert, entry.recorded_at)?;
                report.alerts_restored += 1;
            }

            for entry in &chain {
                let EventPayload::ReadingRecorded(recorded) = &entry.payload else {
                    continue;
                };
                let Some(token) = &recorded.idempotency_token else {
                    continue;
                };
                if entry.recorded_at < horizon {
                    continue;
                }
                let state = match alert_entries.get(&entry.index) {
                    Some(&(alert_index, severity)) => {
                        match self.alerts.find_by_entry(&subject_id, alert_index)? {
                            Some(record) => Restored::Completed(SubmitOutcome {
                                subject_id: subject_id.clone(),
                                ledger_index: entry.index,
                                severity,
                                alert: Some(AlertRef {
                                    alert_id: record.id,
                                    ledger_index: alert_index,
                                }),
                                entry_hash: entry.curr_hash.clone(),
                                duplicate: false,
                            }),
                            None => Restored::Partial(PartialSubmission {
                                reading_index: entry.index,
                                entry_hash: entry.curr_hash.clone(),
                                alert_entry_index: Some(alert_index),
                            }),
                        }
                    }
                    None => {
                        let severity =
                            self.thresholds.classify_reading(&recorded.metrics).severity;
                        if severity.is_alert() {
                            Restored::Partial(PartialSubmission {
                                reading_index: entry.index,
                                entry_hash: entry.curr_hash.clone(),
                                alert_entry_index: None,
                            })
                        } else {
                            Restored::Completed(SubmitOutcome {
                                subject_id: subject_id.clone(),
                                ledger_index: entry.index,
                                severity,
                                alert: None,
                                entry_hash: entry.curr_hash.clone(),
                                duplicate: false,
                            })
                        }
                    }
                };
                settled.push((entry.recorded_at, subject_id.clone(), token.clone(), state));
            }
        }

        // Oldest first so eviction order matches arrival order
        settled.sort_by_key(|(recorded_at, ..)| *recorded_at);
        for (recorded_at, subject_id, token, state) in settled {
            if self.window.restore(&subject_id, &token, state, recorded_at) {
                report.tokens_restored += 1;
            }
        }

        info!(
            "Recovered {} subjects: {} tokens, {} alert records",
            report.subjects, report.tokens_restored, report.alerts_restored
        );
        Ok(report)
    }

    fn reject(&self, subject_id: &str, sensor_id: &str, reason: String, now: DateTime<Utc>) {
        warn!(
            "Rejected reading for {:?} from {:?}: {}",
            subject_id, sensor_id, reason
        );
        metrics::counter!("pharmachain_readings_rejected_total").increment(1);

        let Ok(mut log) = self.rejections.lock() else {
            return;
        };
        while log.len() >= self.config.rejection_log_capacity.max(1) {
            log.pop_front();
        }
        log.push_back(RejectionRecord {
            subject_id: subject_id.to_string(),
            sensor_id: sensor_id.to_string(),
            reason,
            rejected_at: now,
        });
    }

    /// Most recent rejections, newest first
    pub fn recent_rejections(&self, limit: usize) -> Vec<RejectionRecord> {
        self.rejections
            .lock()
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Record a hand-off between custodians
    pub fn record_custody_transfer(
        &self,
        subject_id: &str,
        transfer: CustodyTransferred,
    ) -> Result<LedgerEntry, IngestError> {
        self.validator.validate_identifier("subject_id", subject_id)?;
        self.validator.validate_identifier("from_party", &transfer.from_party)?;
        self.validator.validate_identifier("to_party", &transfer.to_party)?;
        self.validator.validate_identifier("location", &transfer.location)?;

        let entry = self
            .ledger
            .append(subject_id, EventPayload::CustodyTransferred(transfer))?;
        info!("Recorded custody transfer #{} for {}", entry.index, subject_id);
        Ok(entry)
    }

    /// Record a regulator decision
    pub fn record_approval(
        &self,
        subject_id: &str,
        decision: ApprovalDecided,
    ) -> Result<LedgerEntry, IngestError> {
        self.validator.validate_identifier("subject_id", subject_id)?;
        self.validator.validate_identifier("authority", &decision.authority)?;

        let approved = decision.approved;
        let entry = self
            .ledger
            .append(subject_id, EventPayload::ApprovalDecided(decision))?;
        info!(
            "Recorded {} decision #{} for {}",
            if approved { "approval" } else { "rejection" },
            entry.index,
            subject_id
        );
        Ok(entry)
    }
}

/// Alert record fields carried by an `AlertRaised` entry
fn recovered_alert(
    entry: &LedgerEntry,
    raised: &AlertRaised,
    severity: Severity,
    location: String,
) -> NewAlert {
    let violation = Violation {
        metric: raised.metric.clone(),
        value: raised.value,
        safe_range: raised
            .safe_low
            .zip(raised.safe_high)
            .map(|(low, high)| SafeRange { low, high }),
    };
    NewAlert {
        subject_id: entry.subject_id.clone(),
        severity,
        metric: violation.metric.clone(),
        value: violation.value,
        message: violation.describe(),
        location,
        reading_index: raised.reading_index,
        ledger_index: entry.index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::reading::MetricValue;
    use ledger::{EventType, LedgerStore, MemoryLedgerStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::thread;

    /// Memory store that can refuse appends on demand
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryLedgerStore,
        fail_all: AtomicBool,
        fail_alerts: AtomicBool,
        /// Appends meet the test thread here before they run
        gate: Mutex<Option<Arc<Barrier>>>,
    }

    impl LedgerStore for FlakyStore {
        fn read_entry(
            &self,
            subject_id: &str,
            index: u64,
        ) -> Result<Option<LedgerEntry>, StoreError> {
            self.inner.read_entry(subject_id, index)
        }

        fn head(&self, subject_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
            self.inner.head(subject_id)
        }

        fn append(&self, entry: LedgerEntry) -> Result<(), StoreError> {
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.wait();
                gate.wait();
            }
            if self.fail_all.load(Ordering::SeqCst)
                || (self.fail_alerts.load(Ordering::SeqCst)
                    && entry.event_type == EventType::AlertRaised)
            {
                return Err(StoreError::Unavailable("disk offline".into()));
            }
            self.inner.append(entry)
        }

        fn scan(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
            self.inner.scan(subject_id)
        }

        fn subjects(&self) -> Result<Vec<String>, StoreError> {
            self.inner.subjects()
        }
    }

    fn setup() -> (Arc<FlakyStore>, IngestionService) {
        let store = Arc::new(FlakyStore::default());
        let service = service_over(store.clone(), IngestionConfig::default());
        (store, service)
    }

    /// A freshly started service over an existing store
    fn service_over(store: Arc<FlakyStore>, config: IngestionConfig) -> IngestionService {
        IngestionService::new(
            Arc::new(Ledger::new(store)),
            Arc::new(AlertBook::new()),
            ThresholdTable::default(),
            config,
        )
        .unwrap()
    }

    fn reading(temp: f64) -> Reading {
        Reading::new("BATCH-1", "SENSOR-001", "Warehouse A")
            .with_metric("temperature", temp)
            .with_metric("humidity", 45.0)
    }

    #[test]
    fn test_normal_reading_appends_once() {
        let (_, service) = setup();
        let outcome = service.submit(reading(5.0)).unwrap();

        assert_eq!(outcome.ledger_index, 0);
        assert_eq!(outcome.severity, Severity::Normal);
        assert!(outcome.alert.is_none());
        assert!(!outcome.duplicate);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 1);
        assert!(service.alerts().is_empty());
    }

    #[test]
    fn test_excursion_raises_alert() {
        let (_, service) = setup();
        service.submit(reading(5.0)).unwrap();
        let outcome = service.submit(reading(9.5)).unwrap();

        assert_eq!(outcome.ledger_index, 1);
        assert_eq!(outcome.severity, Severity::Warning);
        let alert = outcome.alert.unwrap();
        assert_eq!(alert.ledger_index, 2);

        let entry = service.ledger().get_entry("BATCH-1", 2).unwrap();
        match entry.payload {
            EventPayload::AlertRaised(raised) => {
                assert_eq!(raised.reading_index, 1);
                assert_eq!(raised.severity, "warning");
                assert_eq!(raised.metric, "temperature");
                assert_eq!(raised.safe_high, Some(8.0));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let record = service.alerts().get(alert.alert_id).unwrap();
        assert_eq!(record.reading_index, 1);
        assert_eq!(record.ledger_index, 2);
        assert_eq!(record.location, "Warehouse A");
        assert!(record.message.contains("temperature"));
        assert!(service.ledger().verify_chain("BATCH-1").unwrap().valid);
    }

    #[test]
    fn test_critical_excursion() {
        let (_, service) = setup();
        let outcome = service.submit(reading(-1.5)).unwrap();
        assert_eq!(outcome.severity, Severity::Critical);
        assert_eq!(service.alerts().pending_count(), 1);
    }

    #[test]
    fn test_duplicate_token_returns_original() {
        let (_, service) = setup();
        let first = service.submit(reading(9.5).with_token("tok-1")).unwrap();
        let second = service.submit(reading(9.5).with_token("tok-1")).unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.ledger_index, first.ledger_index);
        assert_eq!(second.alert, first.alert);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 2);
        assert_eq!(service.alerts().len(), 1);
    }

    #[test]
    fn test_non_finite_rejected_not_appended() {
        let (_, service) = setup();
        let err = service
            .submit(reading(5.0).with_metric("humidity", MetricValue::Text("NaN".into())))
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidReading(_)));
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 0);

        let rejections = service.recent_rejections(10);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].subject_id, "BATCH-1");
        assert!(rejections[0].reason.contains("humidity"));
    }

    #[test]
    fn test_validation_failure_rejected() {
        let (_, service) = setup();
        let mut bad = reading(5.0);
        bad.sensor_id.clear();
        let err = service.submit(bad).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(service.recent_rejections(10).len(), 1);
        assert!(service.ledger().subjects().unwrap().is_empty());
    }

    #[test]
    fn test_storage_failure_releases_token() {
        let (store, service) = setup();
        store.fail_all.store(true, Ordering::SeqCst);
        let err = service.submit(reading(5.0).with_token("tok-2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryLater);

        store.fail_all.store(false, Ordering::SeqCst);
        let outcome = service.submit(reading(5.0).with_token("tok-2")).unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 1);
    }

    #[test]
    fn test_in_flight_duplicate_is_retryable() {
        let (store, service) = setup();
        let service = Arc::new(service);
        let gate = Arc::new(Barrier::new(2));
        *store.gate.lock().unwrap() = Some(gate.clone());
        store.fail_all.store(true, Ordering::SeqCst);

        let first = {
            let service = service.clone();
            thread::spawn(move || service.submit(reading(5.0).with_token("tok-x")))
        };
        // First submission is now inside the store append
        gate.wait();
        let retry = service.submit(reading(5.0).with_token("tok-x")).unwrap_err();
        assert!(matches!(retry, IngestError::DuplicateInFlight { .. }));
        assert_eq!(retry.kind(), ErrorKind::RetryLater);
        gate.wait();

        let err = first.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryLater);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 0);

        // The reading was never acknowledged, so a later redelivery lands
        *store.gate.lock().unwrap() = None;
        store.fail_all.store(false, Ordering::SeqCst);
        let outcome = service.submit(reading(5.0).with_token("tok-x")).unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 1);
    }

    #[test]
    fn test_partial_alert_failure_resumes() {
        let (store, service) = setup();
        store.fail_alerts.store(true, Ordering::SeqCst);
        let err = service.submit(reading(11.0).with_token("tok-3")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryLater);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 1);
        assert!(service.alerts().is_empty());

        store.fail_alerts.store(false, Ordering::SeqCst);
        let outcome = service.submit(reading(11.0).with_token("tok-3")).unwrap();
        assert_eq!(outcome.ledger_index, 0);
        assert_eq!(outcome.severity, Severity::Critical);
        assert_eq!(outcome.alert.unwrap().ledger_index, 1);

        let chain = service.ledger().get_chain("BATCH-1").unwrap();
        let kinds: Vec<_> = chain.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::ReadingRecorded, EventType::AlertRaised]);
        assert_eq!(service.alerts().len(), 1);

        let again = service.submit(reading(11.0).with_token("tok-3")).unwrap();
        assert!(again.duplicate);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 2);
    }

    #[test]
    fn test_recover_rebuilds_alerts_and_tokens() {
        let (store, before) = setup();
        before.submit(reading(5.0).with_token("tok-a")).unwrap();
        let critical = before.submit(reading(11.0).with_token("tok-b")).unwrap();
        before.submit(reading(9.5)).unwrap();
        let chain_len = before.ledger().chain_len("BATCH-1").unwrap();

        let after = service_over(store, IngestionConfig::default());
        let report = after.recover().unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                subjects: 1,
                tokens_restored: 2,
                alerts_restored: 2,
            }
        );

        // Ids come back in ledger order, matching the original book
        let original = critical.alert.clone().unwrap();
        let old = before.alerts().get(original.alert_id).unwrap();
        let new = after.alerts().get(original.alert_id).unwrap();
        assert_eq!(new.ledger_index, old.ledger_index);
        assert_eq!(new.message, old.message);
        assert_eq!(new.location, "Warehouse A");
        assert_eq!(new.severity, Severity::Critical);
        assert_eq!(after.alerts().len(), 2);

        let again = after.submit(reading(11.0).with_token("tok-b")).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.alert, critical.alert);
        assert_eq!(again.entry_hash, critical.entry_hash);
        assert!(after.submit(reading(5.0).with_token("tok-a")).unwrap().duplicate);
        assert_eq!(after.ledger().chain_len("BATCH-1").unwrap(), chain_len);

        // A second pass finds nothing left to rebuild
        let report = after.recover().unwrap();
        assert_eq!(report.tokens_restored, 0);
        assert_eq!(report.alerts_restored, 0);
        assert_eq!(after.alerts().len(), 2);
    }

    #[test]
    fn test_recover_finishes_interrupted_alert_step() {
        let (store, before) = setup();
        store.fail_alerts.store(true, Ordering::SeqCst);
        before.submit(reading(11.0).with_token("tok-c")).unwrap_err();
        store.fail_alerts.store(false, Ordering::SeqCst);

        let after = service_over(store, IngestionConfig::default());
        let report = after.recover().unwrap();
        assert_eq!(report.tokens_restored, 1);
        assert_eq!(report.alerts_restored, 0);

        let outcome = after.submit(reading(11.0).with_token("tok-c")).unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.ledger_index, 0);
        assert_eq!(outcome.alert.unwrap().ledger_index, 1);
        assert_eq!(after.ledger().chain_len("BATCH-1").unwrap(), 2);
        assert_eq!(after.alerts().len(), 1);
    }

    #[test]
    fn test_recover_skips_expired_tokens() {
        let (store, before) = setup();
        before.submit(reading(5.0).with_token("tok-d")).unwrap();

        let config = IngestionConfig {
            idempotency: IdempotencyConfig {
                ttl_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let after = service_over(store, config);
        assert_eq!(after.recover().unwrap().tokens_restored, 0);
    }

    #[test]
    fn test_custody_and_approval() {
        let (_, service) = setup();
        service.submit(reading(5.0)).unwrap();

        let transfer = service
            .record_custody_transfer(
                "BATCH-1",
                CustodyTransferred {
                    from_party: "manufacturer".into(),
                    to_party: "distributor".into(),
                    location: "Dock 2".into(),
                    note: Some("seal intact".into()),
                },
            )
            .unwrap();
        assert_eq!(transfer.index, 1);
        assert_eq!(transfer.event_type, EventType::CustodyTransferred);

        let approval = service
            .record_approval(
                "BATCH-1",
                ApprovalDecided {
                    authority: "FDA".into(),
                    approved: false,
                    reason: Some("temperature excursions".into()),
                },
            )
            .unwrap();
        assert_eq!(approval.index, 2);

        let err = service
            .record_custody_transfer(
                "BATCH-1",
                CustodyTransferred {
                    from_party: "".into(),
                    to_party: "pharmacy".into(),
                    location: "Store".into(),
                    note: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(service.ledger().chain_len("BATCH-1").unwrap(), 3);
    }

    #[test]
    fn test_concurrent_submissions() {
        let (_, service) = setup();
        let service = Arc::new(service);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let service = service.clone();
                thread::spawn(move || {
                    for i in 0..20 {
                        let subject = if t % 2 == 0 { "BATCH-A" } else { "BATCH-B" };
                        let r = Reading::new(subject, format!("SENSOR-{}", t), "Truck")
                            .with_metric("temperature", 4.0 + (i % 3) as f64)
                            .with_token(format!("{}-{}", t, i));
                        service.submit(r).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for subject in ["BATCH-A", "BATCH-B"] {
            let verification = service.ledger().verify_chain(subject).unwrap();
            assert!(verification.valid);
            assert_eq!(verification.entries_checked, 40);
        }
    }
}
