//! Alert Record Book

use crate::store::AlertStore;
use crate::{AlertError, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// A raised alert. Only acknowledgment mutates it; records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: u64,
    pub subject_id: String,
    pub severity: Severity,
    /// Metric that violated its threshold
    pub metric: String,
    pub value: f64,
    pub message: String,
    pub location: String,
    /// Ledger index of the triggering reading
    pub reading_index: u64,
    /// Ledger index of the `AlertRaised` entry
    pub ledger_index: u64,
    pub raised_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

/// Fields supplied when raising an alert
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub subject_id: String,
    pub severity: Severity,
    pub metric: String,
    pub value: f64,
    pub message: String,
    pub location: String,
    pub reading_index: u64,
    pub ledger_index: u64,
}

/// Listing filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub subject_id: Option<String>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: Option<usize>,
}

impl AlertQuery {
    fn matches(&self, record: &AlertRecord) -> bool {
        self.subject_id
            .as_deref()
            .map_or(true, |s| record.subject_id == s)
            && self.severity.map_or(true, |s| record.severity == s)
            && self.acknowledged.map_or(true, |a| record.acknowledged == a)
    }
}

struct AlertLog {
    records: Vec<AlertRecord>,
    next_id: u64,
}

/// Append-only book of alert records.
///
/// With a backing [`AlertStore`] every change is written through before it
/// becomes visible, so a restart reloads the same ids and ack state.
pub struct AlertBook {
    log: Mutex<AlertLog>,
    store: Option<Arc<dyn AlertStore>>,
}

impl AlertBook {
    /// Create an empty, memory-only alert book
    pub fn new() -> Self {
        Self {
            log: Mutex::new(AlertLog {
                records: Vec::new(),
                next_id: 1,
            }),
            store: None,
        }
    }

    /// Load the book from `store` and keep writing through to it
    pub fn with_store(store: Arc<dyn AlertStore>) -> Result<Self, AlertError> {
        let mut records = store.load()?;
        records.sort_by_key(|r| r.id);
        let next_id = records.last().map_or(1, |r| r.id + 1);
        info!(
            "Loaded {} alert records ({} unacknowledged)",
            records.len(),
            records.iter().filter(|r| !r.acknowledged).count()
        );
        Ok(Self {
            log: Mutex::new(AlertLog { records, next_id }),
            store: Some(store),
        })
    }

    fn persist(&self, record: &AlertRecord) -> Result<(), AlertError> {
        match &self.store {
            Some(store) => store.save(record),
            None => Ok(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AlertLog>, AlertError> {
        self.log
            .lock()
            .map_err(|e| AlertError::Unavailable(format!("Lock error: {}", e)))
    }

    /// Record a new alert and return it with its assigned id. Raising the
    /// same `AlertRaised` entry twice returns the existing record.
    pub fn raise(&self, alert: NewAlert) -> Result<AlertRecord, AlertError> {
        self.insert(alert, Utc::now())
    }

    /// Raise an alert rebuilt from an `AlertRaised` entry recorded at
    /// `raised_at`
    pub fn raise_recovered(
        &self,
        alert: NewAlert,
        raised_at: DateTime<Utc>,
    ) -> Result<AlertRecord, AlertError> {
        self.insert(alert, raised_at)
    }

    fn insert(&self, alert: NewAlert, raised_at: DateTime<Utc>) -> Result<AlertRecord, AlertError> {
        let mut log = self.lock()?;
        if let Some(existing) = log
            .records
            .iter()
            .find(|r| r.subject_id == alert.subject_id && r.ledger_index == alert.ledger_index)
        {
            debug!(
                "Alert for {} entry #{} already recorded as {}",
                alert.subject_id, alert.ledger_index, existing.id
            );
            return Ok(existing.clone());
        }

        let record = AlertRecord {
            id: log.next_id,
            subject_id: alert.subject_id,
            severity: alert.severity,
            metric: alert.metric,
            value: alert.value,
            message: alert.message,
            location: alert.location,
            reading_index: alert.reading_index,
            ledger_index: alert.ledger_index,
            raised_at,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        self.persist(&record)?;
        log.next_id += 1;
        log.records.push(record.clone());

        info!(
            "Alert {} raised for {}: {} ({})",
            record.id, record.subject_id, record.message, record.severity
        );
        Ok(record)
    }

    /// Acknowledge an alert. Repeated acknowledgments keep the first time.
    pub fn acknowledge(&self, id: u64, by: Option<&str>) -> Result<AlertRecord, AlertError> {
        let mut log = self.lock()?;
        let slot = log
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(AlertError::NotFound(id))?;

        if slot.acknowledged {
            debug!("Alert {} already acknowledged", id);
            return Ok(slot.clone());
        }

        let mut record = slot.clone();
        record.acknowledged = true;
        record.acknowledged_at = Some(Utc::now());
        record.acknowledged_by = by.map(str::to_string);
        self.persist(&record)?;
        *slot = record.clone();
        info!("Alert acknowledged: {}", id);
        Ok(record)
    }

    /// The record raised for a subject's `AlertRaised` entry, if any
    pub fn find_by_entry(
        &self,
        subject_id: &str,
        ledger_index: u64,
    ) -> Result<Option<AlertRecord>, AlertError> {
        let log = self.lock()?;
        Ok(log
            .records
            .iter()
            .find(|r| r.subject_id == subject_id && r.ledger_index == ledger_index)
            .cloned())
    }

    pub fn get(&self, id: u64) -> Result<AlertRecord, AlertError> {
        let log = self.lock()?;
        log.records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(AlertError::NotFound(id))
    }

    /// List alerts matching the query, newest first
    pub fn list(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>, AlertError> {
        let log = self.lock()?;
        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(log
            .records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    /// Number of unacknowledged alerts
    pub fn pending_count(&self) -> usize {
        self.log
            .lock()
            .map(|l| l.records.iter().filter(|r| !r.acknowledged).count())
            .unwrap_or(0)
    }

    /// Total number of alerts ever raised
    pub fn len(&self) -> usize {
        self.log.lock().map(|l| l.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertBook {
    fn default() -> Self {
        Self::new()
    }
}
