//! Reading Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A metric value as sent by a sensor: a JSON number or a numeric string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// Parsed numeric value, if any. Non-finite values parse successfully
    /// and are caught by classification.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            MetricValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

/// One sensor sample for a subject (batch or shipment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub subject_id: String,
    pub sensor_id: String,
    pub location: String,
    /// Receive time is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    pub metrics: BTreeMap<String, MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

impl Reading {
    pub fn new(
        subject_id: impl Into<String>,
        sensor_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            sensor_id: sensor_id.into(),
            location: location.into(),
            captured_at: None,
            metrics: BTreeMap::new(),
            idempotency_token: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }
}
