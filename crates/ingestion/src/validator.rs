//! Reading Validator

use crate::reading::Reading;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound applied to the configured clock skew allowance
const MAX_SKEW_SECS: i64 = 365 * 24 * 60 * 60;

/// Errors during reading validation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },

    #[error("Reading has no metrics")]
    NoMetrics,

    #[error("Invalid metric {name:?}: {reason}")]
    InvalidMetric { name: String, reason: String },

    #[error("captured_at {captured_at} is more than {max_skew_secs}s in the future")]
    FutureTimestamp {
        captured_at: DateTime<Utc>,
        max_skew_secs: i64,
    },
}

/// Validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Longest accepted identifier, in characters
    pub max_id_len: usize,
    /// Most metrics accepted in one reading
    pub max_metrics: usize,
    /// How far ahead of the receive time `captured_at` may be
    pub max_future_skew_secs: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_id_len: 128,
            max_metrics: 32,
            max_future_skew_secs: 300,
        }
    }
}

/// A reading that passed validation, with parsed metrics
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReading {
    pub subject_id: String,
    pub sensor_id: String,
    pub location: String,
    pub captured_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub idempotency_token: Option<String>,
}

/// Structural validator for incoming readings
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate an identifier-like field: present, bounded, printable
    pub fn validate_identifier(
        &self,
        field: &'static str,
        value: &str,
    ) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
        if value.chars().count() > self.config.max_id_len {
            return Err(ValidationError::InvalidIdentifier {
                field,
                reason: format!("longer than {} characters", self.config.max_id_len),
            });
        }
        if value.chars().any(char::is_control) {
            return Err(ValidationError::InvalidIdentifier {
                field,
                reason: "contains control characters".to_string(),
            });
        }
        Ok(())
    }

    /// Check required fields and numeric parseability. Range checks are the
    /// classifier's job, so out-of-range and non-finite values pass here.
    pub fn validate(
        &self,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<ValidatedReading, ValidationError> {
        self.validate_identifier("subject_id", &reading.subject_id)?;
        self.validate_identifier("sensor_id", &reading.sensor_id)?;
        self.validate_identifier("location", &reading.location)?;
        if let Some(token) = &reading.idempotency_token {
            self.validate_identifier("idempotency_token", token)?;
        }

        if reading.metrics.is_empty() {
            return Err(ValidationError::NoMetrics);
        }
        if reading.metrics.len() > self.config.max_metrics {
            return Err(ValidationError::InvalidMetric {
                name: String::new(),
                reason: format!("more than {} metrics", self.config.max_metrics),
            });
        }

        let mut metrics = BTreeMap::new();
        for (name, value) in &reading.metrics {
            if name.trim().is_empty() {
                return Err(ValidationError::InvalidMetric {
                    name: name.clone(),
                    reason: "empty name".to_string(),
                });
            }
            let parsed = value.as_f64().ok_or_else(|| ValidationError::InvalidMetric {
                name: name.clone(),
                reason: format!("not a number: {:?}", value),
            })?;
            metrics.insert(name.clone(), parsed);
        }

        let captured_at = reading.captured_at.unwrap_or(now);
        let skew = Duration::seconds(self.config.max_future_skew_secs.clamp(0, MAX_SKEW_SECS));
        let latest = now.checked_add_signed(skew).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if captured_at > latest {
            return Err(ValidationError::FutureTimestamp {
                captured_at,
                max_skew_secs: self.config.max_future_skew_secs,
            });
        }

        Ok(ValidatedReading {
            subject_id: reading.subject_id.clone(),
            sensor_id: reading.sensor_id.clone(),
            location: reading.location.clone(),
            captured_at,
            metrics,
            idempotency_token: reading.idempotency_token.clone(),
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::MetricValue;

    fn reading() -> Reading {
        Reading::new("BATCH-1", "SENSOR-001", "Warehouse A").with_metric("temperature", 5.0)
    }

    #[test]
    fn test_valid_reading() {
        let now = Utc::now();
        let validated = Validator::default()
            .validate(&reading().with_metric("humidity", MetricValue::Text("45".into())), now)
            .unwrap();

        assert_eq!(validated.captured_at, now);
        assert_eq!(validated.metrics["humidity"], 45.0);
        assert_eq!(validated.metrics.len(), 2);
    }

    #[test]
    fn test_missing_fields() {
        let validator = Validator::default();
        let now = Utc::now();

        let mut r = reading();
        r.subject_id = "  ".into();
        assert_eq!(
            validator.validate(&r, now),
            Err(ValidationError::MissingField("subject_id"))
        );

        let mut r = reading();
        r.location.clear();
        assert_eq!(
            validator.validate(&r, now),
            Err(ValidationError::MissingField("location"))
        );

        let mut r = reading();
        r.metrics.clear();
        assert_eq!(validator.validate(&r, now), Err(ValidationError::NoMetrics));
    }

    #[test]
    fn test_bad_identifiers() {
        let validator = Validator::default();
        let now = Utc::now();

        let mut r = reading();
        r.sensor_id = "S".repeat(129);
        assert!(matches!(
            validator.validate(&r, now),
            Err(ValidationError::InvalidIdentifier { field: "sensor_id", .. })
        ));

        let mut r = reading();
        r.subject_id = "BATCH\n1".into();
        assert!(matches!(
            validator.validate(&r, now),
            Err(ValidationError::InvalidIdentifier { field: "subject_id", .. })
        ));
    }

    #[test]
    fn test_unparseable_metric() {
        let r = reading().with_metric("humidity", MetricValue::Text("damp".into()));
        assert!(matches!(
            Validator::default().validate(&r, Utc::now()),
            Err(ValidationError::InvalidMetric { name, .. }) if name == "humidity"
        ));
    }

    #[test]
    fn test_non_finite_passes_validation() {
        let r = reading().with_metric("humidity", f64::NAN);
        let validated = Validator::default().validate(&r, Utc::now()).unwrap();
        assert!(validated.metrics["humidity"].is_nan());
    }

    #[test]
    fn test_future_skew() {
        let validator = Validator::default();
        let now = Utc::now();

        let ok = reading().with_captured_at(now + Duration::seconds(299));
        assert!(validator.validate(&ok, now).is_ok());

        let late = reading().with_captured_at(now - Duration::days(3));
        assert!(validator.validate(&late, now).is_ok());

        let ahead = reading().with_captured_at(now + Duration::seconds(301));
        assert!(matches!(
            validator.validate(&ahead, now),
            Err(ValidationError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_extreme_skew_config_does_not_panic() {
        let validator = Validator::new(ValidationConfig {
            max_future_skew_secs: i64::MAX,
            ..ValidationConfig::default()
        });
        let now = Utc::now();
        let ahead = reading().with_captured_at(now + Duration::days(30));
        assert!(validator.validate(&ahead, now).is_ok());

        let validator = Validator::new(ValidationConfig {
            max_future_skew_secs: i64::MIN,
            ..ValidationConfig::default()
        });
        let soon = reading().with_captured_at(now + Duration::seconds(1));
        assert!(matches!(
            validator.validate(&soon, now),
            Err(ValidationError::FutureTimestamp { .. })
        ));
    }
}
