//! Threshold Classifier

use crate::AlertError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity tier of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
    /// Non-finite input; never enters the ledger
    Invalid,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Invalid => "invalid",
        }
    }

    /// Inverse of [`Severity::as_str`]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Severity::Normal),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            "invalid" => Some(Severity::Invalid),
            _ => None,
        }
    }

    /// Whether this tier raises an alert
    pub fn is_alert(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }

    fn rank(&self) -> u8 {
        match self {
            Severity::Normal => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
            Severity::Invalid => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive safe operating range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeRange {
    pub low: f64,
    pub high: f64,
}

/// Classifier configuration for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Values inside this range are normal
    pub safe_range: SafeRange,
    /// Distance outside the safe range still classed as a warning
    pub warn_margin: f64,
}

impl ClassifierConfig {
    pub fn new(low: f64, high: f64, warn_margin: f64) -> Self {
        Self {
            safe_range: SafeRange { low, high },
            warn_margin,
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self, metric: &str) -> Result<(), AlertError> {
        let invalid = |reason: &str| AlertError::InvalidThreshold {
            metric: metric.to_string(),
            reason: reason.to_string(),
        };

        let SafeRange { low, high } = self.safe_range;
        if !low.is_finite() || !high.is_finite() || !self.warn_margin.is_finite() {
            return Err(invalid("bounds must be finite"));
        }
        if low > high {
            return Err(invalid("low bound exceeds high bound"));
        }
        if self.warn_margin < 0.0 {
            return Err(invalid("warn margin must not be negative"));
        }
        Ok(())
    }
}

/// Classify a single value against a threshold configuration.
///
/// `[low, high]` is normal, anything within `warn_margin` outside of it is a
/// warning, any other finite value is critical and non-finite input is
/// invalid.
pub fn classify(value: f64, config: &ClassifierConfig) -> Severity {
    if !value.is_finite() {
        return Severity::Invalid;
    }

    let SafeRange { low, high } = config.safe_range;
    if value >= low && value <= high {
        Severity::Normal
    } else if value >= low - config.warn_margin && value <= high + config.warn_margin {
        Severity::Warning
    } else {
        Severity::Critical
    }
}

/// The metric that drove a non-normal classification
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub metric: String,
    pub value: f64,
    /// Absent when the value was non-finite and the metric had no rule
    pub safe_range: Option<SafeRange>,
}

impl Violation {
    /// Human-readable description used on alert records
    pub fn describe(&self) -> String {
        match self.safe_range {
            Some(range) if self.value.is_finite() => format!(
                "{} {} outside safe range [{}, {}]",
                self.metric, self.value, range.low, range.high
            ),
            _ => format!("{} value {} is not a finite number", self.metric, self.value),
        }
    }
}

/// Result of classifying every metric of a reading
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub severity: Severity,
    pub violation: Option<Violation>,
}

/// Per-metric threshold rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable {
    rules: BTreeMap<String, ClassifierConfig>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        // Cold chain: 2-8 °C, critical below 0 or above 10
        rules.insert("temperature".to_string(), ClassifierConfig::new(2.0, 8.0, 2.0));
        rules.insert("humidity".to_string(), ClassifierConfig::new(30.0, 70.0, 10.0));
        Self { rules }
    }
}

impl ThresholdTable {
    /// Create an empty table (no metric is classified)
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Add or replace the rule for a metric
    pub fn with_rule(mut self, metric: impl Into<String>, config: ClassifierConfig) -> Self {
        self.rules.insert(metric.into(), config);
        self
    }

    pub fn rule(&self, metric: &str) -> Option<&ClassifierConfig> {
        self.rules.get(metric)
    }

    /// Validate every rule in the table
    pub fn validate(&self) -> Result<(), AlertError> {
        for (metric, config) in &self.rules {
            config.validate(metric)?;
        }
        Ok(())
    }

    /// Classify a whole reading.
    ///
    /// Any non-finite metric makes the reading invalid. Otherwise the most
    /// severe rule result wins, ties going to the first metric by name.
    pub fn classify_reading(&self, metrics: &BTreeMap<String, f64>) -> Classification {
        if let Some((metric, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Classification {
                severity: Severity::Invalid,
                violation: Some(Violation {
                    metric: metric.clone(),
                    value: *value,
                    safe_range: self.rule(metric).map(|c| c.safe_range),
                }),
            };
        }

        let mut worst = Classification {
            severity: Severity::Normal,
            violation: None,
        };

        for (metric, value) in metrics {
            let Some(config) = self.rules.get(metric) else {
                continue;
            };
            let severity = classify(*value, config);
            if severity.rank() > worst.severity.rank() {
                worst = Classification {
                    severity,
                    violation: Some(Violation {
                        metric: metric.clone(),
                        value: *value,
                        safe_range: Some(config.safe_range),
                    }),
                };
            }
        }

        worst
    }
}
