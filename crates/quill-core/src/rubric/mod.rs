//! Rubric definitions and scoring.
//!
//! A rubric is an ordered list of factor rules. Each applicable factor
//! contributes `min(cap, f(input))` points; the sum is clamped to 100 and
//! mapped to a [`Level`](crate::Level) at fixed thresholds.
//!
//! Rubrics are data. They are declared in domain profiles (YAML) and
//! validated on load.

mod scorer;
pub mod signals;

pub use scorer::RubricScorer;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigurationError;
use crate::types::Level;

/// When a factor applies, based on its input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Value strictly below the threshold
    Below { value: f64 },

    /// Value strictly above the threshold
    Above { value: f64 },

    /// Flag set (non-zero)
    IsTrue,

    /// Flag clear (zero)
    IsFalse,

    /// Always applies when the input is present
    Always,
}

impl Trigger {
    pub fn matches(&self, input: f64) -> bool {
        match self {
            Trigger::Below { value } => input < *value,
            Trigger::Above { value } => input > *value,
            Trigger::IsTrue => input != 0.0,
            Trigger::IsFalse => input == 0.0,
            Trigger::Always => true,
        }
    }
}

/// Raw (uncapped) points for an applicable factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Points {
    /// Constant contribution
    Fixed { value: f64 },

    /// `|input - from| * per_unit`
    Distance { from: f64, per_unit: f64 },
}

impl Points {
    pub fn raw(&self, input: f64) -> f64 {
        match self {
            Points::Fixed { value } => *value,
            Points::Distance { from, per_unit } => (input - from).abs() * per_unit,
        }
    }
}

/// Severity bump when a stronger condition also holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub when: Trigger,
    pub severity: Level,
}

/// How to derive an input that the case record does not carry directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Derivation {
    /// Keyword sentiment over a narrative field, in [-1, 0]
    KeywordSentiment { narrative_field: String },
}

/// One scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRule {
    /// Unique identifier within the rubric
    pub id: String,

    /// Display name (e.g. "Usage Decline")
    pub factor: String,

    /// Case record field read by this rule
    pub input: String,

    /// Value assumed when the field is absent
    #[serde(default)]
    pub default: Option<f64>,

    /// Fallback derivation when the field is absent
    #[serde(default)]
    pub derive: Option<Derivation>,

    pub trigger: Trigger,

    pub points: Points,

    /// Upper bound on this factor's contribution
    pub cap: f64,

    pub severity: Level,

    #[serde(default)]
    pub escalate: Option<Escalation>,

    /// Detail text; `{value}` is replaced by the input value
    pub detail: String,

    #[serde(default)]
    pub recommendation: String,
}

/// An ordered set of factor rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Rubric {
    #[serde(default)]
    pub factors: Vec<FactorRule>,
}

impl Rubric {
    /// Check ids are unique and caps/points are finite and non-negative.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = HashSet::new();

        for rule in &self.factors {
            if rule.id.trim().is_empty() {
                return Err(ConfigurationError::MissingField("rubric.factors[].id".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigurationError::DuplicateId {
                    section: "rubric.factors".to_string(),
                    id: rule.id.clone(),
                });
            }
            if !rule.cap.is_finite() || rule.cap < 0.0 {
                return Err(ConfigurationError::InvalidFactor {
                    factor: rule.id.clone(),
                    reason: format!("cap must be finite and non-negative, got {}", rule.cap),
                });
            }
            let points_ok = match &rule.points {
                Points::Fixed { value } => value.is_finite(),
                Points::Distance { from, per_unit } => from.is_finite() && per_unit.is_finite(),
            };
            if !points_ok {
                return Err(ConfigurationError::InvalidFactor {
                    factor: rule.id.clone(),
                    reason: "points must be finite".to_string(),
                });
            }
        }

        Ok(())
    }
}
