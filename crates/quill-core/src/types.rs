//! Shared value types produced by the deterministic stages.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Risk band. Also used as factor severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
    Critical,
}

impl Level {
    /// Score thresholds: >= 75 critical, >= 50 high, >= 25 medium, else low.
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Level::Critical
        } else if score >= 50.0 {
            Level::High
        } else if score >= 25.0 {
            Level::Medium
        } else {
            Level::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
            Level::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rubric factor that applied to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    /// Human-readable factor name
    pub factor: String,

    /// Severity of this factor (used for ordering)
    pub severity: Level,

    /// Points contributed after capping
    pub weight: f64,

    /// What was observed
    pub detail: String,

    /// Suggested follow-up
    pub recommendation: String,
}

/// Output of the rubric scorer. Produced once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Aggregate score, clamped to [0, 100]
    pub score: f64,

    /// Band derived from `score`
    pub level: Level,

    /// Factors sorted by severity, most severe first
    pub contributing_factors: Vec<ContributingFactor>,
}

/// How the extractor obtained its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// A complete, conforming structured block was decoded
    Strict,
    /// Fields were recovered by keyword and pattern detectors
    Heuristic,
}

/// Fields recovered from generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: BTreeMap<String, JsonValue>,
    pub confidence: Confidence,
    pub unmatched_required_fields: Vec<String>,
}

impl ExtractionResult {
    /// Look up a field as text, if it is a string or a scalar.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            JsonValue::Array(_) | JsonValue::Object(_) => None,
            other => Some(other.to_string()),
        }
    }
}

/// Checklist outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Compliant,
    Deficient,
}

/// Result of running the checklist over a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// round(100 * passed / total); 100 for an empty checklist
    pub score: u8,

    /// Check id -> passed
    pub checklist: BTreeMap<String, bool>,

    pub critical_errors: Vec<String>,

    pub warnings: Vec<String>,

    /// `Deficient` iff `critical_errors` is non-empty
    pub verdict: Verdict,
}

impl ValidationReport {
    /// Build a report, deriving score and verdict from the inputs.
    pub fn new(
        checklist: BTreeMap<String, bool>,
        critical_errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        let total = checklist.len();
        let passed = checklist.values().filter(|ok| **ok).count();
        let score = if total == 0 {
            100
        } else {
            (100.0 * passed as f64 / total as f64).round() as u8
        };
        let verdict = if critical_errors.is_empty() {
            Verdict::Compliant
        } else {
            Verdict::Deficient
        };

        Self {
            score,
            checklist,
            critical_errors,
            warnings,
            verdict,
        }
    }

    /// Ids of checks that did not pass, sorted by id.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checklist
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_deficient(&self) -> bool {
        self.verdict == Verdict::Deficient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(Level::from_score(0.0), Level::Low);
        assert_eq!(Level::from_score(24.99), Level::Low);
        assert_eq!(Level::from_score(25.0), Level::Medium);
        assert_eq!(Level::from_score(50.0), Level::High);
        assert_eq!(Level::from_score(74.9), Level::High);
        assert_eq!(Level::from_score(75.0), Level::Critical);
        assert_eq!(Level::from_score(100.0), Level::Critical);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Critical > Level::High);
        assert!(Level::High > Level::Medium);
        assert!(Level::Medium > Level::Low);
    }

    #[test]
    fn test_report_score_rounding() {
        let mut checklist = BTreeMap::new();
        checklist.insert("a".to_string(), true);
        checklist.insert("b".to_string(), true);
        checklist.insert("c".to_string(), false);

        let report = ValidationReport::new(checklist, vec![], vec!["c failed".to_string()]);
        assert_eq!(report.score, 67);
        assert_eq!(report.verdict, Verdict::Compliant);
        assert_eq!(report.failed_checks(), vec!["c"]);
    }

    #[test]
    fn test_failed_checks_sorted_by_id() {
        let checklist: BTreeMap<String, bool> = [
            ("tone", false),
            ("mentions_case", true),
            ("length", false),
            ("addresses_denial", false),
        ]
        .into_iter()
        .map(|(id, ok)| (id.to_string(), ok))
        .collect();

        let report = ValidationReport::new(checklist, vec![], vec![]);
        assert_eq!(report.failed_checks(), vec!["addresses_denial", "length", "tone"]);
    }

    #[test]
    fn test_report_deficient_only_on_critical() {
        let mut checklist = BTreeMap::new();
        checklist.insert("a".to_string(), true);

        let report = ValidationReport::new(checklist, vec!["boom".to_string()], vec![]);
        assert_eq!(report.score, 100);
        assert_eq!(report.verdict, Verdict::Deficient);
    }

    #[test]
    fn test_empty_checklist_scores_full() {
        let report = ValidationReport::new(BTreeMap::new(), vec![], vec![]);
        assert_eq!(report.score, 100);
        assert!(!report.is_deficient());
    }
}
