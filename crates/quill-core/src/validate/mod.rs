//! Checklist validation.
//!
//! Each check is a named boolean predicate over the final text, the
//! extraction result and the case record. A failing check lands in
//! `critical_errors` when it is marked critical and in `warnings`
//! otherwise. The verdict is `deficient` iff any critical check failed.
//!
//! Validation is local: no network, no clock, no randomness.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::case::CaseRecord;
use crate::error::ConfigurationError;
use crate::extract::patterns;
use crate::types::{ExtractionResult, ValidationReport};

/// A boolean predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Text mentions the case identifier
    ContainsCaseId,

    /// Text mentions the value of a case field (e.g. the credit score used)
    ContainsCaseField { field: String },

    /// At least `chars` characters of trimmed text
    MinLength { chars: usize },

    /// At most `chars` characters of trimmed text
    MaxLength { chars: usize },

    /// None of the phrases appear (case-insensitive)
    ProhibitedPhrases { phrases: Vec<String> },

    /// At least `min_matches` of the phrases appear in the text or, when
    /// `field` is set, in that extracted field
    RequiredPhrase {
        any_of: Vec<String>,
        #[serde(default = "default_min_matches")]
        min_matches: usize,
        #[serde(default)]
        field: Option<String>,
    },

    /// Field present and non-empty in the extraction, or else in the case
    RequiredField { field: String },

    /// List field carries at most `max` items
    MaxItems { field: String, max: usize },

    /// Regex must match, or must not match when `forbid` is set
    Pattern {
        pattern: String,
        #[serde(default)]
        forbid: bool,
    },

    /// No email, phone, SSN or card numbers
    NoPii,
}

fn default_min_matches() -> usize {
    1
}

/// One named checklist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Unique identifier (e.g., "non_discrimination_notice")
    pub id: String,

    /// What the check requires, used in error messages and revision prompts
    pub description: String,

    /// Failing makes the artifact deficient
    #[serde(default)]
    pub critical: bool,

    pub rule: Predicate,
}

struct Outcome {
    passed: bool,
    detail: Option<String>,
}

impl Outcome {
    fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }

    fn from_bool(passed: bool) -> Self {
        Self {
            passed,
            detail: None,
        }
    }
}

/// Everything a predicate may look at.
struct Subject<'a> {
    text: &'a str,
    lowered: String,
    extraction: &'a ExtractionResult,
    case: &'a CaseRecord,
}

/// A checklist compiled for repeated use.
pub struct Validator {
    checks: Vec<Check>,
    patterns: Vec<Option<Regex>>,
}

impl Validator {
    pub fn new(checks: &[Check]) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(checks.len());

        for check in checks {
            if !seen.insert(check.id.as_str()) {
                return Err(ConfigurationError::DuplicateId {
                    section: "checklist".to_string(),
                    id: check.id.clone(),
                });
            }
            let regex = match &check.rule {
                Predicate::Pattern { pattern, .. } => Some(Regex::new(pattern).map_err(|e| {
                    ConfigurationError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    }
                })?),
                _ => None,
            };
            compiled.push(regex);
        }

        Ok(Self {
            checks: checks.to_vec(),
            patterns: compiled,
        })
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn check(&self, id: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.id == id)
    }

    /// Run every check and build the report.
    pub fn validate(
        &self,
        text: &str,
        extraction: &ExtractionResult,
        case: &CaseRecord,
    ) -> ValidationReport {
        let subject = Subject {
            text,
            lowered: text.to_lowercase(),
            extraction,
            case,
        };

        let mut checklist = BTreeMap::new();
        let mut critical_errors = Vec::new();
        let mut warnings = Vec::new();

        for (check, regex) in self.checks.iter().zip(&self.patterns) {
            let outcome = evaluate(&check.rule, regex.as_ref(), &subject);
            checklist.insert(check.id.clone(), outcome.passed);

            if !outcome.passed {
                let message = match outcome.detail {
                    Some(detail) => format!("{}: {} ({})", check.id, check.description, detail),
                    None => format!("{}: {}", check.id, check.description),
                };
                if check.critical {
                    critical_errors.push(message);
                } else {
                    warnings.push(message);
                }
            }
        }

        let report = ValidationReport::new(checklist, critical_errors, warnings);
        debug!(
            score = report.score,
            critical = report.critical_errors.len(),
            warnings = report.warnings.len(),
            "Checklist evaluated"
        );
        report
    }
}

fn evaluate(rule: &Predicate, regex: Option<&Regex>, subject: &Subject<'_>) -> Outcome {
    match rule {
        Predicate::ContainsCaseId => {
            let id = subject.case.case_id().to_lowercase();
            Outcome::from_bool(!id.is_empty() && subject.lowered.contains(&id))
        }

        Predicate::ContainsCaseField { field } => match subject.case.render(field) {
            Some(value) if !value.trim().is_empty() => {
                Outcome::from_bool(subject.lowered.contains(&value.trim().to_lowercase()))
            }
            _ => Outcome::fail(format!("case has no '{}'", field)),
        },

        Predicate::MinLength { chars } => {
            let len = subject.text.trim().chars().count();
            if len >= *chars {
                Outcome::pass()
            } else {
                Outcome::fail(format!("{} < {}", len, chars))
            }
        }

        Predicate::MaxLength { chars } => {
            let len = subject.text.trim().chars().count();
            if len <= *chars {
                Outcome::pass()
            } else {
                Outcome::fail(format!("{} > {}", len, chars))
            }
        }

        Predicate::ProhibitedPhrases { phrases } => {
            let found: Vec<&str> = phrases
                .iter()
                .filter(|p| subject.lowered.contains(&p.to_lowercase()))
                .map(String::as_str)
                .collect();
            if found.is_empty() {
                Outcome::pass()
            } else {
                Outcome::fail(format!("found {}", quoted(&found)))
            }
        }

        Predicate::RequiredPhrase {
            any_of,
            min_matches,
            field,
        } => {
            let haystack = match field {
                Some(field) => field_text(subject.extraction.fields.get(field)).to_lowercase(),
                None => subject.lowered.clone(),
            };
            let hits = any_of
                .iter()
                .filter(|p| haystack.contains(&p.to_lowercase()))
                .count();
            if hits >= *min_matches {
                Outcome::pass()
            } else {
                Outcome::fail(format!("{} of {} required", hits, min_matches))
            }
        }

        Predicate::RequiredField { field } => {
            let extracted = subject
                .extraction
                .fields
                .get(field)
                .is_some_and(|v| !is_empty(v));
            let in_case = subject.case.get(field).is_some_and(|v| !is_empty(v));
            Outcome::from_bool(extracted || in_case)
        }

        Predicate::MaxItems { field, max } => {
            let count = match subject.extraction.fields.get(field) {
                Some(value) => Some(item_count(value)),
                None => subject.case.item_count(field),
            };
            match count {
                Some(n) if n > *max => Outcome::fail(format!("{} items, max {}", n, max)),
                _ => Outcome::pass(),
            }
        }

        Predicate::Pattern { forbid, .. } => {
            let matched = regex.is_some_and(|r| r.is_match(subject.text));
            Outcome::from_bool(matched != *forbid)
        }

        Predicate::NoPii => {
            let kinds = patterns::pii_kinds(subject.text);
            if kinds.is_empty() {
                Outcome::pass()
            } else {
                Outcome::fail(format!("contains {}", kinds.join(", ")))
            }
        }
    }
}

fn quoted(items: &[&str]) -> String {
    items
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ")
}

fn field_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn item_count(value: &JsonValue) -> usize {
    match value {
        JsonValue::Array(items) => items.len(),
        JsonValue::Null => 0,
        _ => 1,
    }
}
