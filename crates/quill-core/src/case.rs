//! Case records.
//!
//! A case record is the immutable input to a run: an identifier plus a map of
//! domain fields (amounts, dates, category codes, free-text narrative).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ConfigurationError;

/// Immutable description of the matter being handled.
///
/// Fields are kept in a `BTreeMap` so iteration order (and therefore prompt
/// rendering and scoring) is stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    case_id: String,

    #[serde(default)]
    fields: BTreeMap<String, JsonValue>,
}

impl CaseRecord {
    /// Create an empty case record.
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Return a copy with one more field set.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parse a case record from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let record: CaseRecord = serde_json::from_str(json)?;
        if record.case_id.trim().is_empty() {
            return Err(ConfigurationError::MissingField("case_id".to_string()));
        }
        Ok(record)
    }

    /// Parse a case record from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn fields(&self) -> &BTreeMap<String, JsonValue> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    /// Read a field as a numeric signal.
    ///
    /// Numbers are returned as-is, booleans map to 1.0 / 0.0 and numeric
    /// strings are parsed. Anything else is treated as absent.
    pub fn signal(&self, key: &str) -> Option<f64> {
        let value = match self.fields.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            JsonValue::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    /// Read a field as text.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }

    /// Number of items when the field is a list, 1 for a scalar, 0 when absent.
    pub fn item_count(&self, key: &str) -> Option<usize> {
        match self.fields.get(key)? {
            JsonValue::Array(items) => Some(items.len()),
            JsonValue::Null => Some(0),
            _ => Some(1),
        }
    }

    /// Render a field for prompt text.
    pub fn render(&self, key: &str) -> Option<String> {
        let value = self.fields.get(key)?;
        Some(match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        })
    }
}
