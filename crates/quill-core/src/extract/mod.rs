//! Structured extraction from generated text.
//!
//! Two phases:
//!
//! 1. **Strict.** Decode the first `{...}` block that can open a JSON
//!    object; brace blocks like `{placeholder}` are skipped. An unbalanced
//!    or undecodable block ends the phase. If the object carries every
//!    required field and conforms to the optional JSON Schema, confidence
//!    is `strict`.
//! 2. **Heuristic.** Otherwise run the ordered detectors (keyword phrases,
//!    reference-format patterns), then `field: value` lines for required
//!    fields still missing. A decoded but nonconforming object seeds the
//!    field map. Confidence is `heuristic`.
//!
//! Extraction never fails. Missing required fields are reported in
//! `unmatched_required_fields`.

pub mod patterns;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::types::{Confidence, ExtractionResult};

/// What the profile expects to recover from a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExpectedSchema {
    /// Fields that must be present for a strict result
    #[serde(default)]
    pub required_fields: Vec<String>,

    /// Optional JSON Schema the decoded block must satisfy
    #[serde(default)]
    pub json_schema: Option<JsonValue>,

    /// Heuristic detectors, run in order
    #[serde(default)]
    pub detectors: Vec<FieldDetector>,
}

impl ExpectedSchema {
    /// True when the profile expects any structured output at all.
    pub fn is_structured(&self) -> bool {
        !self.required_fields.is_empty() || self.json_schema.is_some()
    }
}

/// A heuristic detector bound to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDetector {
    pub field: String,
    pub detect: Detect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detect {
    /// Case-insensitive phrase dictionary. The field takes `value` when
    /// given, otherwise the first phrase found.
    Keywords {
        phrases: Vec<String>,
        #[serde(default)]
        value: Option<JsonValue>,
    },

    /// A built-in pattern name (see [`patterns::builtin`]) or a regex.
    /// With `all`, every distinct match is collected into a list.
    Pattern {
        pattern: String,
        #[serde(default)]
        all: bool,
    },
}

enum CompiledDetect {
    Keywords {
        phrases: Vec<(String, String)>,
        value: Option<JsonValue>,
    },
    Pattern {
        regex: Regex,
        all: bool,
    },
}

struct CompiledDetector {
    field: String,
    detect: CompiledDetect,
}

impl CompiledDetector {
    fn run(&self, text: &str, lowered: &str) -> Option<JsonValue> {
        match &self.detect {
            CompiledDetect::Keywords { phrases, value } => {
                let (phrase, _) = phrases.iter().find(|(_, needle)| lowered.contains(needle))?;
                Some(
                    value
                        .clone()
                        .unwrap_or_else(|| JsonValue::String(phrase.clone())),
                )
            }
            CompiledDetect::Pattern { regex, all: false } => {
                patterns::first_match(regex, text).map(JsonValue::String)
            }
            CompiledDetect::Pattern { regex, all: true } => {
                let found = patterns::all_matches(regex, text);
                if found.is_empty() {
                    None
                } else {
                    Some(JsonValue::Array(
                        found.into_iter().map(JsonValue::String).collect(),
                    ))
                }
            }
        }
    }
}

/// Extractor compiled from an [`ExpectedSchema`].
pub struct StructuredExtractor {
    required_fields: Vec<String>,
    schema: Option<jsonschema::Validator>,
    detectors: Vec<CompiledDetector>,
    labels: Vec<(String, Regex)>,
}

impl StructuredExtractor {
    /// Compile detectors, label patterns and the JSON Schema.
    pub fn new(task: &str, expected: &ExpectedSchema) -> Result<Self, ConfigurationError> {
        let schema = match &expected.json_schema {
            Some(schema) => Some(jsonschema::options().build(schema).map_err(|e| {
                ConfigurationError::InvalidSchema {
                    task: task.to_string(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let mut detectors = Vec::with_capacity(expected.detectors.len());
        for detector in &expected.detectors {
            let detect = match &detector.detect {
                Detect::Keywords { phrases, value } => CompiledDetect::Keywords {
                    phrases: phrases
                        .iter()
                        .map(|p| (p.clone(), p.to_lowercase()))
                        .collect(),
                    value: value.clone(),
                },
                Detect::Pattern { pattern, all } => CompiledDetect::Pattern {
                    regex: compile_pattern(pattern)?,
                    all: *all,
                },
            };
            detectors.push(CompiledDetector {
                field: detector.field.clone(),
                detect,
            });
        }

        let mut labels = Vec::with_capacity(expected.required_fields.len());
        for field in &expected.required_fields {
            labels.push((field.clone(), label_pattern(field)?));
        }

        Ok(Self {
            required_fields: expected.required_fields.clone(),
            schema,
            detectors,
            labels,
        })
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Extract fields from `raw_text`.
    pub fn extract(&self, raw_text: &str) -> ExtractionResult {
        let decoded = first_json_object(raw_text);

        if let Some(object) = &decoded {
            if self.conforms(object) {
                debug!(fields = object.len(), "Strict extraction");
                return ExtractionResult {
                    fields: object.clone().into_iter().collect(),
                    confidence: Confidence::Strict,
                    unmatched_required_fields: Vec::new(),
                };
            }
        }

        let mut fields: BTreeMap<String, JsonValue> = decoded
            .map(|object| object.into_iter().collect())
            .unwrap_or_default();

        let lowered = raw_text.to_lowercase();
        for detector in &self.detectors {
            if fields.contains_key(&detector.field) {
                continue;
            }
            if let Some(value) = detector.run(raw_text, &lowered) {
                fields.insert(detector.field.clone(), value);
            }
        }

        for (field, regex) in &self.labels {
            if fields.contains_key(field) {
                continue;
            }
            if let Some(value) = patterns::first_match(regex, raw_text) {
                if !value.is_empty() {
                    fields.insert(field.clone(), JsonValue::String(value));
                }
            }
        }

        let unmatched_required_fields: Vec<String> = self
            .required_fields
            .iter()
            .filter(|f| !fields.contains_key(*f))
            .cloned()
            .collect();

        debug!(
            fields = fields.len(),
            unmatched = unmatched_required_fields.len(),
            "Heuristic extraction"
        );

        ExtractionResult {
            fields,
            confidence: Confidence::Heuristic,
            unmatched_required_fields,
        }
    }

    fn conforms(&self, object: &Map<String, JsonValue>) -> bool {
        if !self.required_fields.iter().all(|f| object.contains_key(f)) {
            return false;
        }
        match &self.schema {
            Some(validator) => validator.is_valid(&JsonValue::Object(object.clone())),
            None => true,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigurationError> {
    if let Some(builtin) = patterns::builtin(pattern) {
        return Ok(builtin.clone());
    }
    Regex::new(pattern).map_err(|e| ConfigurationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// `denial_reasons` matches a line like `Denial reasons: ...`.
fn label_pattern(field: &str) -> Result<Regex, ConfigurationError> {
    let label = field
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[_\s-]+");
    let source = format!(r"(?im)^[\s>*-]*\**{}\**\s*:\s*(.+?)\s*$", label);
    Regex::new(&source).map_err(|e| ConfigurationError::InvalidPattern {
        pattern: source.clone(),
        reason: e.to_string(),
    })
}

/// Byte range of the balanced `{...}` block opening at `start`.
fn balanced_block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// The JSON object in `text`, if the first block that could be one decodes.
///
/// Balanced blocks that cannot open an object (`{placeholders}`) are skipped
/// whole. The first block that can is the only candidate: if it is
/// unbalanced or fails to decode there is no object, even when a valid one
/// is nested inside it.
pub fn first_json_object(text: &str) -> Option<Map<String, JsonValue>> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(pos) = text[search_from..].find('{') {
        let start = search_from + pos;
        let end = balanced_block_end(bytes, start);

        if !opens_object(&text[start + 1..]) {
            // Nothing after an unbalanced brace can close a block either.
            search_from = end?;
            continue;
        }

        return match serde_json::from_str(&text[start..end?]) {
            Ok(JsonValue::Object(object)) => Some(object),
            _ => None,
        };
    }
    None
}

/// Whether text following a `{` starts like a JSON object body.
fn opens_object(rest: &str) -> bool {
    matches!(rest.trim_start().chars().next(), Some('"') | Some('}'))
}
