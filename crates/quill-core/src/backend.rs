//! Backend descriptor table.
//!
//! Static registry of available generative backends: capability tags,
//! default sampling parameters, token ceilings and cost class. Loaded once
//! and shared read-only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use crate::error::ConfigurationError;

/// Relative cost of calling a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Economy,
    Standard,
    Premium,
}

impl CostClass {
    /// Cost units charged per call, for usage accounting.
    pub fn units(&self) -> u32 {
        match self {
            CostClass::Economy => 1,
            CostClass::Standard => 2,
            CostClass::Premium => 4,
        }
    }
}

/// One generative backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique identifier (e.g., "claude-sonnet")
    pub id: String,

    /// Capability tags (e.g., "highest-reliability", "structured-output")
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,

    /// Sampling temperature used unless a profile overrides it
    pub default_temperature: f32,

    /// Hard ceiling on output tokens
    pub max_output_tokens: u32,

    pub cost_class: CostClass,
}

impl BackendDescriptor {
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capability_tags.contains(tag)
    }
}

/// Versioned, ordered set of backend descriptors.
///
/// Order matters: capability lookups return backends in table order, which
/// keeps selection reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendTable {
    #[serde(default)]
    pub version: u64,

    pub backends: Vec<BackendDescriptor>,
}

impl BackendTable {
    pub fn new(backends: Vec<BackendDescriptor>) -> Result<Self, ConfigurationError> {
        let table = Self {
            version: 1,
            backends,
        };
        table.validate()?;
        Ok(table)
    }

    /// Parse a table from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let table: BackendTable = serde_yaml::from_str(yaml)?;
        table.validate()?;
        Ok(table)
    }

    /// Parse a table from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self, ConfigurationError> {
        Self::from_yaml(include_str!("../profiles/backends.yaml"))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.backends.is_empty() {
            return Err(ConfigurationError::MissingField("backends".to_string()));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigurationError::MissingField("backends[].id".to_string()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigurationError::DuplicateId {
                    section: "backends".to_string(),
                    id: backend.id.clone(),
                });
            }
            if backend.max_output_tokens == 0 {
                return Err(ConfigurationError::Invalid(format!(
                    "backend '{}' has max_output_tokens = 0",
                    backend.id
                )));
            }
            if !(0.0..=2.0).contains(&backend.default_temperature) {
                return Err(ConfigurationError::Invalid(format!(
                    "backend '{}' temperature {} outside [0, 2]",
                    backend.id, backend.default_temperature
                )));
            }
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.id.as_str())
    }

    /// Backends carrying `tag`, in table order.
    pub fn with_capability<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a BackendDescriptor> {
        self.backends.iter().filter(move |b| b.has_capability(tag))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_loads() {
        let table = BackendTable::builtin().unwrap();
        assert!(table.contains("claude-sonnet"));
        assert!(table.contains("gemini-pro"));

        let reliable: Vec<&str> = table
            .with_capability("highest-reliability")
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(reliable.first(), Some(&"claude-sonnet"));
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let yaml = r#"
backends:
  - id: a
    default_temperature: 0.3
    max_output_tokens: 100
    cost_class: economy
  - id: a
    default_temperature: 0.3
    max_output_tokens: 100
    cost_class: economy
"#;
        assert!(matches!(
            BackendTable::from_yaml(yaml),
            Err(ConfigurationError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_zero_token_ceiling_rejected() {
        let yaml = r#"
backends:
  - id: a
    default_temperature: 0.3
    max_output_tokens: 0
    cost_class: standard
"#;
        assert!(matches!(
            BackendTable::from_yaml(yaml),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_cost_units() {
        assert!(CostClass::Premium.units() > CostClass::Standard.units());
        assert!(CostClass::Standard.units() > CostClass::Economy.units());
    }
}
