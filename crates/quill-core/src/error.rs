//! Configuration errors.
//!
//! These are the only fatal errors the deterministic core produces. Everything
//! else (partial extraction, failed checklist items) is reported as data.

use thiserror::Error;

/// Missing or invalid descriptor table, policy, or profile. Never retried.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Duplicate id '{id}' in {section}")]
    DuplicateId { section: String, id: String },

    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("Unknown task type '{0}'")]
    UnknownTask(String),

    #[error("Invalid rubric factor '{factor}': {reason}")]
    InvalidFactor { factor: String, reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid JSON schema for task '{task}': {reason}")]
    InvalidSchema { task: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
