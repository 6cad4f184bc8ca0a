//! Domain profiles.
//!
//! A profile binds one task type to everything the pipeline needs for it:
//! rubric, prompt template, extraction schema, checklist, deficiency policy
//! and sampling overrides. Profiles are YAML and validated on load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigurationError;
use crate::extract::{ExpectedSchema, StructuredExtractor};
use crate::prompt::{PromptAssembler, PromptTemplate};
use crate::rubric::{Rubric, RubricScorer};
use crate::validate::{Check, Validator};

const BUILTIN_PROFILES: &[(&str, &str)] = &[
    ("retention", include_str!("../profiles/retention.yaml")),
    (
        "healthcare_appeal",
        include_str!("../profiles/healthcare_appeal.yaml"),
    ),
    (
        "mortgage_denial",
        include_str!("../profiles/mortgage_denial.yaml"),
    ),
    ("deescalation", include_str!("../profiles/deescalation.yaml")),
];

/// What to do when the checklist finds critical errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeficiencyPolicy {
    /// Return the deficient artifact with its errors surfaced
    #[default]
    ReturnWithWarnings,

    /// One more generation with an amended prompt naming the failed checks
    RegenerateOnce,
}

/// Per-task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainProfile {
    /// Task type this profile serves (e.g. "retention")
    pub task_type: String,

    /// Domain tag used for backend routing (e.g. "healthcare")
    pub domain: String,

    #[serde(default)]
    pub description: String,

    /// Capability every fallback backend must carry
    #[serde(default)]
    pub required_capability: Option<String>,

    #[serde(default)]
    pub rubric: Rubric,

    pub prompt: PromptTemplate,

    #[serde(default)]
    pub extraction: ExpectedSchema,

    #[serde(default)]
    pub checklist: Vec<Check>,

    #[serde(default)]
    pub deficiency_policy: DeficiencyPolicy,

    /// Stream by default
    #[serde(default)]
    pub streaming: bool,

    /// Overrides the backend's default temperature
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Further caps the backend's token ceiling
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl DomainProfile {
    /// Parse a profile from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let profile: DomainProfile = serde_yaml::from_str(yaml)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Parse a profile from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Names of the profiles shipped with the crate.
    pub fn builtin_names() -> impl Iterator<Item = &'static str> {
        BUILTIN_PROFILES.iter().map(|(name, _)| *name)
    }

    /// Load one built-in profile.
    pub fn builtin(name: &str) -> Result<Self, ConfigurationError> {
        let (_, yaml) = BUILTIN_PROFILES
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| ConfigurationError::UnknownTask(name.to_string()))?;
        Self::from_yaml(yaml)
    }

    /// Load every built-in profile.
    pub fn builtins() -> Result<Vec<Self>, ConfigurationError> {
        Self::builtin_names().map(Self::builtin).collect()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.task_type.trim().is_empty() {
            return Err(ConfigurationError::MissingField("task_type".to_string()));
        }
        if self.domain.trim().is_empty() {
            return Err(ConfigurationError::MissingField("domain".to_string()));
        }
        if self.prompt.body.trim().is_empty() {
            return Err(ConfigurationError::MissingField("prompt.body".to_string()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigurationError::Invalid(format!(
                    "profile '{}' temperature {} outside [0, 2]",
                    self.task_type, t
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ConfigurationError::Invalid(format!(
                "profile '{}' has max_tokens = 0",
                self.task_type
            )));
        }

        self.rubric.validate()?;

        // Surface pattern and schema errors at load time.
        StructuredExtractor::new(&self.task_type, &self.extraction)?;
        Validator::new(&self.checklist)?;

        Ok(())
    }
}

/// A profile with its scorer, assembler, extractor and validator built.
pub struct CompiledProfile {
    pub profile: DomainProfile,
    pub scorer: RubricScorer,
    pub assembler: PromptAssembler,
    pub extractor: StructuredExtractor,
    pub validator: Validator,
}

impl CompiledProfile {
    pub fn new(profile: DomainProfile) -> Result<Self, ConfigurationError> {
        let extractor = StructuredExtractor::new(&profile.task_type, &profile.extraction)?;
        let validator = Validator::new(&profile.checklist)?;
        let scorer = RubricScorer::new(profile.rubric.clone());

        let output_fields = if profile.extraction.is_structured() {
            profile.extraction.required_fields.clone()
        } else {
            Vec::new()
        };
        let assembler = PromptAssembler::new(profile.prompt.clone()).with_output_fields(output_fields);

        Ok(Self {
            profile,
            scorer,
            assembler,
            extractor,
            validator,
        })
    }

    pub fn task_type(&self) -> &str {
        &self.profile.task_type
    }
}
