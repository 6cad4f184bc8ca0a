//! # quill-core
//!
//! Deterministic stages of the quill generation pipeline.
//!
//! Everything in this crate is pure and network-free:
//!
//! - **Rubric scoring**: case record -> score, level, contributing factors
//! - **Backend selection**: (task, domain, level, exclusions) -> backend id
//! - **Prompt assembly**: template + case + classification -> prompt text
//! - **Structured extraction**: strict JSON decode, then heuristic detectors
//! - **Checklist validation**: named predicates -> validation report
//!
//! The async invocation, fallback and recording layers live in
//! `quill-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quill_core::{CaseRecord, CompiledProfile, DomainProfile};
//!
//! let profile = CompiledProfile::new(DomainProfile::builtin("retention")?)?;
//! let case = CaseRecord::new("ACME-1")
//!     .with("usage_change_pct", -60)
//!     .with("days_since_last_activity", 20)
//!     .with("sentiment", -0.7);
//!
//! let classification = profile.scorer.score(&case);
//! assert_eq!(classification.level, Level::Critical);
//! ```

pub mod backend;
pub mod case;
pub mod error;
pub mod extract;
pub mod profile;
pub mod prompt;
pub mod rubric;
pub mod selection;
pub mod types;
pub mod validate;

// Re-export main types at crate root
pub use backend::{BackendDescriptor, BackendTable, CostClass};
pub use case::CaseRecord;
pub use error::ConfigurationError;
pub use extract::{Detect, ExpectedSchema, FieldDetector, StructuredExtractor};
pub use profile::{CompiledProfile, DeficiencyPolicy, DomainProfile};
pub use prompt::{PromptAssembler, PromptTemplate};
pub use rubric::{Rubric, RubricScorer};
pub use selection::{Selection, SelectionInput, SelectionPolicy, SelectionRule};
pub use types::{
    Classification, Confidence, ContributingFactor, ExtractionResult, Level, ValidationReport,
    Verdict,
};
pub use validate::{Check, Predicate, Validator};
