//! # quill-runtime
//!
//! Async orchestration for the quill pipeline.
//!
//! `quill-core` decides (scores, selects, extracts, validates); this crate
//! calls generative backends and coordinates what happens when they fail:
//!
//! - **Backends**: uniform blocking/streaming contract and a registry
//! - **Invoker**: ordered delta aggregation, timeouts, cancellation
//! - **Fallback**: no-repeat backend exclusion, bounded attempts, one optional regeneration
//! - **Resilience**: per-backend circuit breaker, run budgets
//! - **Recorder**: run history and counters over a key-value store
//!
//! ## Example
//!
//! ```rust,ignore
//! use quill_core::CaseRecord;
//! use quill_runtime::{Engine, RunOverrides, ScriptBook};
//!
//! let book = ScriptBook::from_yaml_file("script.yaml")?;
//! let mut builder = Engine::builder().builtin_profiles();
//! for id in ["claude-sonnet", "gemini-pro", "gpt-4o", "gemini-flash"] {
//!     builder = builder.backend(book.backend(id));
//! }
//! let engine = builder.build()?;
//!
//! let case = CaseRecord::from_json_file("case.json")?;
//! let outcome = engine.run(case, "retention", RunOverrides::default()).await?;
//! println!("{}", outcome.text);
//! ```

pub mod backends;
pub mod cancel;
pub mod config;
pub mod descriptors;
pub mod engine;
pub mod invoker;
pub mod orchestrator;
pub mod recorder;
pub mod resilience;
pub mod store;

pub use backends::{
    BackendError, BackendRegistry, DeltaStream, FailureClass, GenerationRequest,
    GenerativeBackend, ScriptBook, ScriptStep, ScriptedBackend, ScriptedFailure,
};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use descriptors::DescriptorRegistry;
pub use engine::{Engine, EngineBuilder, RunHandle};
pub use invoker::{GenerationInvoker, GenerationResult, GenerationStatus, InvocationState};
pub use orchestrator::{Delta, RunError, RunEvent, RunOutcome, RunOverrides};
pub use recorder::{QualityFlag, RecorderConfig, RecorderError, RunRecord, RunRecorder, RunStats, RunStatus};
pub use resilience::{AttemptFailure, CircuitBreaker, CircuitBreakerConfig, CircuitState, RunUsage};
pub use store::{KvStore, MemoryKvStore, StoreError};
