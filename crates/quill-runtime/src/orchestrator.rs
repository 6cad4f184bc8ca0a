//! Fallback controller: one run of the pipeline.
//!
//! classify -> assemble -> (select -> invoke)* -> extract -> validate
//! -> optional single regeneration -> record.
//!
//! Failed or timed-out invocations re-enter selection with every attempted
//! backend excluded. The loop ends when a backend completes, the candidate
//! pool or the run budget is exhausted, the caller cancels, or the run
//! deadline passes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quill_core::types::{Classification, Confidence, ExtractionResult, ValidationReport, Verdict};
use quill_core::{
    BackendTable, CaseRecord, CompiledProfile, ConfigurationError, DeficiencyPolicy,
    PromptAssembler, SelectionInput, SelectionPolicy, SelectionRule,
};

use crate::backends::{BackendRegistry, FailureClass, GenerationRequest};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::invoker::{GenerationInvoker, GenerationStatus};
use crate::recorder::{QualityFlag, RunRecord, RunRecorder, RunStatus};
use crate::resilience::{AttemptFailure, AttemptLedger, CircuitBreaker, RunBudget, RunUsage};

/// Hard failures surfaced to the caller.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("All backends exhausted after {attempted:?}: {}", .last_failure.as_deref().unwrap_or("no candidate available"))]
    BackendsExhausted {
        attempted: Vec<String>,
        last_failure: Option<String>,
        failures: Vec<AttemptFailure>,
    },

    #[error("Run cancelled after {attempted:?}")]
    Cancelled {
        attempted: Vec<String>,
        partial_text: String,
    },

    #[error("Run timed out after {after:?}")]
    TimedOut {
        attempted: Vec<String>,
        partial_text: String,
        after: Duration,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunError {
    /// Backends dispatched before the run failed.
    pub fn attempted(&self) -> &[String] {
        match self {
            RunError::BackendsExhausted { attempted, .. }
            | RunError::Cancelled { attempted, .. }
            | RunError::TimedOut { attempted, .. } => attempted,
            RunError::Configuration(_) | RunError::Internal(_) => &[],
        }
    }

    /// Text received before the run was cancelled or timed out.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            RunError::Cancelled { partial_text, .. } | RunError::TimedOut { partial_text, .. } => {
                Some(partial_text)
            }
            _ => None,
        }
    }

    fn status(&self) -> RunStatus {
        match self {
            RunError::Cancelled { .. } => RunStatus::Cancelled,
            RunError::TimedOut { .. } => RunStatus::TimedOut,
            _ => RunStatus::Failed,
        }
    }
}

/// Per-run overrides of profile defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    /// Try this backend first
    pub backend: Option<String>,
    pub streaming: Option<bool>,
    pub deficiency_policy: Option<DeficiencyPolicy>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// One streamed text delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub attempt: usize,
    pub backend_id: String,
    pub text: String,
}

/// Progress notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Classified {
        classification: Classification,
    },
    Dispatched {
        attempt: usize,
        backend_id: String,
        rule: SelectionRule,
    },
    Delta(Delta),
    BackendFailed {
        attempt: usize,
        backend_id: String,
        class: FailureClass,
        reason: String,
    },
    Regenerating {
        failed_checks: Vec<String>,
    },
}

/// A completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub case_id: String,
    pub task_type: String,

    /// Final artifact text
    pub text: String,

    /// Backend that produced `text`
    pub final_backend: String,

    pub extraction: ExtractionResult,
    pub report: ValidationReport,
    pub classification: Classification,

    /// Dispatched backends, in order, without repeats
    pub backends_attempted: Vec<String>,

    pub failures: Vec<AttemptFailure>,
    pub usage: RunUsage,
    pub quality_flags: BTreeSet<QualityFlag>,

    /// The record written (or that failed to be written) for this run
    pub record: RunRecord,
}

impl RunOutcome {
    pub fn verdict(&self) -> Verdict {
        self.report.verdict
    }

    pub fn confidence(&self) -> Confidence {
        self.extraction.confidence
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.quality_flags.contains(&flag)
    }
}

/// Event channel for one run. Sends never block and never fail the run.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Generated, extracted and validated text.
struct Artifact {
    backend_id: String,
    text: String,
    extraction: ExtractionResult,
    report: ValidationReport,
}

/// Mutable bookkeeping shared by the first generation and the regeneration.
struct Attempts {
    ledger: AttemptLedger,
    budget: RunBudget,
    usage: RunUsage,
}

/// Immutable per-run inputs.
struct Scope<'a> {
    run_id: Uuid,
    input: SelectionInput<'a>,
    overrides: &'a RunOverrides,
    streaming: bool,
    events: &'a EventSink,
    cancel: &'a CancelToken,
    deadline: Instant,
}

/// Drives one run against a fixed table snapshot.
pub(crate) struct FallbackController {
    pub(crate) profile: Arc<CompiledProfile>,
    pub(crate) table: Arc<BackendTable>,
    pub(crate) policy: Arc<SelectionPolicy>,
    pub(crate) backends: Arc<BackendRegistry>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) recorder: Arc<RunRecorder>,
    pub(crate) config: Arc<EngineConfig>,
}

impl FallbackController {
    pub(crate) async fn run(
        self,
        run_id: Uuid,
        case: CaseRecord,
        overrides: RunOverrides,
        events: EventSink,
        cancel: CancelToken,
    ) -> Result<RunOutcome, RunError> {
        let started = Instant::now();
        let profile = self.profile.profile.clone();

        let classification = self.profile.scorer.score(&case);
        info!(
            run_id = %run_id,
            task = %profile.task_type,
            case_id = %case.case_id(),
            score = classification.score,
            level = %classification.level,
            "Case classified"
        );
        events.emit(RunEvent::Classified {
            classification: classification.clone(),
        });

        let scope = Scope {
            run_id,
            input: SelectionInput {
                domain: &profile.domain,
                level: classification.level,
                required_capability: profile.required_capability.as_deref(),
                override_backend: overrides.backend.as_deref(),
            },
            overrides: &overrides,
            streaming: overrides.streaming.unwrap_or(profile.streaming),
            events: &events,
            cancel: &cancel,
            deadline: started + self.config.run_timeout,
        };

        let mut attempts = Attempts {
            ledger: AttemptLedger::new(),
            budget: RunBudget::new(self.config.max_attempts, self.config.token_budget),
            usage: RunUsage::default(),
        };

        let produced = self
            .produce(&scope, &case, &classification, &mut attempts)
            .await;

        let (artifact, mut flags, regenerated) = match produced {
            Ok(produced) => produced,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "Run failed");
                let record = RunRecord {
                    run_id,
                    case_id: case.case_id().to_string(),
                    task_type: profile.task_type.clone(),
                    classification,
                    backends_attempted: attempts.ledger.attempted().to_vec(),
                    final_backend: None,
                    status: err.status(),
                    final_verdict: None,
                    regenerated: false,
                    extraction_confidence: None,
                    total_wall_clock_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                    quality_flags: BTreeSet::new(),
                };
                if let Err(record_err) = self.recorder.record(&record).await {
                    warn!(run_id = %run_id, error = %record_err, "Failed run not recorded");
                }
                return Err(err);
            }
        };

        if artifact.extraction.confidence == Confidence::Heuristic {
            flags.insert(QualityFlag::HeuristicExtraction);
        }
        if !artifact.extraction.unmatched_required_fields.is_empty() {
            flags.insert(QualityFlag::UnmatchedRequiredFields);
        }
        if artifact.report.is_deficient() {
            flags.insert(QualityFlag::ValidationDeficient);
        }
        if attempts.ledger.attempted().first() != Some(&artifact.backend_id) {
            flags.insert(QualityFlag::FallbackUsed);
        }

        let status = if artifact.report.is_deficient() {
            RunStatus::Deficient
        } else {
            RunStatus::Compliant
        };

        let mut record = RunRecord {
            run_id,
            case_id: case.case_id().to_string(),
            task_type: profile.task_type.clone(),
            classification: classification.clone(),
            backends_attempted: attempts.ledger.attempted().to_vec(),
            final_backend: Some(artifact.backend_id.clone()),
            status,
            final_verdict: Some(artifact.report.verdict),
            regenerated,
            extraction_confidence: Some(artifact.extraction.confidence),
            total_wall_clock_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            quality_flags: flags.clone(),
        };

        if let Err(err) = self.recorder.record(&record).await {
            warn!(run_id = %run_id, error = %err, "Run record not persisted");
            flags.insert(QualityFlag::RecordNotPersisted);
            record.quality_flags.insert(QualityFlag::RecordNotPersisted);
        }

        info!(
            run_id = %run_id,
            backend = %artifact.backend_id,
            verdict = ?artifact.report.verdict,
            attempts = attempts.ledger.attempts(),
            elapsed_ms = record.total_wall_clock_ms,
            "Run completed"
        );

        Ok(RunOutcome {
            run_id,
            case_id: case.case_id().to_string(),
            task_type: profile.task_type.clone(),
            text: artifact.text,
            final_backend: artifact.backend_id,
            extraction: artifact.extraction,
            report: artifact.report,
            classification,
            backends_attempted: attempts.ledger.attempted().to_vec(),
            failures: attempts.ledger.failures().to_vec(),
            usage: attempts.usage,
            quality_flags: flags,
            record,
        })
    }

    /// Generate, evaluate and, when the policy asks for it, regenerate once.
    async fn produce(
        &self,
        scope: &Scope<'_>,
        case: &CaseRecord,
        classification: &Classification,
        attempts: &mut Attempts,
    ) -> Result<(Artifact, BTreeSet<QualityFlag>, bool), RunError> {
        let mut flags = BTreeSet::new();
        let prompt = self.profile.assembler.assemble(case, classification);

        let (backend_id, text) = self.generate(scope, &prompt, attempts).await?;
        let first = self.evaluate(case, backend_id, text);

        let policy = scope
            .overrides
            .deficiency_policy
            .unwrap_or(self.profile.profile.deficiency_policy);

        if !first.report.is_deficient() || policy != DeficiencyPolicy::RegenerateOnce {
            return Ok((first, flags, false));
        }

        let failed_checks: Vec<String> = first
            .report
            .failed_checks()
            .into_iter()
            .map(str::to_string)
            .collect();
        info!(
            run_id = %scope.run_id,
            failed = ?failed_checks,
            "Artifact deficient, regenerating once"
        );
        scope.events.emit(RunEvent::Regenerating {
            failed_checks: failed_checks.clone(),
        });

        let mut items = first.report.critical_errors.clone();
        items.extend(first.report.warnings.iter().cloned());
        let amended = PromptAssembler::amend(&prompt, &items);

        let dispatched_before = attempts.ledger.attempts();
        let regenerated = self.generate(scope, &amended, attempts).await;
        let attempted_regeneration = attempts.ledger.attempts() > dispatched_before;
        if attempted_regeneration {
            flags.insert(QualityFlag::Regenerated);
        }

        match regenerated {
            Ok((backend_id, text)) => {
                let second = self.evaluate(case, backend_id, text);
                if prefer_second(&first, &second) {
                    Ok((second, flags, true))
                } else {
                    debug!(run_id = %scope.run_id, "Keeping first artifact over regeneration");
                    Ok((first, flags, true))
                }
            }
            Err(err @ RunError::Cancelled { .. }) => Err(err),
            Err(err) => {
                warn!(
                    run_id = %scope.run_id,
                    error = %err,
                    "Regeneration unavailable, returning first artifact"
                );
                flags.insert(QualityFlag::RegenerationUnavailable);
                Ok((first, flags, attempted_regeneration))
            }
        }
    }

    fn evaluate(&self, case: &CaseRecord, backend_id: String, text: String) -> Artifact {
        let extraction = self.profile.extractor.extract(&text);
        let report = self.profile.validator.validate(&text, &extraction, case);
        Artifact {
            backend_id,
            text,
            extraction,
            report,
        }
    }

    /// Select and invoke backends until one completes.
    async fn generate(
        &self,
        scope: &Scope<'_>,
        prompt: &str,
        attempts: &mut Attempts,
    ) -> Result<(String, String), RunError> {
        loop {
            if scope.cancel.is_cancelled() {
                return Err(self.cancelled(attempts));
            }

            let now = Instant::now();
            if now >= scope.deadline {
                return Err(self.timed_out(attempts));
            }

            if attempts.ledger.attempts() >= attempts.budget.max_attempts() {
                debug!(run_id = %scope.run_id, "Attempt budget exhausted");
                return Err(exhausted(attempts, "attempt budget exhausted"));
            }
            if attempts.budget.is_exhausted() {
                debug!(run_id = %scope.run_id, "Token budget exhausted");
                return Err(exhausted(attempts, "token budget exhausted"));
            }

            let open = self.breaker.open_backends(self.table.ids());
            let excluded = attempts.ledger.exclusions(open);
            let selection = match self.policy.select(&self.table, &scope.input, &excluded) {
                Some(selection) => selection,
                None => return Err(exhausted(attempts, "no candidate backend left")),
            };
            let backend_id = selection.backend_id;

            let (backend, descriptor) = match (
                self.backends.get(&backend_id),
                self.table.get(&backend_id),
            ) {
                (Some(backend), Some(descriptor)) => (backend, descriptor),
                _ => {
                    warn!(backend = %backend_id, "Selected backend is not registered, skipping");
                    attempts.ledger.exclude(&backend_id);
                    continue;
                }
            };

            let attempt = attempts.ledger.dispatch(&backend_id);
            let requested = scope
                .overrides
                .max_tokens
                .or(self.profile.profile.max_tokens)
                .unwrap_or(descriptor.max_output_tokens);
            let request = GenerationRequest {
                backend_id: backend_id.clone(),
                prompt_text: prompt.to_string(),
                streaming: scope.streaming,
                temperature: scope
                    .overrides
                    .temperature
                    .or(self.profile.profile.temperature)
                    .unwrap_or(descriptor.default_temperature),
                max_tokens: attempts
                    .budget
                    .cap_tokens(requested, descriptor.max_output_tokens),
            };

            info!(
                run_id = %scope.run_id,
                attempt,
                backend = %backend_id,
                rule = ?selection.rule,
                "Dispatching to backend"
            );
            scope.events.emit(RunEvent::Dispatched {
                attempt,
                backend_id: backend_id.clone(),
                rule: selection.rule,
            });

            let timeout = self
                .config
                .timeout_for(&backend_id)
                .min(scope.deadline.saturating_duration_since(now));
            let events = scope.events;
            let delta_backend = backend_id.as_str();
            let mut buffer = String::new();

            let result = GenerationInvoker::new(timeout)
                .invoke(
                    backend.as_ref(),
                    &request,
                    &mut buffer,
                    |text| {
                        events.emit(RunEvent::Delta(Delta {
                            attempt,
                            backend_id: delta_backend.to_string(),
                            text: text.to_string(),
                        }))
                    },
                    scope.cancel,
                )
                .await;

            attempts.usage.add(&result, descriptor.cost_class);
            attempts.budget.record_tokens(result.tokens_emitted);
            attempts.ledger.keep_partial(&result.raw_text);

            match &result.status {
                GenerationStatus::Completed => {
                    self.breaker.record_success(&backend_id);
                    return Ok((backend_id, result.raw_text));
                }
                GenerationStatus::Cancelled => return Err(self.cancelled(attempts)),
                GenerationStatus::TimedOut { .. } if Instant::now() >= scope.deadline => {
                    return Err(self.timed_out(attempts));
                }
                GenerationStatus::Failed { .. } | GenerationStatus::TimedOut { .. } => {
                    let class = result.failure_class().unwrap_or(FailureClass::Permanent);
                    let reason = result
                        .failure_reason()
                        .unwrap_or_else(|| "unknown failure".to_string());

                    self.breaker.record_failure(&backend_id);
                    attempts
                        .ledger
                        .record_failure(attempt, &backend_id, class, reason.clone());
                    warn!(
                        run_id = %scope.run_id,
                        attempt,
                        backend = %backend_id,
                        class = ?class,
                        reason = %reason,
                        "Backend failed, falling back"
                    );
                    scope.events.emit(RunEvent::BackendFailed {
                        attempt,
                        backend_id,
                        class,
                        reason,
                    });
                }
            }
        }
    }

    fn cancelled(&self, attempts: &Attempts) -> RunError {
        RunError::Cancelled {
            attempted: attempts.ledger.attempted().to_vec(),
            partial_text: attempts.ledger.partial_text().to_string(),
        }
    }

    fn timed_out(&self, attempts: &Attempts) -> RunError {
        RunError::TimedOut {
            attempted: attempts.ledger.attempted().to_vec(),
            partial_text: attempts.ledger.partial_text().to_string(),
            after: self.config.run_timeout,
        }
    }
}

fn exhausted(attempts: &Attempts, fallback_reason: &str) -> RunError {
    let last_failure = attempts
        .ledger
        .last_failure()
        .map(|f| format!("{}: {}", f.backend_id, f.reason))
        .or_else(|| Some(fallback_reason.to_string()));
    RunError::BackendsExhausted {
        attempted: attempts.ledger.attempted().to_vec(),
        last_failure,
        failures: attempts.ledger.failures().to_vec(),
    }
}

/// Fewer critical errors wins, then the higher score; ties go to the regeneration.
fn prefer_second(first: &Artifact, second: &Artifact) -> bool {
    let rank = |a: &Artifact| (Reverse(a.report.critical_errors.len()), a.report.score);
    rank(second) >= rank(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn artifact(critical: usize, score: u8) -> Artifact {
        let mut report = ValidationReport::new(
            BTreeMap::new(),
            (0..critical).map(|i| format!("check {}", i)).collect(),
            vec![],
        );
        report.score = score;
        Artifact {
            backend_id: "b".to_string(),
            text: String::new(),
            extraction: ExtractionResult {
                fields: BTreeMap::new(),
                confidence: Confidence::Heuristic,
                unmatched_required_fields: vec![],
            },
            report,
        }
    }

    #[test]
    fn test_fewer_critical_errors_wins() {
        assert!(prefer_second(&artifact(2, 90), &artifact(1, 40)));
        assert!(!prefer_second(&artifact(1, 40), &artifact(2, 90)));
    }

    #[test]
    fn test_score_breaks_ties_and_regeneration_wins_draws() {
        assert!(prefer_second(&artifact(1, 50), &artifact(1, 70)));
        assert!(!prefer_second(&artifact(1, 70), &artifact(1, 50)));
        assert!(prefer_second(&artifact(1, 60), &artifact(1, 60)));
    }

    #[test]
    fn test_run_error_accessors() {
        let err = RunError::TimedOut {
            attempted: vec!["gemini-pro".to_string()],
            partial_text: "Dear".to_string(),
            after: Duration::from_secs(1),
        };
        assert_eq!(err.attempted(), ["gemini-pro"]);
        assert_eq!(err.partial_text(), Some("Dear"));
        assert_eq!(err.status(), RunStatus::TimedOut);

        let err = RunError::Internal("boom".to_string());
        assert!(err.attempted().is_empty());
        assert_eq!(err.partial_text(), None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunEvent::Delta(Delta {
            attempt: 1,
            backend_id: "gemini-pro".to_string(),
            text: "Hi".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "delta");
        assert_eq!(json["backend_id"], "gemini-pro");
    }
}
