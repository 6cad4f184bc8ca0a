//! Generation invoker.
//!
//! Calls one backend, aggregates streamed deltas in arrival order, enforces
//! the invocation timeout and honours cancellation. Every outcome is data:
//! the invoker itself never fails.
//!
//! ```text
//! Idle -> Dispatched -> {Streaming | Blocking} -> Completed | Failed | TimedOut | Cancelled
//! ```

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backends::{BackendError, FailureClass, GenerationRequest, GenerativeBackend};
use crate::cancel::CancelToken;

/// Invocation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Idle,
    Dispatched,
    Streaming,
    Blocking,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Terminal status of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationStatus {
    Completed,
    Failed { error: BackendError },
    TimedOut { after: Duration },
    Cancelled,
}

/// Output of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub backend_id: String,

    /// Full text on completion, partial text otherwise
    pub raw_text: String,

    pub tokens_emitted: u32,

    pub wall_clock_ms: u64,

    pub status: GenerationStatus,

    /// States visited, in order
    pub trace: Vec<InvocationState>,
}

impl GenerationResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, GenerationStatus::Completed)
    }

    /// Failure class for fallback decisions. Timeouts are transient.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.status {
            GenerationStatus::Completed | GenerationStatus::Cancelled => None,
            GenerationStatus::Failed { error } => Some(error.class()),
            GenerationStatus::TimedOut { .. } => Some(FailureClass::Transient),
        }
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> Option<String> {
        match &self.status {
            GenerationStatus::Completed => None,
            GenerationStatus::Failed { error } => Some(error.to_string()),
            GenerationStatus::TimedOut { after } => Some(format!("timed out after {:?}", after)),
            GenerationStatus::Cancelled => Some("cancelled".to_string()),
        }
    }
}

enum Finish {
    Done,
    Failed(BackendError),
    TimedOut,
    Cancelled,
}

/// Calls a backend under a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct GenerationInvoker {
    timeout: Duration,
}

impl GenerationInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke `backend`.
    ///
    /// `buffer` is cleared, then receives text in arrival order; it keeps
    /// whatever arrived when the call fails, times out or is cancelled.
    /// Each streamed delta is passed to `on_delta` after it is appended.
    pub async fn invoke<F>(
        &self,
        backend: &dyn GenerativeBackend,
        request: &GenerationRequest,
        buffer: &mut String,
        mut on_delta: F,
        cancel: &CancelToken,
    ) -> GenerationResult
    where
        F: FnMut(&str) + Send,
    {
        let started = Instant::now();
        let mut trace = vec![InvocationState::Idle];
        buffer.clear();

        let finish = if cancel.is_cancelled() {
            Finish::Cancelled
        } else {
            trace.push(InvocationState::Dispatched);
            trace.push(if request.streaming {
                InvocationState::Streaming
            } else {
                InvocationState::Blocking
            });
            debug!(
                backend = %request.backend_id,
                streaming = request.streaming,
                max_tokens = request.max_tokens,
                "Dispatching generation"
            );

            let text = &mut *buffer;
            let work = async move {
                if request.streaming {
                    let mut deltas = backend.stream(request).await?;
                    while let Some(delta) = deltas.next().await {
                        let delta = delta?;
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        on_delta(&delta);
                    }
                } else {
                    let full = backend.complete(request).await?;
                    text.push_str(&full);
                }
                Ok::<(), BackendError>(())
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Finish::Cancelled,
                outcome = tokio::time::timeout(self.timeout, work) => match outcome {
                    Ok(Ok(())) => Finish::Done,
                    Ok(Err(error)) => Finish::Failed(error),
                    Err(_) => Finish::TimedOut,
                },
            }
        };

        let status = match finish {
            Finish::Done => {
                trace.push(InvocationState::Completed);
                GenerationStatus::Completed
            }
            Finish::Failed(error) => {
                warn!(backend = %request.backend_id, error = %error, "Generation failed");
                trace.push(InvocationState::Failed);
                GenerationStatus::Failed { error }
            }
            Finish::TimedOut => {
                warn!(backend = %request.backend_id, timeout = ?self.timeout, "Generation timed out");
                trace.push(InvocationState::TimedOut);
                GenerationStatus::TimedOut {
                    after: self.timeout,
                }
            }
            Finish::Cancelled => {
                debug!(backend = %request.backend_id, "Generation cancelled");
                trace.push(InvocationState::Cancelled);
                GenerationStatus::Cancelled
            }
        };

        GenerationResult {
            backend_id: request.backend_id.clone(),
            raw_text: buffer.clone(),
            tokens_emitted: backend.estimate_tokens(buffer),
            wall_clock_ms: started.elapsed().as_millis() as u64,
            status,
            trace,
        }
    }
}
