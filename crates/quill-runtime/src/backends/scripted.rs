//! Deterministic scripted backend.
//!
//! Each call consumes the next step of the script; the last step repeats
//! once the script runs out.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quill_core::ConfigurationError;

use super::{BackendError, DeltaStream, GenerationRequest, GenerativeBackend};

const DEFAULT_CHUNK_CHARS: usize = 8;

/// Failure kinds a script can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    RateLimited,
    Auth,
    ContentFilter,
    Transport,
    Other,
}

impl ScriptedFailure {
    fn to_error(self, message: &str) -> BackendError {
        match self {
            ScriptedFailure::RateLimited => BackendError::RateLimited { retry_after: None },
            ScriptedFailure::Auth => BackendError::Auth,
            ScriptedFailure::ContentFilter => BackendError::ContentFilter(message.to_string()),
            ScriptedFailure::Transport => BackendError::Transport(message.to_string()),
            ScriptedFailure::Other => BackendError::Other(message.to_string()),
        }
    }
}

/// What one call does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Return `text`; when streaming, in chunks of `chunk_size` chars with
    /// `delay_ms` between chunks
    Reply {
        text: String,
        #[serde(default)]
        chunk_size: Option<usize>,
        #[serde(default)]
        delay_ms: u64,
    },

    /// Fail before producing any text
    Fail {
        reason: ScriptedFailure,
        #[serde(default)]
        message: String,
    },

    /// Stream `text`, then never finish
    Stall {
        text: String,
        #[serde(default)]
        chunk_size: Option<usize>,
    },

    /// Never respond
    Hang,
}

/// Scripted stand-in for a generative backend.
pub struct ScriptedBackend {
    id: String,
    steps: Vec<ScriptStep>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(id: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            id: id.into(),
            steps,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always reply with `text`.
    pub fn replying(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            id,
            vec![ScriptStep::Reply {
                text: text.into(),
                chunk_size: None,
                delay_ms: 0,
            }],
        )
    }

    /// Always fail with `reason`.
    pub fn failing(id: impl Into<String>, reason: ScriptedFailure) -> Self {
        Self::new(
            id,
            vec![ScriptStep::Fail {
                reason,
                message: "scripted failure".to_string(),
            }],
        )
    }

    /// Never respond.
    pub fn hanging(id: impl Into<String>) -> Self {
        Self::new(id, vec![ScriptStep::Hang])
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.steps.get(call).or_else(|| self.steps.last()) {
            Some(step) => step.clone(),
            None => ScriptStep::Fail {
                reason: ScriptedFailure::Other,
                message: format!("backend '{}' has an empty script", self.id),
            },
        }
    }
}

fn chunks(text: &str, size: Option<usize>) -> Vec<String> {
    let size = size.unwrap_or(DEFAULT_CHUNK_CHARS).max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        match self.next_step() {
            ScriptStep::Reply { text, delay_ms, .. } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(text)
            }
            ScriptStep::Fail { reason, message } => Err(reason.to_error(&message)),
            ScriptStep::Stall { .. } | ScriptStep::Hang => std::future::pending().await,
        }
    }

    async fn stream(&self, _request: &GenerationRequest) -> Result<DeltaStream, BackendError> {
        match self.next_step() {
            ScriptStep::Reply {
                text,
                chunk_size,
                delay_ms,
            } => {
                let delay = Duration::from_millis(delay_ms);
                let deltas = stream::iter(chunks(&text, chunk_size)).then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunk)
                });
                Ok(deltas.boxed())
            }
            ScriptStep::Fail { reason, message } => Err(reason.to_error(&message)),
            ScriptStep::Stall { text, chunk_size } => {
                let deltas = stream::iter(chunks(&text, chunk_size).into_iter().map(Ok))
                    .chain(stream::pending());
                Ok(deltas.boxed())
            }
            ScriptStep::Hang => Ok(stream::pending().boxed()),
        }
    }
}

/// Scripts for several backends, keyed by backend id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScriptBook {
    #[serde(default)]
    pub backends: BTreeMap<String, Vec<ScriptStep>>,
}

impl ScriptBook {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Build a backend for `id`. Unscripted ids fail every call.
    pub fn backend(&self, id: &str) -> ScriptedBackend {
        match self.backends.get(id) {
            Some(steps) => ScriptedBackend::new(id, steps.clone()),
            None => ScriptedBackend::new(
                id,
                vec![ScriptStep::Fail {
                    reason: ScriptedFailure::Other,
                    message: "not scripted".to_string(),
                }],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(streaming: bool) -> GenerationRequest {
        GenerationRequest {
            backend_id: "s".to_string(),
            prompt_text: "p".to_string(),
            streaming,
            temperature: 0.3,
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_steps_advance_and_last_repeats() {
        let backend = ScriptedBackend::new(
            "s",
            vec![
                ScriptStep::Fail {
                    reason: ScriptedFailure::Transport,
                    message: "reset".to_string(),
                },
                ScriptStep::Reply {
                    text: "ok".to_string(),
                    chunk_size: None,
                    delay_ms: 0,
                },
            ],
        );

        assert_eq!(
            backend.complete(&request(false)).await,
            Err(BackendError::Transport("reset".to_string()))
        );
        assert_eq!(backend.complete(&request(false)).await, Ok("ok".to_string()));
        assert_eq!(backend.complete(&request(false)).await, Ok("ok".to_string()));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_chunks_in_order() {
        let backend = ScriptedBackend::new(
            "s",
            vec![ScriptStep::Reply {
                text: "héllo wörld".to_string(),
                chunk_size: Some(3),
                delay_ms: 0,
            }],
        );

        let deltas: Vec<String> = backend
            .stream(&request(true))
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(deltas, vec!["hél", "lo ", "wör", "ld"]);
        assert_eq!(deltas.concat(), "héllo wörld");
    }

    #[test]
    fn test_script_book_yaml() {
        let yaml = r#"
backends:
  gemini-pro:
    - { type: hang }
  claude-sonnet:
    - { type: fail, reason: rate_limited }
    - { type: reply, text: "done", chunk_size: 2 }
"#;
        let book = ScriptBook::from_yaml(yaml).unwrap();
        assert_eq!(book.backends["gemini-pro"], vec![ScriptStep::Hang]);
        assert_eq!(book.backend("claude-sonnet").id(), "claude-sonnet");
        assert_eq!(book.backend("unscripted").calls(), 0);
    }
}
