//! Generative backend abstraction.
//!
//! Concrete network clients are out of scope for this crate; anything that
//! implements [`GenerativeBackend`] can be registered with the engine.
//! [`ScriptedBackend`] is a deterministic implementation for tests and the
//! CLI.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod scripted;

pub use scripted::{ScriptBook, ScriptStep, ScriptedBackend, ScriptedFailure};

/// Ordered text deltas from a streaming call.
pub type DeltaStream = BoxStream<'static, Result<String, BackendError>>;

/// Structured failure reported by a backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed")]
    Auth,

    #[error("Blocked by content filter: {0}")]
    ContentFilter(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend error: {0}")]
    Other(String),
}

/// How a failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout, rate limit, transport: another backend may succeed
    Transient,

    /// Auth, content filter, unknown: this backend is done for the run
    Permanent,
}

impl BackendError {
    pub fn class(&self) -> FailureClass {
        match self {
            BackendError::RateLimited { .. } | BackendError::Transport(_) => FailureClass::Transient,
            BackendError::Auth | BackendError::ContentFilter(_) | BackendError::Other(_) => {
                FailureClass::Permanent
            }
        }
    }
}

/// One call to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub backend_id: String,
    pub prompt_text: String,
    pub streaming: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Uniform request/response contract for generative text services.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Identifier matching a descriptor in the backend table.
    fn id(&self) -> &str;

    /// Blocking completion: the whole text at once.
    async fn complete(&self, request: &GenerationRequest) -> Result<String, BackendError>;

    /// Streaming completion.
    ///
    /// The default delivers the blocking completion as a single delta.
    async fn stream(&self, request: &GenerationRequest) -> Result<DeltaStream, BackendError> {
        let text = self.complete(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    /// Estimate tokens for a piece of text.
    fn estimate_tokens(&self, text: &str) -> u32 {
        // ~4 chars per token
        text.len().div_ceil(4) as u32
    }
}

/// Backends available to the engine, keyed by id.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerativeBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A backend with the same id is replaced.
    pub fn register(&mut self, backend: Arc<dyn GenerativeBackend>) {
        let id = backend.id().to_string();
        if self.backends.insert(id.clone(), backend).is_some() {
            tracing::debug!(backend = %id, "Replaced registered backend");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GenerativeBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
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

    struct Echo;

    #[async_trait]
    impl GenerativeBackend for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &GenerationRequest) -> Result<String, BackendError> {
            Ok(request.prompt_text.clone())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            backend_id: "echo".to_string(),
            prompt_text: "hello".to_string(),
            streaming: true,
            temperature: 0.3,
            max_tokens: 100,
        }
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            BackendError::RateLimited { retry_after: None }.class(),
            FailureClass::Transient
        );
        assert_eq!(
            BackendError::Transport("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(BackendError::Auth.class(), FailureClass::Permanent);
        assert_eq!(
            BackendError::ContentFilter("blocked".into()).class(),
            FailureClass::Permanent
        );
    }

    #[tokio::test]
    async fn test_default_stream_is_single_delta() {
        let deltas: Vec<_> = Echo.stream(&request()).await.unwrap().collect().await;
        assert_eq!(deltas, vec![Ok("hello".to_string())]);
    }

    #[test]
    fn test_registry() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.contains("echo"));
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["echo"]);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(Echo.estimate_tokens(""), 0);
        assert_eq!(Echo.estimate_tokens("abcde"), 2);
    }
}
