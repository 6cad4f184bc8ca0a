//! Circuit breaker keyed by backend id.
//!
//! When a backend fails repeatedly across runs its circuit opens and
//! selection skips it until the recovery timeout has passed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time before attempting recovery, e.g. "30s"
    #[serde(with = "crate::config::duration_str")]
    pub recovery_timeout: Duration,

    /// Successes needed to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Backend is skipped
    Open { opened_at: Instant },

    /// Testing if circuit can close
    HalfOpen { successes: u32 },
}

/// Circuit breaker shared by all runs of an engine.
///
/// Each backend has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if the circuit is open for a backend.
    ///
    /// Returns true if the backend should be skipped.
    pub fn is_open(&self, backend: &str) -> bool {
        let states = self.states.read();
        match states.get(backend) {
            Some(CircuitState::Open { opened_at }) => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    drop(states);
                    self.transition_to_half_open(backend);
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Record a completed call.
    pub fn record_success(&self, backend: &str) {
        let mut states = self.states.write();
        match states.get(backend).cloned() {
            Some(CircuitState::HalfOpen { successes }) => {
                if successes + 1 >= self.config.success_threshold {
                    states.insert(backend.to_string(), CircuitState::Closed { failures: 0 });
                    tracing::info!(backend = %backend, "Circuit closed after successful recovery");
                } else {
                    states.insert(
                        backend.to_string(),
                        CircuitState::HalfOpen {
                            successes: successes + 1,
                        },
                    );
                }
            }
            Some(CircuitState::Closed { failures }) if failures > 0 => {
                states.insert(backend.to_string(), CircuitState::Closed { failures: 0 });
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, backend: &str) {
        let mut states = self.states.write();
        let current = states
            .get(backend)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 });

        match current {
            CircuitState::Closed { failures } => {
                if failures + 1 >= self.config.failure_threshold {
                    states.insert(
                        backend.to_string(),
                        CircuitState::Open {
                            opened_at: Instant::now(),
                        },
                    );
                    tracing::warn!(
                        backend = %backend,
                        failures = failures + 1,
                        "Circuit opened after repeated failures"
                    );
                } else {
                    states.insert(
                        backend.to_string(),
                        CircuitState::Closed {
                            failures: failures + 1,
                        },
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                states.insert(
                    backend.to_string(),
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
                tracing::warn!(backend = %backend, "Circuit reopened after failed recovery attempt");
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn transition_to_half_open(&self, backend: &str) {
        let mut states = self.states.write();
        if matches!(states.get(backend), Some(CircuitState::Open { .. })) {
            states.insert(backend.to_string(), CircuitState::HalfOpen { successes: 0 });
            tracing::info!(backend = %backend, "Circuit transitioning to half-open for recovery test");
        }
    }

    /// Current state of a circuit.
    pub fn state(&self, backend: &str) -> CircuitState {
        self.states
            .read()
            .get(backend)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }

    /// Ids of backends whose circuit is currently open.
    pub fn open_backends<'a>(&self, candidates: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        candidates
            .into_iter()
            .filter(|id| self.is_open(id))
            .map(str::to_string)
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(!cb.is_open("gemini-pro"));
        assert_eq!(cb.state("gemini-pro"), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test]
    async fn test_circuit_opens_after_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        cb.record_failure("gemini-pro");
        assert!(!cb.is_open("gemini-pro"));

        cb.record_failure("gemini-pro");
        assert!(cb.is_open("gemini-pro"));
    }

    #[tokio::test]
    async fn test_threshold_of_one_opens_on_first_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        cb.record_failure("gpt-4o");
        assert!(cb.is_open("gpt-4o"));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::default();

        cb.record_failure("gemini-pro");
        cb.record_failure("gemini-pro");
        cb.record_success("gemini-pro");

        cb.record_failure("gemini-pro");
        cb.record_failure("gemini-pro");
        assert!(!cb.is_open("gemini-pro"));
    }

    #[tokio::test]
    async fn test_backends_are_independent() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        cb.record_failure("gemini-pro");
        cb.record_failure("gemini-pro");

        assert!(cb.is_open("gemini-pro"));
        assert!(!cb.is_open("claude-sonnet"));
        assert_eq!(
            cb.open_backends(["gemini-pro", "claude-sonnet"]),
            vec!["gemini-pro".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_through_half_open() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(10),
            success_threshold: 1,
        });

        cb.record_failure("gemini-pro");
        assert!(cb.is_open("gemini-pro"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cb.is_open("gemini-pro"));
        assert_eq!(cb.state("gemini-pro"), CircuitState::HalfOpen { successes: 0 });

        cb.record_success("gemini-pro");
        assert_eq!(cb.state("gemini-pro"), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_recovery_reopens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(10),
            success_threshold: 2,
        });

        cb.record_failure("gemini-pro");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cb.is_open("gemini-pro"));

        cb.record_failure("gemini-pro");
        assert!(cb.is_open("gemini-pro"));
    }
}
