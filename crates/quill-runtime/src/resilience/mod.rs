//! Resilience patterns for the generation pipeline.
//!
//! This module provides:
//! - Per-backend circuit breaker
//! - Run budgets and usage accounting
//! - The attempt ledger that drives fallback

mod budget;
mod circuit_breaker;
mod fallback;

pub use budget::{RunBudget, RunUsage, TokenBudget};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::{AttemptFailure, AttemptLedger};
