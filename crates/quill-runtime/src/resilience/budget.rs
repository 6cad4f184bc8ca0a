//! Token budgets and per-run usage accounting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use quill_core::CostClass;

use crate::invoker::GenerationResult;

/// Token budget for one scope.
#[derive(Debug)]
pub struct TokenBudget {
    /// Maximum tokens allowed
    pub max_tokens: u32,

    used: AtomicU32,
}

impl TokenBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            used: AtomicU32::new(0),
        }
    }

    /// Record token usage.
    pub fn record(&self, tokens: u32) {
        self.used.fetch_add(tokens, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.max_tokens.saturating_sub(self.used.load(Ordering::SeqCst))
    }
}

/// Limits for a single run: attempt count and optional token ceiling.
#[derive(Debug)]
pub struct RunBudget {
    max_attempts: usize,
    tokens: Option<TokenBudget>,
}

impl RunBudget {
    pub fn new(max_attempts: usize, token_budget: Option<u32>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            tokens: token_budget.map(TokenBudget::new),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// `max_tokens` for the next request: never above the descriptor's
    /// ceiling, the requested value, or what is left in the budget.
    pub fn cap_tokens(&self, requested: u32, ceiling: u32) -> u32 {
        let capped = requested.min(ceiling);
        match &self.tokens {
            Some(budget) => capped.min(budget.remaining()),
            None => capped,
        }
    }

    /// True once the token ceiling is used up.
    pub fn is_exhausted(&self) -> bool {
        self.tokens
            .as_ref()
            .map(|budget| budget.remaining() == 0)
            .unwrap_or(false)
    }

    pub fn record_tokens(&self, tokens: u32) {
        if let Some(budget) = &self.tokens {
            budget.record(tokens);
        }
    }

    pub fn remaining_tokens(&self) -> Option<u32> {
        self.tokens.as_ref().map(TokenBudget::remaining)
    }
}

/// Accumulated backend usage for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    /// Backend invocations dispatched
    pub calls: u32,

    /// Estimated tokens received, including partial output
    pub tokens_emitted: u32,

    /// Time spent inside backend invocations
    pub wall_clock_ms: u64,

    /// Relative cost: calls weighted by cost class
    pub cost_units: u32,
}

impl RunUsage {
    /// Add one invocation.
    pub fn add(&mut self, result: &GenerationResult, cost_class: CostClass) {
        self.calls += 1;
        self.tokens_emitted += result.tokens_emitted;
        self.wall_clock_ms += result.wall_clock_ms;
        self.cost_units += cost_class.units();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{GenerationStatus, InvocationState};

    #[test]
    fn test_token_budget_saturates() {
        let budget = TokenBudget::new(100);
        assert_eq!(budget.remaining(), 100);

        budget.record(60);
        assert_eq!(budget.remaining(), 40);

        budget.record(60);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_cap_tokens_respects_every_limit() {
        let budget = RunBudget::new(4, Some(3000));
        assert_eq!(budget.cap_tokens(8000, 4000), 3000);
        assert_eq!(budget.cap_tokens(1000, 4000), 1000);
        assert_eq!(budget.cap_tokens(2000, 1500), 1500);

        budget.record_tokens(2500);
        assert_eq!(budget.cap_tokens(8000, 8000), 500);
        assert!(!budget.is_exhausted());

        budget.record_tokens(500);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_unbounded_tokens() {
        let budget = RunBudget::new(0, None);
        assert_eq!(budget.max_attempts(), 1);
        assert_eq!(budget.cap_tokens(8000, 4000), 4000);
        assert!(!budget.is_exhausted());
        assert_eq!(budget.remaining_tokens(), None);
    }

    #[test]
    fn test_usage_weights_cost_class() {
        let result = GenerationResult {
            backend_id: "claude-sonnet".to_string(),
            raw_text: "text".to_string(),
            tokens_emitted: 120,
            wall_clock_ms: 900,
            status: GenerationStatus::Completed,
            trace: vec![InvocationState::Idle, InvocationState::Completed],
        };

        let mut usage = RunUsage::default();
        usage.add(&result, CostClass::Premium);
        usage.add(&result, CostClass::Economy);

        assert_eq!(usage.calls, 2);
        assert_eq!(usage.tokens_emitted, 240);
        assert_eq!(usage.wall_clock_ms, 1800);
        assert_eq!(usage.cost_units, 5);
    }
}
