//! Attempt bookkeeping for backend fallback.
//!
//! A backend that has been dispatched once is never offered again in the
//! same run, whatever the outcome.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::backends::FailureClass;

/// One failed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// 1-based attempt number within the run
    pub attempt: usize,
    pub backend_id: String,
    pub class: FailureClass,
    pub reason: String,
}

/// Backends tried so far in one run.
#[derive(Debug, Clone, Default)]
pub struct AttemptLedger {
    attempted: Vec<String>,
    seen: BTreeSet<String>,
    failures: Vec<AttemptFailure>,
    partial_text: String,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch and return its attempt number.
    pub fn dispatch(&mut self, backend_id: &str) -> usize {
        if self.seen.insert(backend_id.to_string()) {
            self.attempted.push(backend_id.to_string());
        } else {
            tracing::warn!(backend = %backend_id, "Backend dispatched twice in one run");
        }
        self.attempted.len()
    }

    /// Keep `backend_id` out of later selections without counting an attempt.
    pub fn exclude(&mut self, backend_id: &str) {
        self.seen.insert(backend_id.to_string());
    }

    pub fn record_failure(
        &mut self,
        attempt: usize,
        backend_id: &str,
        class: FailureClass,
        reason: impl Into<String>,
    ) {
        self.failures.push(AttemptFailure {
            attempt,
            backend_id: backend_id.to_string(),
            class,
            reason: reason.into(),
        });
    }

    /// Keep the longest partial output seen so far.
    pub fn keep_partial(&mut self, text: &str) {
        if text.len() > self.partial_text.len() {
            self.partial_text = text.to_string();
        }
    }

    pub fn has_attempted(&self, backend_id: &str) -> bool {
        self.seen.contains(backend_id)
    }

    /// Exclusion set for the next selection: everything attempted plus `extra`.
    pub fn exclusions<I, S>(&self, extra: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut excluded = self.seen.clone();
        excluded.extend(extra.into_iter().map(Into::into));
        excluded
    }

    /// Attempted backends, in dispatch order.
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    pub fn attempts(&self) -> usize {
        self.attempted.len()
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.failures.last()
    }

    pub fn partial_text(&self) -> &str {
        &self.partial_text
    }
}
