//! Tracks per-test attempt counts across a run, for reporting only.
//!
//! The retry *decision* lives on [`crate::model::Test`] itself
//! (`should_retry`/`is_flaky`), since each `Test` already owns its own
//! result history. This tracker exists purely so the dispatcher can answer
//! "how many tests were flaky" and "how many attempts did this test take"
//! without re-locking every `Test`'s result vector at the end of a run.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    pub flaky: usize,
    pub retried: usize,
    pub total_attempts: usize,
}

/// Accumulates attempt counts as the dispatcher records results.
#[derive(Default)]
pub struct RetryTracker {
    attempts: HashMap<String, usize>,
    flaky: HashMap<String, bool>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, test_id: &str) {
        *self.attempts.entry(test_id.to_string()).or_insert(0) += 1;
    }

    pub fn mark_flaky(&mut self, test_id: &str, flaky: bool) {
        self.flaky.insert(test_id.to_string(), flaky);
    }

    pub fn attempts_for(&self, test_id: &str) -> usize {
        self.attempts.get(test_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> RetryStats {
        let flaky = self.flaky.values().filter(|v| **v).count();
        let retried = self.attempts.values().filter(|n| **n > 1).count();
        let total_attempts = self.attempts.values().sum();
        RetryStats { flaky, retried, total_attempts }
    }
}
