//! Test reporting and output fan-out.
//!
//! This module provides the [`Reporter`] trait for receiving test events
//! plus the built-in [`NullReporter`], [`MultiReporter`], [`ConsoleReporter`]
//! (`report::console`) and [`JUnitReporter`] (`report::junit`)
//! implementations.
//!
//! # Event order
//!
//! 1. [`on_begin`](Reporter::on_begin) (once, after planning)
//! 2. [`on_test_begin`](Reporter::on_test_begin) /
//!    [`on_test_end`](Reporter::on_test_end) (per attempt, concurrently
//!    across workers)
//! 3. [`on_end`](Reporter::on_end) (once, after the run stops)
//!
//! Reporters never see attempts below the final one silently dropped: a
//! retried test reports `on_test_end` once per attempt, so a flaky test
//! produces more than one `on_test_end` call for the same test id before
//! its final result settles.

pub mod console;
pub mod junit;

use std::sync::Arc;

use async_trait::async_trait;

pub use console::ConsoleReporter;
pub use junit::JUnitReporter;

use crate::model::{SerializedError, Test, TestResult};

/// Receives test execution events. Implementations must be `Send + Sync`
/// since events arrive from multiple worker-driving tasks concurrently.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once, after the plan is built and before any worker is spawned.
    async fn on_begin(&self, tests: &[Arc<Test>]);

    /// Called when an attempt starts executing. May be called concurrently.
    async fn on_test_begin(&self, test: &Arc<Test>);

    /// Called when an attempt finishes. `result` is the attempt that just
    /// completed, not necessarily the test's final result if a retry
    /// follows.
    async fn on_test_end(&self, test: &Arc<Test>, result: &TestResult);

    /// Called once the run stops, successfully or otherwise. `tests` is the
    /// same slice passed to `on_begin`; each test's `final_result()` is by
    /// now populated (or `None` if it never got to run).
    async fn on_end(&self, tests: &[Arc<Test>]);

    /// A chunk of a running test's captured stdout. May arrive any number
    /// of times between that test's `on_test_begin` and `on_test_end`.
    async fn on_std_out(&self, _test: &Arc<Test>, _chunk: &str) {}

    /// A chunk of a running test's captured stderr, same ordering guarantee
    /// as [`on_std_out`](Reporter::on_std_out).
    async fn on_std_err(&self, _test: &Arc<Test>, _chunk: &str) {}

    /// Called in place of `on_end` when the run stops because the global
    /// timeout fired rather than because every bucket completed (spec.md
    /// §4.2).
    async fn on_timeout(&self, _tests: &[Arc<Test>]) {}

    /// A fatal, run-level error not tied to any one test (e.g. a worker
    /// process failed to spawn).
    async fn on_error(&self, _error: &SerializedError) {}
}

/// Discards all events.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_begin(&self, _tests: &[Arc<Test>]) {}
    async fn on_test_begin(&self, _test: &Arc<Test>) {}
    async fn on_test_end(&self, _test: &Arc<Test>, _result: &TestResult) {}
    async fn on_end(&self, _tests: &[Arc<Test>]) {}
    async fn on_std_out(&self, _test: &Arc<Test>, _chunk: &str) {}
    async fn on_std_err(&self, _test: &Arc<Test>, _chunk: &str) {}
    async fn on_timeout(&self, _tests: &[Arc<Test>]) {}
    async fn on_error(&self, _error: &SerializedError) {}
}

/// Forwards every event to each child reporter in order. A child reporter
/// that panics inside an `async fn` would still poison the others the same
/// way a direct call would; reporters are trusted collaborators, not
/// sandboxed plugins, matching the teacher's `MultiReporter`.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self { reporters: Vec::new() }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_begin(&self, tests: &[Arc<Test>]) {
        for reporter in &self.reporters {
            reporter.on_begin(tests).await;
        }
    }

    async fn on_test_begin(&self, test: &Arc<Test>) {
        for reporter in &self.reporters {
            reporter.on_test_begin(test).await;
        }
    }

    async fn on_test_end(&self, test: &Arc<Test>, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_end(test, result).await;
        }
    }

    async fn on_end(&self, tests: &[Arc<Test>]) {
        for reporter in &self.reporters {
            reporter.on_end(tests).await;
        }
    }

    async fn on_std_out(&self, test: &Arc<Test>, chunk: &str) {
        for reporter in &self.reporters {
            reporter.on_std_out(test, chunk).await;
        }
    }

    async fn on_std_err(&self, test: &Arc<Test>, chunk: &str) {
        for reporter in &self.reporters {
            reporter.on_std_err(test, chunk).await;
        }
    }

    async fn on_timeout(&self, tests: &[Arc<Test>]) {
        for reporter in &self.reporters {
            reporter.on_timeout(tests).await;
        }
    }

    async fn on_error(&self, error: &SerializedError) {
        for reporter in &self.reporters {
            reporter.on_error(error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, Status, Variation};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingReporter {
        begins: Arc<AtomicUsize>,
        ends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        async fn on_begin(&self, _tests: &[Arc<Test>]) {}
        async fn on_test_begin(&self, _test: &Arc<Test>) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_test_end(&self, _test: &Arc<Test>, _result: &TestResult) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_end(&self, _tests: &[Arc<Test>]) {}
    }

    fn sample_test() -> Arc<Test> {
        let project = Arc::new(Project::new("default", "tests"));
        Arc::new(Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            "t".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            Arc::new(|_info, _args| Box::pin(async { Ok(()) })),
        ))
    }

    #[tokio::test]
    async fn multi_reporter_forwards_to_every_child() {
        let begins_a = Arc::new(AtomicUsize::new(0));
        let ends_a = Arc::new(AtomicUsize::new(0));
        let begins_b = Arc::new(AtomicUsize::new(0));
        let ends_b = Arc::new(AtomicUsize::new(0));

        let multi = MultiReporter::new()
            .with_reporter(CountingReporter { begins: begins_a.clone(), ends: ends_a.clone() })
            .with_reporter(CountingReporter { begins: begins_b.clone(), ends: ends_b.clone() });

        let test = sample_test();
        multi.on_test_begin(&test).await;
        multi.on_test_end(&test, &TestResult::new(0, 0, Status::Passed)).await;

        assert_eq!(begins_a.load(Ordering::SeqCst), 1);
        assert_eq!(ends_a.load(Ordering::SeqCst), 1);
        assert_eq!(begins_b.load(Ordering::SeqCst), 1);
        assert_eq!(ends_b.load(Ordering::SeqCst), 1);
    }
}
