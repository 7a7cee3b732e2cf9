//! The dispatcher: owns the worker pool and drives buckets from the plan
//! to completion, including retry rescheduling, crash recovery, and the
//! run-level termination conditions from spec.md §4.2.
//!
//! Grounded on the teacher's `orchestrator.rs::Orchestrator::run_with_tests`
//! event shape (clear-and-recreate output dir, spawn a task per unit of
//! work, collect + report, aggregate final stats) generalized from a batch
//! of ephemeral sandbox executions to an event loop over long-lived worker
//! processes.

pub mod pool;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::RunnerSettings;
use crate::ipc::{ParentMessage, WorkerMessage};
use crate::model::{SerializedError, Status, Test, TestResult};
use crate::planner::{Bucket, Plan};
use crate::report::Reporter;

use pool::{PoolError, WorkerCommand, WorkerProcess};
use retry::RetryTracker;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Why the run stopped, beyond "all buckets completed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    MaxFailuresReached,
    GlobalTimeout,
    Interrupted,
}

pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub flaky: usize,
    pub stop_reason: StopReason,
    pub duration: Duration,
}

impl RunSummary {
    /// Exit code per spec.md §6 plus the flaky-success extension
    /// (DESIGN.md Open Question 3).
    pub fn exit_code(&self) -> i32 {
        if self.stop_reason == StopReason::Interrupted {
            return 130;
        }
        if self.failed > 0 || self.timed_out > 0 {
            return 1;
        }
        if self.flaky > 0 {
            return 2;
        }
        0
    }
}

/// One unit of scheduled work: a bucket of tests, plus the attempt number
/// each test in it should run as (all tests in a retry bucket share the
/// same attempt index since a retry always starts a fresh worker).
struct Job {
    bucket: Bucket,
    attempt: usize,
}

enum BucketOutcome {
    Finished { job: Job, worker_index: usize },
    /// `in_flight_test_id` is the one test (if any) whose `TestBegin`
    /// arrived with no matching `TestEnd` before the worker died — the
    /// only test in the bucket whose retry budget this crash consumes
    /// (spec.md §7 item 4). Every other test without a recorded result is
    /// rescheduled fresh, retry counter untouched.
    Crashed { job: Job, worker_index: usize, error: SerializedError, in_flight_test_id: Option<String> },
}

pub struct Dispatcher<'a> {
    settings: &'a RunnerSettings,
    reporter: Arc<dyn Reporter>,
    command: Arc<dyn WorkerCommand>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        settings: &'a RunnerSettings,
        reporter: Arc<dyn Reporter>,
        command: Arc<dyn WorkerCommand>,
    ) -> Self {
        Self { settings, reporter, command }
    }

    pub async fn run(&self, plan: Plan) -> RunSummary {
        let start = Instant::now();
        let total = plan.tests.len();

        self.reporter.on_begin(&plan.tests).await;

        if plan.buckets.is_empty() {
            self.reporter.on_end(&[]).await;
            return RunSummary {
                total: 0,
                passed: 0,
                failed: 0,
                timed_out: 0,
                skipped: 0,
                flaky: 0,
                stop_reason: StopReason::Completed,
                duration: start.elapsed(),
            };
        }

        let cancel = CancellationToken::new();
        let failure_budget = self.settings.max_failures;
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let worker_sequence = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        // pools of idle, already-initialized workers, keyed by the bucket
        // group they were spawned for, so a retry for the same
        // project/variation can reuse a live process instead of respawning.
        let idle_workers: Arc<tokio::sync::Mutex<HashMap<String, Vec<WorkerProcess>>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        let (tx, mut rx) = mpsc::unbounded_channel::<BucketOutcome>();

        let mut pending: Vec<Job> = plan
            .buckets
            .into_iter()
            .map(|bucket| Job { bucket, attempt: 0 })
            .collect();
        let mut in_flight = 0usize;
        let mut failures = 0usize;
        let mut retry_tracker = RetryTracker::new();
        let mut stop_reason = StopReason::Completed;

        let sigint = tokio::signal::ctrl_c();
        tokio::pin!(sigint);
        // A global timeout is modeled as a long sleep rather than
        // `Option<Sleep>` so it can sit directly in `tokio::select!` without
        // pinning gymnastics; absence of a deadline uses an effectively
        // unreachable horizon.
        const NO_DEADLINE_SECS: u64 = 10 * 365 * 24 * 3600;
        let global_deadline =
            tokio::time::sleep(Duration::from_secs(self.settings.global_timeout_secs.unwrap_or(NO_DEADLINE_SECS)));
        tokio::pin!(global_deadline);

        loop {
            while in_flight < self.settings.workers.max(1) && !pending.is_empty() {
                let job = pending.remove(0);
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                in_flight += 1;
                let tx = tx.clone();
                let command = self.command.clone();
                let idle_workers = idle_workers.clone();
                let worker_sequence = worker_sequence.clone();
                let cancel = cancel.clone();
                let reporter = self.reporter.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job(job, command, idle_workers, worker_sequence, cancel, reporter, tx).await;
                });
            }

            if in_flight == 0 && pending.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut sigint, if !cancel.is_cancelled() => {
                    warn!("interrupted, requesting graceful shutdown");
                    cancel.cancel();
                    stop_reason = StopReason::Interrupted;
                }
                _ = &mut global_deadline, if !cancel.is_cancelled() => {
                    warn!("global timeout reached");
                    cancel.cancel();
                    stop_reason = StopReason::GlobalTimeout;
                }
                outcome = rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    in_flight -= 1;
                    match outcome {
                        BucketOutcome::Finished { job, .. } => {
                            for test in &job.bucket.tests {
                                retry_tracker.record_attempt(&test.id);
                                if let Some(result) = test.final_result() {
                                    if !matches!(result.status, Status::Passed | Status::Skipped) {
                                        failures += 1;
                                    }
                                    self.reporter.on_test_end(test, &result).await;
                                }
                                retry_tracker.mark_flaky(&test.id, test.is_flaky());
                            }
                            let retry_tests: Vec<Arc<Test>> = job
                                .bucket
                                .tests
                                .iter()
                                .filter(|t| t.should_retry())
                                .cloned()
                                .collect();
                            if !retry_tests.is_empty() && !cancel.is_cancelled() {
                                // Retries go to the front of the queue for
                                // responsiveness (spec.md §4.2 step 3).
                                pending.insert(0, Job {
                                    bucket: Bucket { key: job.bucket.key, tests: retry_tests },
                                    attempt: job.attempt + 1,
                                });
                            }
                        }
                        BucketOutcome::Crashed { job, worker_index, error, in_flight_test_id } => {
                            error!(worker = worker_index, error = %error.message, "worker crashed mid-bucket");
                            self.reporter.on_error(&error).await;

                            let mut retry_tests: Vec<Arc<Test>> = Vec::new();
                            let mut fresh_tests: Vec<Arc<Test>> = Vec::new();
                            for test in &job.bucket.tests {
                                if let Some(result) = test.final_result() {
                                    // TestEnd already arrived for this one before the
                                    // crash; it completed normally and just hasn't
                                    // been reported to the reporter yet.
                                    if !matches!(result.status, Status::Passed | Status::Skipped) {
                                        failures += 1;
                                    }
                                    retry_tracker.record_attempt(&test.id);
                                    self.reporter.on_test_end(test, &result).await;
                                    retry_tracker.mark_flaky(&test.id, test.is_flaky());
                                    continue;
                                }
                                if in_flight_test_id.as_deref() == Some(test.id.as_str()) {
                                    // The one test genuinely in flight when the
                                    // worker died: the crash consumes its retry
                                    // budget like any other failed attempt.
                                    test.record_result(
                                        TestResult::new(job.attempt, worker_index, Status::Failed)
                                            .with_error(error.clone()),
                                    );
                                    failures += 1;
                                    retry_tracker.record_attempt(&test.id);
                                    self.reporter.on_test_end(test, &test.final_result().unwrap()).await;
                                    retry_tracker.mark_flaky(&test.id, test.is_flaky());
                                    if test.should_retry() {
                                        retry_tests.push(test.clone());
                                    }
                                } else {
                                    // Never started: rescheduled fresh, retry
                                    // counter untouched (spec.md §7 item 4).
                                    fresh_tests.push(test.clone());
                                }
                            }
                            // Retries (and the fresh reschedule below) go to the
                            // front of the queue for responsiveness (spec.md §4.2
                            // step 3).
                            if !retry_tests.is_empty() && !cancel.is_cancelled() {
                                pending.insert(0, Job {
                                    bucket: Bucket { key: job.bucket.key.clone(), tests: retry_tests },
                                    attempt: job.attempt + 1,
                                });
                            }
                            if !fresh_tests.is_empty() && !cancel.is_cancelled() {
                                pending.insert(0, Job {
                                    bucket: Bucket { key: job.bucket.key, tests: fresh_tests },
                                    attempt: job.attempt,
                                });
                            }
                        }
                    }

                    if let Some(budget) = failure_budget {
                        if failures >= budget && !cancel.is_cancelled() {
                            warn!(failures, budget, "max failures reached, stopping");
                            cancel.cancel();
                            stop_reason = StopReason::MaxFailuresReached;
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                pending.clear();
                if in_flight == 0 {
                    break;
                }
            }
        }

        {
            let mut workers = idle_workers.lock().await;
            for (_, pool) in workers.drain() {
                for mut w in pool {
                    w.terminate().await;
                }
            }
        }

        let mut passed = 0;
        let mut failed = 0;
        let mut timed_out = 0;
        let mut skipped = 0;
        for test in &plan.tests {
            match test.final_result().map(|r| r.status) {
                Some(Status::Passed) => passed += 1,
                Some(Status::Failed) => failed += 1,
                Some(Status::TimedOut) => timed_out += 1,
                Some(Status::Skipped) => skipped += 1,
                None => {}
            }
        }
        let flaky = retry_tracker.stats().flaky;

        if stop_reason == StopReason::GlobalTimeout {
            self.reporter.on_timeout(&plan.tests).await;
        } else {
            self.reporter.on_end(&plan.tests).await;
        }
        debug!(total, passed, failed, flaky, "run complete");

        RunSummary {
            total,
            passed,
            failed,
            timed_out,
            skipped,
            flaky,
            stop_reason,
            duration: start.elapsed(),
        }
    }
}

fn pool_key(bucket: &Bucket) -> String {
    format!("{}::{}", bucket.key.project, bucket.key.variation_hash)
}

async fn run_job(
    job: Job,
    command: Arc<dyn WorkerCommand>,
    idle_workers: Arc<tokio::sync::Mutex<HashMap<String, Vec<WorkerProcess>>>>,
    worker_sequence: Arc<std::sync::atomic::AtomicUsize>,
    cancel: CancellationToken,
    reporter: Arc<dyn Reporter>,
    tx: mpsc::UnboundedSender<BucketOutcome>,
) {
    let key = pool_key(&job.bucket);
    let project = job.bucket.tests[0].project.clone();

    let mut worker = {
        let mut workers = idle_workers.lock().await;
        workers.get_mut(&key).and_then(|v| v.pop())
    };

    if worker.is_none() {
        let index = worker_sequence.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match WorkerProcess::spawn(index, command.as_ref(), &project, &job.bucket.key.variation_hash)
            .await
        {
            Ok(w) => worker = Some(w),
            Err(e) => {
                let _ = tx.send(BucketOutcome::Crashed {
                    worker_index: index,
                    error: SerializedError {
                        message: format!("failed to spawn worker: {e}"),
                        stack: None,
                        value: None,
                    },
                    in_flight_test_id: None,
                    job,
                });
                return;
            }
        }
    }
    let mut worker = worker.unwrap();
    let worker_index = worker.index;

    let test_ids: Vec<String> = job.bucket.tests.iter().map(|t| t.id.clone()).collect();
    if worker
        .send(ParentMessage::Run { bucket_id: key.clone(), test_ids, attempt: job.attempt })
        .await
        .is_err()
    {
        let _ = tx.send(BucketOutcome::Crashed {
            worker_index,
            error: SerializedError {
                message: "failed to send run message to worker".into(),
                stack: None,
                value: None,
            },
            in_flight_test_id: None,
            job,
        });
        return;
    }

    let tests_by_id: HashMap<&str, &Arc<Test>> =
        job.bucket.tests.iter().map(|t| (t.id.as_str(), t)).collect();

    // Tracks the one test currently between `TestBegin` and `TestEnd`, so a
    // crash can tell "genuinely in-flight" apart from "never started"
    // (spec.md §7 item 4).
    let mut in_flight_test_id: Option<String> = None;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = worker.send(ParentMessage::Stop).await;
            }
            msg = worker.recv() => {
                match msg {
                    Some(Ok(WorkerMessage::TestBegin { test_id, .. })) => {
                        if let Some(test) = tests_by_id.get(test_id.as_str()) {
                            reporter.on_test_begin(*test).await;
                        }
                        in_flight_test_id = Some(test_id);
                        continue;
                    }
                    Some(Ok(WorkerMessage::StdOut { test_id, chunk })) => {
                        if let Some(test) = tests_by_id.get(test_id.as_str()) {
                            reporter.on_std_out(test, &chunk).await;
                        }
                        continue;
                    }
                    Some(Ok(WorkerMessage::StdErr { test_id, chunk })) => {
                        if let Some(test) = tests_by_id.get(test_id.as_str()) {
                            reporter.on_std_err(test, &chunk).await;
                        }
                        continue;
                    }
                    Some(Ok(WorkerMessage::TestEnd { test_id, attempt, status, duration_ms, error, data })) => {
                        if let Some(test) = tests_by_id.get(test_id.as_str()) {
                            let mut result = TestResult::new(attempt, worker_index, status)
                                .with_duration(Duration::from_millis(duration_ms));
                            result.data = data;
                            if let Some(err) = error {
                                result = result.with_error(err);
                            }
                            test.record_result(result);
                        }
                        in_flight_test_id = None;
                        continue;
                    }
                    Some(Ok(WorkerMessage::Done { failed_test_id, fatal_error, .. })) => {
                        match fatal_error {
                            Some(error) => {
                                break BucketOutcome::Crashed {
                                    job, worker_index, error,
                                    in_flight_test_id: failed_test_id.or(in_flight_test_id),
                                };
                            }
                            None => break BucketOutcome::Finished { job, worker_index },
                        }
                    }
                    Some(Ok(WorkerMessage::TeardownError { error, .. })) => {
                        warn!(worker = worker_index, error = %error.message, "teardown error");
                        continue;
                    }
                    Some(Ok(WorkerMessage::Ready)) | Some(Ok(WorkerMessage::InitError { .. })) => continue,
                    Some(Err(e)) => {
                        break BucketOutcome::Crashed {
                            job, worker_index,
                            error: SerializedError { message: e.to_string(), stack: None, value: None },
                            in_flight_test_id,
                        };
                    }
                    None => {
                        break BucketOutcome::Crashed {
                            job, worker_index,
                            error: SerializedError {
                                message: "worker process ended unexpectedly".into(),
                                stack: None,
                                value: None,
                            },
                            in_flight_test_id,
                        };
                    }
                }
            }
        }
    };

    let survived = matches!(&outcome, BucketOutcome::Finished { .. });
    if survived && !cancel.is_cancelled() {
        worker.state = pool::WorkerState::Idle;
        let mut workers = idle_workers.lock().await;
        workers.entry(key).or_default().push(worker);
    } else {
        worker.terminate().await;
    }

    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_prioritizes_interrupted_then_failed_then_flaky() {
        let base = RunSummary {
            total: 1,
            passed: 1,
            failed: 0,
            timed_out: 0,
            skipped: 0,
            flaky: 0,
            stop_reason: StopReason::Completed,
            duration: Duration::ZERO,
        };
        assert_eq!(base.exit_code(), 0);

        let flaky = RunSummary { flaky: 1, ..base_clone(&base) };
        assert_eq!(flaky.exit_code(), 2);

        let failed = RunSummary { failed: 1, flaky: 1, ..base_clone(&base) };
        assert_eq!(failed.exit_code(), 1);

        let interrupted = RunSummary {
            stop_reason: StopReason::Interrupted,
            failed: 1,
            ..base_clone(&base)
        };
        assert_eq!(interrupted.exit_code(), 130);
    }

    fn base_clone(s: &RunSummary) -> RunSummary {
        RunSummary {
            total: s.total,
            passed: s.passed,
            failed: s.failed,
            timed_out: s.timed_out,
            skipped: s.skipped,
            flaky: s.flaky,
            stop_reason: s.stop_reason,
            duration: s.duration,
        }
    }
}
