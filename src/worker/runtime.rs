//! Depth-first bucket execution: walks a file's suite tree, running
//! `beforeAll`/`afterAll` once per scope entered/exited, composing
//! `beforeEach`/`afterEach` with the active [`Environment`], and racing
//! each test body against its timeout.
//!
//! Grounded on the teacher's `orchestrator/runner.rs::TestRunner
//! ::exec_with_streaming` deadline-race pattern (`tokio::select!` between
//! the unit of work and a cancellation/timeout signal), generalized so
//! that after a timeout the teardown chain still runs, on a fresh deadline
//! (spec.md §4.3).

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::model::{
    compute_test_id, BodyError, FileSuite, HookError, Project, SerializedError, Status, Suite,
    SuiteChild, Test, TestInfo, TestResult, Variation, WorkerInfo,
};
use crate::worker::environment::Environment;

/// Emitted by the runtime as it executes a bucket; the caller (the IPC
/// event loop in `worker.rs`) turns these into `WorkerMessage`s.
pub enum RuntimeEvent {
    TestBegin { test_id: String },
    StdOut { test_id: String, chunk: String },
    StdErr { test_id: String, chunk: String },
    TestEnd { test_id: String, result: TestResult },
    TeardownError { error: SerializedError },
}

/// Teardown-only deadline: once a test body times out, teardown still gets
/// a fresh budget rather than inheriting the already-expired one (spec.md
/// §4.3 edge case).
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct BucketRunner<'a> {
    pub project: &'a Arc<Project>,
    pub variation: &'a Variation,
    pub repeat_index: usize,
    pub worker_index: usize,
    pub attempt: usize,
    /// Composed in order: `before_all`/`before_each` run forward (index 0
    /// first), `after_each`/`after_all` run in reverse (spec.md §6).
    pub environment: &'a [Arc<dyn Environment>],
}

impl<'a> BucketRunner<'a> {
    /// Runs every requested test id found in `file_suite`'s tree, emitting
    /// one `TestBegin`/`TestEnd` pair per test via `emit`. Suite-scoped
    /// `beforeAll` hooks run lazily, the first time a scope is entered that
    /// contains a requested test; `afterAll` hooks run once the traversal
    /// exits a scope whose `beforeAll` ran, in reverse declaration order
    /// (innermost first).
    pub async fn run(
        &self,
        file_suite: &FileSuite,
        requested: &HashSet<String>,
        emit: &mut (dyn FnMut(RuntimeEvent) + Send),
    ) {
        let worker_info = WorkerInfo { worker_index: self.worker_index, project: self.project.clone() };

        for env in self.environment {
            if let Err(e) = env.before_all(&worker_info).await {
                emit(RuntimeEvent::TeardownError { error: e.into() });
                return;
            }
        }

        let mut ordinal = 0usize;
        self.walk(&file_suite.file, &file_suite.root, &[], &[], requested, &mut ordinal, emit)
            .await;

        for env in self.environment.iter().rev() {
            if let Err(e) = env.after_all(&worker_info).await {
                emit(RuntimeEvent::TeardownError { error: e.into() });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk<'b>(
        &'b self,
        file: &'b std::path::Path,
        suite: &'b Suite,
        ancestor_titles: &'b [&'b str],
        ancestor_annotations: &'b [crate::model::Annotation],
        requested: &'b HashSet<String>,
        ordinal: &'b mut usize,
        emit: &'b mut (dyn FnMut(RuntimeEvent) + Send),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'b>> {
        Box::pin(async move {
            let mut titles = ancestor_titles.to_vec();
            titles.push(&suite.title);

            let mut annotations = ancestor_annotations.to_vec();
            annotations.extend(suite.annotations.iter().cloned());

            let spec_count = suite_spec_count(suite);
            let mut lookahead_ordinal = *ordinal;
            let has_requested = subtree_has_requested(
                &self.project.name,
                file,
                suite,
                self.variation,
                self.repeat_index,
                &mut lookahead_ordinal,
                requested,
            );
            if !has_requested {
                // No test in this scope (or any descendant) is part of the
                // assigned bucket: skip its hooks entirely, without running
                // children's hooks either. Ordinal still advances by the
                // full subtree's spec count so sibling numbering stays
                // stable regardless of bucket selection.
                *ordinal += spec_count;
                return;
            }

            for hook in &suite.hooks.before_all {
                let info = WorkerInfo {
                    worker_index: self.worker_index,
                    project: self.project.clone(),
                };
                if let Err(e) = hook(info).await {
                    emit(RuntimeEvent::TeardownError { error: e.into() });
                }
            }

            for child in &suite.children {
                match child {
                    SuiteChild::Suite(nested) => {
                        self.walk(file, nested, &titles, &annotations, requested, ordinal, emit).await;
                    }
                    SuiteChild::Spec(spec) => {
                        let id = compute_test_id(
                            &self.project.name,
                            file,
                            *ordinal,
                            self.variation,
                            self.repeat_index,
                        );
                        *ordinal += 1;
                        if !requested.contains(&id) {
                            continue;
                        }

                        let full_title = crate::model::full_title(&titles, &spec.title);
                        let timeout = spec.options.timeout.unwrap_or(self.project.timeout);
                        let mut spec_annotations = annotations.clone();
                        spec_annotations.extend(spec.annotations.iter().cloned());
                        let test = Test::new(
                            self.project.clone(),
                            file.to_path_buf(),
                            *ordinal - 1,
                            full_title,
                            self.variation.clone(),
                            self.repeat_index,
                            spec_annotations,
                            timeout,
                            spec.body.clone(),
                        );

                        emit(RuntimeEvent::TestBegin { test_id: id.clone() });
                        let result = self.run_one(suite, &test, timeout).await;
                        for chunk in &result.stdout {
                            emit(RuntimeEvent::StdOut { test_id: id.clone(), chunk: chunk.clone() });
                        }
                        for chunk in &result.stderr {
                            emit(RuntimeEvent::StdErr { test_id: id.clone(), chunk: chunk.clone() });
                        }
                        emit(RuntimeEvent::TestEnd { test_id: id, result });
                    }
                }
            }

            for hook in suite.hooks.after_all.iter().rev() {
                let info = WorkerInfo {
                    worker_index: self.worker_index,
                    project: self.project.clone(),
                };
                if let Err(e) = hook(info).await {
                    emit(RuntimeEvent::TeardownError { error: e.into() });
                }
            }
        })
    }

    async fn run_one(&self, suite: &Suite, test: &Test, timeout: Duration) -> TestResult {
        let start = Instant::now();
        let info = Arc::new(Mutex::new(TestInfo::new(test, self.attempt, self.worker_index)));

        if matches!(test.expected_status, crate::model::ExpectedStatus::Skipped) {
            return TestResult::new(self.attempt, self.worker_index, Status::Skipped)
                .with_duration(start.elapsed());
        }

        let setup = self.run_setup(suite, &info).await;
        let body_outcome = match setup {
            Ok(args) => {
                let body = test.body.clone();
                let info_for_body = info.clone();
                tokio::time::timeout(timeout, body(info_for_body, args)).await
            }
            Err(e) => Ok(Err(e)),
        };

        let (status, error) = match body_outcome {
            Ok(Ok(())) => (Status::Passed, None),
            Ok(Err(BodyError::Failed { message, stack })) => {
                (Status::Failed, Some(SerializedError { message, stack, value: None }))
            }
            Ok(Err(BodyError::Skipped { reason })) => {
                (Status::Skipped, reason.map(|r| SerializedError { message: r, stack: None, value: None }))
            }
            Err(_elapsed) => (
                Status::TimedOut,
                Some(SerializedError {
                    message: format!("test exceeded its {:?} timeout", timeout),
                    stack: None,
                    value: None,
                }),
            ),
        };

        // Teardown runs on a fresh deadline even after a timeout.
        if let Err(e) = tokio::time::timeout(TEARDOWN_GRACE, self.run_teardown(suite, &info)).await
        {
            warn!("teardown exceeded its grace period: {e}");
        }

        let (stdout, stderr) = {
            let mut info = info.lock().unwrap();
            (info.take_stdout(), info.take_stderr())
        };

        let mut result = TestResult::new(self.attempt, self.worker_index, status)
            .with_duration(start.elapsed())
            .with_output(stdout, stderr);
        if let Some(error) = error {
            result = result.with_error(error);
        }
        result
    }

    async fn run_setup(
        &self,
        suite: &Suite,
        info: &Arc<Mutex<TestInfo>>,
    ) -> Result<serde_json::Value, BodyError> {
        let mut merged = serde_json::Map::new();
        for env in self.environment {
            let value = env.before_each(info).await.map_err(hook_error_to_body_error)?;
            if let serde_json::Value::Object(fields) = value {
                merged.extend(fields);
            }
        }
        for hook in &suite.hooks.before_each {
            if let Err(e) = hook(info.clone()).await {
                return Err(hook_error_to_body_error(e));
            }
        }
        Ok(serde_json::Value::Object(merged))
    }

    async fn run_teardown(&self, suite: &Suite, info: &Arc<Mutex<TestInfo>>) {
        // user afterEach innermost-first, then the environment list in reverse.
        for hook in suite.hooks.after_each.iter().rev() {
            if let Err(e) = hook(info.clone()).await {
                debug!(error = %e.message, "afterEach hook failed");
            }
        }
        for env in self.environment.iter().rev() {
            if let Err(e) = env.after_each(info).await {
                debug!(error = %e.message, "environment afterEach failed");
            }
        }
    }
}

/// Total number of specs in `suite`'s subtree, used to keep ordinal
/// numbering stable when a scope is skipped wholesale.
fn suite_spec_count(suite: &Suite) -> usize {
    suite
        .children
        .iter()
        .map(|child| match child {
            SuiteChild::Suite(nested) => suite_spec_count(nested),
            SuiteChild::Spec(_) => 1,
        })
        .sum()
}

/// Peeks whether any spec in `suite`'s subtree is in `requested`, using a
/// scratch ordinal counter seeded from the real traversal's current
/// position (so ids line up) without mutating it.
fn subtree_has_requested(
    project_name: &str,
    file: &Path,
    suite: &Suite,
    variation: &Variation,
    repeat_index: usize,
    ordinal: &mut usize,
    requested: &HashSet<String>,
) -> bool {
    let mut found = false;
    for child in &suite.children {
        match child {
            SuiteChild::Suite(nested) => {
                if subtree_has_requested(project_name, file, nested, variation, repeat_index, ordinal, requested) {
                    found = true;
                }
            }
            SuiteChild::Spec(_spec) => {
                let id = compute_test_id(project_name, file, *ordinal, variation, repeat_index);
                *ordinal += 1;
                if requested.contains(&id) {
                    found = true;
                }
            }
        }
    }
    found
}

fn hook_error_to_body_error(e: HookError) -> BodyError {
    BodyError::Failed { message: e.message, stack: e.stack }
}

/// Computes the id every spec in `suite` would get under `variation` and
/// `repeat_index`, without running any hook or body.
///
/// A `ParentMessage::Run` carries only the flat `test_ids` a bucket should
/// execute, not which file or repeat index they came from (the pool key a
/// bucket is tagged with is shared across every bucket for a given
/// project/variation). The worker re-derives that mapping by generating
/// candidate ids the same way the planner did and checking for overlap
/// against the requested set, for every `(file, repeat_index)` it can see
/// for the project.
pub fn collect_candidate_ids(
    project_name: &str,
    file: &Path,
    suite: &Suite,
    variation: &Variation,
    repeat_index: usize,
) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut ordinal = 0usize;
    collect_ids_walk(project_name, file, suite, variation, repeat_index, &mut ordinal, &mut out);
    out
}

fn collect_ids_walk(
    project_name: &str,
    file: &Path,
    suite: &Suite,
    variation: &Variation,
    repeat_index: usize,
    ordinal: &mut usize,
    out: &mut HashSet<String>,
) {
    for child in &suite.children {
        match child {
            SuiteChild::Suite(nested) => {
                collect_ids_walk(project_name, file, nested, variation, repeat_index, ordinal, out);
            }
            SuiteChild::Spec(_spec) => {
                out.insert(compute_test_id(project_name, file, *ordinal, variation, repeat_index));
                *ordinal += 1;
            }
        }
    }
}

/// Finds the `(file, variation, repeat_index)` combination among `file_suites`
/// whose generated ids overlap `requested`, resolving `variation_hash` back
/// to the full [`Variation`] via the project's `define` list.
pub fn resolve_run_target<'a>(
    project: &Project,
    file_suites: &'a [FileSuite],
    variation_hash: &str,
    requested: &HashSet<String>,
) -> Option<(&'a FileSuite, Variation, usize)> {
    let variation = project.define.iter().find(|v| v.hash() == variation_hash)?.clone();
    for file_suite in file_suites {
        for repeat_index in 0..project.repeat_each.max(1) {
            let candidates = collect_candidate_ids(
                &project.name,
                &file_suite.file,
                &file_suite.root,
                &variation,
                repeat_index,
            );
            if candidates.intersection(requested).next().is_some() {
                return Some((file_suite, variation, repeat_index));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Spec, SpecOptions};
    use crate::worker::environment::NullEnvironment;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passing_spec(title: &str) -> Spec {
        Spec {
            title: title.to_string(),
            file: "a.spec".into(),
            line: 1,
            only: false,
            annotations: vec![],
            body: Arc::new(|_info, _args| Box::pin(async { Ok(()) })),
            options: SpecOptions::default(),
        }
    }

    fn failing_spec(title: &str) -> Spec {
        Spec {
            title: title.to_string(),
            file: "a.spec".into(),
            line: 1,
            only: false,
            annotations: vec![],
            body: Arc::new(|_info, _args| {
                Box::pin(async { Err(BodyError::Failed { message: "nope".into(), stack: None }) })
            }),
            options: SpecOptions::default(),
        }
    }

    #[tokio::test]
    async fn runs_only_requested_tests_and_emits_begin_end_pairs() {
        let project = Arc::new(Project::new("default", "tests"));
        let mut root = Suite::new("root", "a.spec");
        root.children.push(SuiteChild::Spec(passing_spec("one")));
        root.children.push(SuiteChild::Spec(passing_spec("two")));
        let file_suite = FileSuite { project: project.clone(), file: "a.spec".into(), root };

        let id0 = compute_test_id("default", &PathBuf::from("a.spec"), 0, &Variation::default(), 0);

        let env: Arc<dyn Environment> = Arc::new(NullEnvironment);
        let runner = BucketRunner {
            project: &project,
            variation: &Variation::default(),
            repeat_index: 0,
            worker_index: 0,
            attempt: 0,
            environment: &[env],
        };

        let mut requested = HashSet::new();
        requested.insert(id0.clone());

        let mut events = Vec::new();
        runner
            .run(&file_suite, &requested, &mut |e| events.push(e))
            .await;

        let begins = events.iter().filter(|e| matches!(e, RuntimeEvent::TestBegin { .. })).count();
        assert_eq!(begins, 1);
    }

    #[tokio::test]
    async fn before_all_runs_once_and_after_all_runs_once_per_scope() {
        let project = Arc::new(Project::new("default", "tests"));
        let before_count = Arc::new(AtomicUsize::new(0));
        let after_count = Arc::new(AtomicUsize::new(0));

        let mut root = Suite::new("root", "a.spec");
        {
            let before_count = before_count.clone();
            root.hooks.before_all.push(Arc::new(move |_info| {
                let before_count = before_count.clone();
                Box::pin(async move {
                    before_count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        {
            let after_count = after_count.clone();
            root.hooks.after_all.push(Arc::new(move |_info| {
                let after_count = after_count.clone();
                Box::pin(async move {
                    after_count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        root.children.push(SuiteChild::Spec(passing_spec("one")));
        root.children.push(SuiteChild::Spec(passing_spec("two")));
        let file_suite = FileSuite { project: project.clone(), file: "a.spec".into(), root };

        let id0 = compute_test_id("default", &PathBuf::from("a.spec"), 0, &Variation::default(), 0);
        let id1 = compute_test_id("default", &PathBuf::from("a.spec"), 1, &Variation::default(), 0);

        let env: Arc<dyn Environment> = Arc::new(NullEnvironment);
        let runner = BucketRunner {
            project: &project,
            variation: &Variation::default(),
            repeat_index: 0,
            worker_index: 0,
            attempt: 0,
            environment: &[env],
        };

        let requested: HashSet<String> = [id0, id1].into_iter().collect();
        let mut events = Vec::new();
        runner.run(&file_suite, &requested, &mut |e| events.push(e)).await;

        assert_eq!(before_count.load(Ordering::SeqCst), 1);
        assert_eq!(after_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_hooks_for_scopes_with_no_requested_tests() {
        let project = Arc::new(Project::new("default", "tests"));
        let skipped_count = Arc::new(AtomicUsize::new(0));

        let mut untouched = Suite::new("untouched", "a.spec");
        {
            let skipped_count = skipped_count.clone();
            untouched.hooks.before_all.push(Arc::new(move |_info| {
                let skipped_count = skipped_count.clone();
                Box::pin(async move {
                    skipped_count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        untouched.children.push(SuiteChild::Spec(passing_spec("untouched one")));

        let mut root = Suite::new("root", "a.spec");
        root.children.push(SuiteChild::Suite(untouched));
        root.children.push(SuiteChild::Spec(passing_spec("wanted")));
        let file_suite = FileSuite { project: project.clone(), file: "a.spec".into(), root };

        // ordinal 0 is the spec inside `untouched`, ordinal 1 is `wanted`.
        let wanted_id =
            compute_test_id("default", &PathBuf::from("a.spec"), 1, &Variation::default(), 0);

        let env: Arc<dyn Environment> = Arc::new(NullEnvironment);
        let runner = BucketRunner {
            project: &project,
            variation: &Variation::default(),
            repeat_index: 0,
            worker_index: 0,
            attempt: 0,
            environment: &[env],
        };

        let requested: HashSet<String> = [wanted_id].into_iter().collect();
        let mut events = Vec::new();
        runner.run(&file_suite, &requested, &mut |e| events.push(e)).await;

        assert_eq!(skipped_count.load(Ordering::SeqCst), 0);
        let begins = events.iter().filter(|e| matches!(e, RuntimeEvent::TestBegin { .. })).count();
        assert_eq!(begins, 1);
    }

    #[test]
    fn resolve_run_target_finds_the_matching_file_and_repeat_index() {
        let mut project = Project::new("default", "tests");
        project.repeat_each = 2;
        let project = Arc::new(project);

        let mut root_a = Suite::new("root", "a.spec");
        root_a.children.push(SuiteChild::Spec(passing_spec("one")));
        let fs_a = FileSuite { project: project.clone(), file: "a.spec".into(), root: root_a };

        let mut root_b = Suite::new("root", "b.spec");
        root_b.children.push(SuiteChild::Spec(passing_spec("two")));
        let fs_b = FileSuite { project: project.clone(), file: "b.spec".into(), root: root_b };

        let target_id =
            compute_test_id("default", &PathBuf::from("b.spec"), 0, &Variation::default(), 1);
        let requested: HashSet<String> = [target_id].into_iter().collect();

        let file_suites = [fs_a, fs_b];
        let (file_suite, variation, repeat_index) = resolve_run_target(
            &project,
            &file_suites,
            &Variation::default().hash(),
            &requested,
        )
        .expect("a matching target");

        assert_eq!(file_suite.file, PathBuf::from("b.spec"));
        assert_eq!(repeat_index, 1);
        assert_eq!(variation.hash(), Variation::default().hash());
    }

    #[tokio::test]
    async fn failing_body_yields_failed_status_with_message() {
        let project = Arc::new(Project::new("default", "tests"));
        let mut root = Suite::new("root", "a.spec");
        root.children.push(SuiteChild::Spec(failing_spec("bad")));
        let file_suite = FileSuite { project: project.clone(), file: "a.spec".into(), root };

        let id0 = compute_test_id("default", &PathBuf::from("a.spec"), 0, &Variation::default(), 0);
        let env: Arc<dyn Environment> = Arc::new(NullEnvironment);
        let runner = BucketRunner {
            project: &project,
            variation: &Variation::default(),
            repeat_index: 0,
            worker_index: 0,
            attempt: 0,
            environment: &[env],
        };

        let requested: HashSet<String> = [id0].into_iter().collect();
        let mut events = Vec::new();
        runner.run(&file_suite, &requested, &mut |e| events.push(e)).await;

        let end = events
            .into_iter()
            .find_map(|e| match e {
                RuntimeEvent::TestEnd { result, .. } => Some(result),
                _ => None,
            })
            .unwrap();
        assert_eq!(end.status, Status::Failed);
        assert_eq!(end.error.unwrap().message, "nope");
    }
}
