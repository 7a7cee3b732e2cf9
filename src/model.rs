//! Core entity model.
//!
//! These are the immutable-after-construction records the planner and worker
//! runtime operate on: [`Project`], [`FileSuite`], [`Suite`], [`Spec`],
//! [`Test`], [`TestResult`], plus the mutable [`TestInfo`] passed into user
//! hooks and test bodies.
//!
//! # Ownership
//!
//! Projects and file suites are owned by the planner. `Test`s are reference
//! counted (`Arc`) so both the planner (identity) and the dispatcher
//! (scheduling queue) can hold them without lifetime gymnastics across the
//! parent/child process boundary. `TestInfo` is owned exclusively by the
//! worker running a given attempt.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A named run configuration. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Project {
    /// Project name, part of every test's bucket key.
    pub name: String,
    /// Root directory searched for test files.
    pub test_dir: PathBuf,
    /// Glob-style patterns a file must match to be considered.
    pub match_patterns: Vec<String>,
    /// Glob-style patterns that exclude an otherwise-matched file.
    pub ignore_patterns: Vec<String>,
    /// Number of retries allowed per test (`1 + retries` total attempts).
    pub retries: usize,
    /// Number of times each spec is repeated (each repetition is a distinct `Test`).
    pub repeat_each: usize,
    /// Default per-test timeout.
    pub timeout: Duration,
    /// Directory test output (files written via `TestInfo::output_path`) lands in.
    pub output_dir: PathBuf,
    /// Directory snapshots are compared/written against.
    pub snapshot_dir: PathBuf,
    /// Worker variations: each spec is instantiated once per entry.
    pub define: Vec<Variation>,
}

impl Project {
    /// A project with a single, empty (default) variation.
    pub fn new(name: impl Into<String>, test_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            test_dir: test_dir.into(),
            match_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            retries: 0,
            repeat_each: 1,
            timeout: Duration::from_secs(30),
            output_dir: PathBuf::from("test-results"),
            snapshot_dir: PathBuf::from("__snapshots__"),
            define: vec![Variation::default()],
        }
    }
}

/// A parameter bag attached to a project that causes each spec to produce
/// multiple `Test`s, one per variation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variation {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Variation {
    /// A short stable hash used as part of the bucket key and the test id.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.params.to_string().as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 10)
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{b:02x}"));
    }
    s.truncate(chars);
    s
}

/// An annotation attached to a suite, spec, or dynamically via `TestInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Annotation {
    /// Skip unconditionally, or when `condition` evaluates true.
    Skip { condition: bool, reason: Option<String> },
    /// Like `Skip`, but understood as "expected to be fixed later".
    Fixme { condition: bool, reason: Option<String> },
    /// The test is expected to fail.
    Fail { condition: bool, reason: Option<String> },
    /// Informational: flags a test as slow (widens its timeout in some configs).
    Slow { reason: Option<String> },
}

impl Annotation {
    fn is_active(&self) -> bool {
        match self {
            Annotation::Skip { condition, .. }
            | Annotation::Fixme { condition, .. }
            | Annotation::Fail { condition, .. } => *condition,
            Annotation::Slow { .. } => true,
        }
    }
}

/// The outcome that counts as success for a given test, derived once before
/// execution from ancestor annotations (spec.md §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedStatus {
    Passed,
    Failed,
    Skipped,
}

/// Computes the expected status from a test's full annotation chain
/// (ancestor suites outermost-first, then the spec itself).
pub fn compute_expected_status(annotations: &[Annotation]) -> ExpectedStatus {
    let skipped = annotations.iter().any(|a| {
        matches!(a, Annotation::Skip { .. } | Annotation::Fixme { .. }) && a.is_active()
    });
    if skipped {
        return ExpectedStatus::Skipped;
    }
    let failing = annotations
        .iter()
        .any(|a| matches!(a, Annotation::Fail { .. }) && a.is_active());
    if failing {
        return ExpectedStatus::Failed;
    }
    ExpectedStatus::Passed
}

/// Information about the worker process a `beforeAll`/`afterAll` hook runs in.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_index: usize,
    pub project: Arc<Project>,
}

/// A hook bound to worker scope: runs once per enclosing suite scope, per worker.
pub type WorkerHookFn =
    Arc<dyn Fn(WorkerInfo) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// A hook bound to test scope: runs once per test attempt.
pub type TestHookFn =
    Arc<dyn Fn(Arc<Mutex<TestInfo>>) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// The body of a spec: receives the environment-resolved argument bag and the
/// mutable `TestInfo` for this attempt.
pub type TestBodyFn = Arc<
    dyn Fn(Arc<Mutex<TestInfo>>, serde_json::Value) -> BoxFuture<'static, Result<(), BodyError>>
        + Send
        + Sync,
>;

/// Error raised by a hook (`beforeAll`/`afterAll`/`beforeEach`/`afterEach`).
#[derive(Debug, thiserror::Error, Clone)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
    pub stack: Option<String>,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stack: None }
    }
}

/// Error raised by a test body: either a regular failure or a skip marker
/// thrown mid-body (see worker runtime step 6).
#[derive(Debug, Clone)]
pub enum BodyError {
    Failed { message: String, stack: Option<String> },
    Skipped { reason: Option<String> },
}

/// Ordered hooks for a single suite scope.
#[derive(Default, Clone)]
pub struct Hooks {
    pub before_all: Vec<WorkerHookFn>,
    pub after_all: Vec<WorkerHookFn>,
    pub before_each: Vec<TestHookFn>,
    pub after_each: Vec<TestHookFn>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_all", &self.before_all.len())
            .field("after_all", &self.after_all.len())
            .field("before_each", &self.before_each.len())
            .field("after_each", &self.after_each.len())
            .finish()
    }
}

/// A suite: a titled group of child suites/specs sharing hooks and annotations.
///
/// A suite's `beforeEach`/`afterEach` applies to every descendant spec.
#[derive(Clone)]
pub struct Suite {
    pub title: String,
    pub file: PathBuf,
    pub children: Vec<SuiteChild>,
    pub hooks: Hooks,
    pub annotations: Vec<Annotation>,
    pub only: bool,
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("title", &self.title)
            .field("children", &self.children.len())
            .field("only", &self.only)
            .finish()
    }
}

impl Suite {
    pub fn new(title: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            file: file.into(),
            children: Vec::new(),
            hooks: Hooks::default(),
            annotations: Vec::new(),
            only: false,
        }
    }

    /// Returns `true` if this suite or any descendant is marked `only`.
    pub fn has_only_descendant(&self) -> bool {
        self.children.iter().any(|c| match c {
            SuiteChild::Suite(s) => s.only || s.has_only_descendant(),
            SuiteChild::Spec(s) => s.only,
        })
    }
}

/// A child of a `Suite`: either a nested suite or a leaf spec.
#[derive(Debug, Clone)]
pub enum SuiteChild {
    Suite(Suite),
    Spec(Spec),
}

/// The root suite for one test file under one project.
#[derive(Debug, Clone)]
pub struct FileSuite {
    pub project: Arc<Project>,
    pub file: PathBuf,
    pub root: Suite,
}

/// Options attached to a spec declaration.
#[derive(Debug, Clone, Default)]
pub struct SpecOptions {
    /// Overrides the project's default timeout for this spec, if set.
    pub timeout: Option<Duration>,
}

/// A single declared test case as written in source. Owns the test body;
/// the `Test`s scheduled from it (one per variation x repeat index) hold a
/// back-reference rather than being owned by the `Spec`, to avoid an
/// ownership cycle across the planner/dispatcher boundary (see DESIGN.md).
#[derive(Clone)]
pub struct Spec {
    pub title: String,
    pub file: PathBuf,
    pub line: u32,
    pub only: bool,
    pub annotations: Vec<Annotation>,
    pub body: TestBodyFn,
    pub options: SpecOptions,
}

impl std::fmt::Debug for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spec")
            .field("title", &self.title)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("only", &self.only)
            .finish()
    }
}

/// The full ancestor-qualified title used for `--grep` matching: ancestor
/// suite titles space-joined with the spec title.
pub fn full_title(ancestor_titles: &[&str], spec_title: &str) -> String {
    let mut parts: Vec<&str> = ancestor_titles.to_vec();
    parts.push(spec_title);
    parts.join(" ")
}

/// One scheduled execution of a spec under a specific variation and repeat
/// index — the unit the dispatcher schedules.
pub struct Test {
    /// Stable, unique id: derived from file path + ordinal within file +
    /// variation string + repeat index.
    pub id: String,
    pub project: Arc<Project>,
    pub file: PathBuf,
    pub title: String,
    pub variation: Variation,
    pub repeat_index: usize,
    pub expected_status: ExpectedStatus,
    pub timeout: Duration,
    pub annotations: Vec<Annotation>,
    pub body: TestBodyFn,
    results: Mutex<Vec<TestResult>>,
}

impl std::fmt::Debug for Test {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Test")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("expected_status", &self.expected_status)
            .field("attempts", &self.attempt_count())
            .finish()
    }
}

impl Test {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: Arc<Project>,
        file: PathBuf,
        ordinal: usize,
        title: String,
        variation: Variation,
        repeat_index: usize,
        annotations: Vec<Annotation>,
        timeout: Duration,
        body: TestBodyFn,
    ) -> Self {
        let expected_status = compute_expected_status(&annotations);
        let id = compute_test_id(&project.name, &file, ordinal, &variation, repeat_index);
        Self {
            id,
            project,
            file,
            title,
            variation,
            repeat_index,
            expected_status,
            timeout,
            annotations,
            body,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Maximum attempts this test may be scheduled for: `1 + retries`.
    pub fn max_attempts(&self) -> usize {
        1 + self.project.retries
    }

    pub fn record_result(&self, result: TestResult) {
        self.results.lock().unwrap().push(result);
    }

    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Whether another attempt should be scheduled: the previous attempt
    /// failed or timed out, the expected status is `Passed`, and attempts
    /// remain (spec.md §3 invariant).
    pub fn should_retry(&self) -> bool {
        if self.expected_status != ExpectedStatus::Passed {
            return false;
        }
        let results = self.results.lock().unwrap();
        if results.len() >= self.max_attempts() {
            return false;
        }
        matches!(
            results.last().map(|r| r.status),
            Some(Status::Failed) | Some(Status::TimedOut)
        )
    }

    /// Final status this test should be reported with: the last result if
    /// any attempts ran, else `None`.
    pub fn final_result(&self) -> Option<TestResult> {
        self.results.lock().unwrap().last().cloned()
    }

    /// `true` if this test failed an attempt before eventually passing.
    pub fn is_flaky(&self) -> bool {
        let results = self.results.lock().unwrap();
        let last_passed = matches!(results.last().map(|r| r.status), Some(Status::Passed));
        last_passed && results.len() > 1
    }
}

pub(crate) fn compute_test_id(
    project: &str,
    file: &Path,
    ordinal: usize,
    variation: &Variation,
    repeat_index: usize,
) -> String {
    let mut hasher = DefaultHasher::new();
    project.hash(&mut hasher);
    file.hash(&mut hasher);
    ordinal.hash(&mut hasher);
    variation.hash().hash(&mut hasher);
    repeat_index.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Final status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// A serialized error, sendable across the parent/child IPC boundary.
/// `value` is populated when a non-exception (non-string) throw occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    pub stack: Option<String>,
    pub value: Option<serde_json::Value>,
}

impl From<HookError> for SerializedError {
    fn from(e: HookError) -> Self {
        Self { message: e.message, stack: e.stack, value: None }
    }
}

impl From<BodyError> for SerializedError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Failed { message, stack } => Self { message, stack, value: None },
            BodyError::Skipped { reason } => Self {
                message: reason.unwrap_or_else(|| "skipped".to_string()),
                stack: None,
                value: None,
            },
        }
    }
}

/// The result of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub attempt: usize,
    pub worker_index: usize,
    pub duration: Duration,
    pub status: Status,
    pub error: Option<SerializedError>,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TestResult {
    pub fn new(attempt: usize, worker_index: usize, status: Status) -> Self {
        Self {
            attempt,
            worker_index,
            duration: Duration::ZERO,
            status,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_duration(mut self, d: Duration) -> Self {
        self.duration = d;
        self
    }

    pub fn with_error(mut self, e: impl Into<SerializedError>) -> Self {
        self.error = Some(e.into());
        self
    }

    pub fn with_output(mut self, stdout: Vec<String>, stderr: Vec<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Mutable scratch passed into user hooks and test bodies. Created
/// immediately before `beforeEach`, discarded after `afterEach` and
/// environment `afterEach` complete (spec.md §3).
#[derive(Debug, Clone)]
pub struct TestInfo {
    pub test_id: String,
    pub title: String,
    pub project_name: String,
    pub worker_index: usize,
    pub attempt: usize,
    pub repeat_index: usize,
    pub expected_status: ExpectedStatus,
    pub timeout: Duration,
    pub annotations: Vec<Annotation>,
    output_dir: PathBuf,
    snapshot_dir: PathBuf,
    file_stem: String,
    spec_title_sanitized: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl TestInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test: &Test,
        attempt: usize,
        worker_index: usize,
    ) -> Self {
        let file_stem = test
            .file
            .with_extension("")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        Self {
            test_id: test.id.clone(),
            title: test.title.clone(),
            project_name: test.project.name.clone(),
            worker_index,
            attempt,
            repeat_index: test.repeat_index,
            expected_status: test.expected_status,
            timeout: test.timeout,
            annotations: test.annotations.clone(),
            output_dir: test.project.output_dir.clone(),
            snapshot_dir: test.project.snapshot_dir.clone(),
            file_stem,
            spec_title_sanitized: sanitize_title(&test.title),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Captures a chunk of this test's stdout (spec.md §4.3: "each write is
    /// captured ... and forwarded as a `stdOut` event"). Test bodies and
    /// hooks call this directly rather than writing to the process's real
    /// stdout, which the worker's IPC transport already owns.
    pub fn log_stdout(&mut self, chunk: impl Into<String>) {
        self.stdout.push(chunk.into());
    }

    pub fn log_stderr(&mut self, chunk: impl Into<String>) {
        self.stderr.push(chunk.into());
    }

    pub fn take_stdout(&mut self) -> Vec<String> {
        std::mem::take(&mut self.stdout)
    }

    pub fn take_stderr(&mut self) -> Vec<String> {
        std::mem::take(&mut self.stderr)
    }

    /// A directory unique across attempts and repeats for this test, per
    /// the template in spec.md §4.3. Lazily created by the caller.
    pub fn output_path(&self) -> PathBuf {
        let mut name = self.spec_title_sanitized.clone();
        if self.attempt > 0 {
            name.push_str(&format!("-retry{}", self.attempt));
        }
        if self.repeat_index > 0 {
            name.push_str(&format!("-repeat{}", self.repeat_index));
        }
        self.output_dir.join(&self.file_stem).join(name)
    }

    /// A snapshot directory shared across attempts and repeats (no retry or
    /// repeat suffix, per spec.md §4.3).
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir
            .join(&self.file_stem)
            .join(&self.spec_title_sanitized)
    }

    /// Dynamically annotate this attempt. Mirrors the static annotations a
    /// suite/spec can carry, but set from within a hook or test body.
    pub fn annotate(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
        self.expected_status = compute_expected_status(&self.annotations);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_stub() -> TestBodyFn {
        Arc::new(|_info, _args| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn expected_status_defaults_to_passed() {
        assert_eq!(compute_expected_status(&[]), ExpectedStatus::Passed);
    }

    #[test]
    fn skip_wins_over_fail() {
        let annotations = vec![
            Annotation::Fail { condition: true, reason: None },
            Annotation::Skip { condition: true, reason: None },
        ];
        assert_eq!(compute_expected_status(&annotations), ExpectedStatus::Skipped);
    }

    #[test]
    fn inactive_annotation_does_not_apply() {
        let annotations = vec![Annotation::Skip { condition: false, reason: None }];
        assert_eq!(compute_expected_status(&annotations), ExpectedStatus::Passed);
    }

    #[test]
    fn test_id_is_stable_given_identical_inputs() {
        let project = Arc::new(Project::new("default", "tests"));
        let a = Test::new(
            project.clone(),
            PathBuf::from("a.spec"),
            0,
            "does a thing".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        let b = Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            "does a thing".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_id_differs_by_ordinal() {
        let project = Arc::new(Project::new("default", "tests"));
        let a = Test::new(
            project.clone(),
            PathBuf::from("a.spec"),
            0,
            "t".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        let b = Test::new(
            project,
            PathBuf::from("a.spec"),
            1,
            "t".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn should_retry_only_after_failure_when_expecting_pass() {
        let project = Arc::new(Project {
            retries: 2,
            ..Project::new("default", "tests")
        });
        let test = Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            "t".into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        assert!(!test.should_retry());
        test.record_result(TestResult::new(0, 0, Status::Failed));
        assert!(test.should_retry());
        test.record_result(TestResult::new(1, 0, Status::Passed));
        assert!(!test.should_retry());
        assert!(test.is_flaky());
    }

    #[test]
    fn expected_failure_does_not_retry() {
        let project = Arc::new(Project { retries: 3, ..Project::new("default", "tests") });
        let test = Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            "t".into(),
            Variation::default(),
            0,
            vec![Annotation::Fail { condition: true, reason: None }],
            Duration::from_secs(1),
            body_stub(),
        );
        test.record_result(TestResult::new(0, 0, Status::Failed));
        assert!(!test.should_retry());
    }

    #[test]
    fn output_path_includes_retry_and_repeat_suffixes() {
        let project = Arc::new(Project::new("default", "tests"));
        let test = Test::new(
            project,
            PathBuf::from("dir/a.spec"),
            0,
            "does a thing".into(),
            Variation::default(),
            2,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        let info = TestInfo::new(&test, 1, 0);
        let path = info.output_path();
        let s = path.to_string_lossy();
        assert!(s.contains("-retry1"));
        assert!(s.contains("-repeat2"));
    }

    #[test]
    fn snapshot_path_excludes_retry_and_repeat_suffixes() {
        let project = Arc::new(Project::new("default", "tests"));
        let test = Test::new(
            project,
            PathBuf::from("dir/a.spec"),
            0,
            "does a thing".into(),
            Variation::default(),
            2,
            vec![],
            Duration::from_secs(1),
            body_stub(),
        );
        let info = TestInfo::new(&test, 1, 0);
        let path = info.snapshot_path();
        let s = path.to_string_lossy();
        assert!(!s.contains("-retry"));
        assert!(!s.contains("-repeat"));
    }
}
