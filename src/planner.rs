//! The planner: turns discovered suites into an ordered, bucketed list of
//! `Test`s. Pure — no IO, no process spawning — so it is fully unit
//! testable without a real worker pool, mirroring the teacher's
//! `orchestrator/scheduler.rs::Scheduler`.
//!
//! Pipeline (spec.md §4.1):
//! 1. flatten each project's suite tree into `Test`s (one per spec x
//!    variation x repeat index)
//! 2. apply `--grep` against each test's full title
//! 3. apply only/forbid-only filtering
//! 4. bucket by `(project, file, repeat_index, variation_hash)`
//! 5. slice buckets by shard

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::model::{FileSuite, Project, Suite, SuiteChild, Test};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("invalid --grep pattern: {0}")]
    InvalidGrep(#[from] regex::Error),
    #[error("--forbid-only is set and at least one test is marked only: {0}")]
    ForbidOnly(String),
    #[error("invalid shard: current={current} total={total} (current must be in 1..=total)")]
    InvalidShard { current: usize, total: usize },
}

/// A bucket is the unit the dispatcher hands to a single worker: every test
/// in it shares a `beforeAll` scope and runs depth-first in one process.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: BucketKey,
    pub tests: Vec<Arc<Test>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BucketKey {
    pub project: String,
    pub file: String,
    pub repeat_index: usize,
    pub variation_hash: String,
}

pub struct PlanOptions {
    pub grep: Option<String>,
    pub forbid_only: bool,
    pub shard: Option<(usize, usize)>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { grep: None, forbid_only: false, shard: None }
    }
}

/// A fully planned run: the ordered list of tests and the buckets they've
/// been grouped into, in dispatch order.
#[derive(Debug)]
pub struct Plan {
    pub tests: Vec<Arc<Test>>,
    pub buckets: Vec<Bucket>,
}

/// Builds a [`Plan`] from discovered file suites.
pub fn plan(file_suites: &[FileSuite], options: &PlanOptions) -> Result<Plan, PlannerError> {
    let only_active = file_suites.iter().any(|fs| suite_has_only(&fs.root));
    if options.forbid_only && only_active {
        let offender = file_suites
            .iter()
            .find(|fs| suite_has_only(&fs.root))
            .map(|fs| fs.file.display().to_string())
            .unwrap_or_default();
        return Err(PlannerError::ForbidOnly(offender));
    }

    let grep_re = options.grep.as_deref().map(Regex::new).transpose()?;

    let mut all_tests = Vec::new();
    for file_suite in file_suites {
        flatten_file_suite(file_suite, only_active, &mut all_tests);
    }

    if let Some(re) = &grep_re {
        all_tests.retain(|t| re.is_match(&t.title));
    }

    // spec.md §4.1 steps 6-8: concatenate, THEN shard the flat ordered list
    // into contiguous as-equal-as-possible chunks, THEN bucket only the
    // surviving tests. Bucketing before sharding would split or balance
    // shards at bucket granularity instead of the literal contiguous slice
    // of the test list the spec's boundary scenario demands (12 tests,
    // shard 2/3 -> tests 5..8 / zero-based 4..7).
    if let Some((current, total)) = options.shard {
        if total == 0 || current == 0 || current > total {
            return Err(PlannerError::InvalidShard { current, total });
        }
        all_tests = shard_slice(all_tests, current, total);
    }

    let mut buckets: BTreeMap<BucketKey, Vec<Arc<Test>>> = BTreeMap::new();
    for test in &all_tests {
        let key = BucketKey {
            project: test.project.name.clone(),
            file: test.file.to_string_lossy().into_owned(),
            repeat_index: test.repeat_index,
            variation_hash: test.variation.hash(),
        };
        buckets.entry(key).or_default().push(test.clone());
    }

    let buckets: Vec<Bucket> = buckets
        .into_iter()
        .map(|(key, tests)| Bucket { key, tests })
        .collect();

    let tests = all_tests;

    Ok(Plan { tests, buckets })
}

/// Slices `tests` into `total` contiguous, as-equal-as-possible chunks and
/// returns the one-based `current` chunk. Sizes differ by at most one test;
/// the first `n % total` chunks get the larger size, matching the
/// distribution used by the boundary scenario in spec.md §8.
fn shard_slice(tests: Vec<Arc<Test>>, current: usize, total: usize) -> Vec<Arc<Test>> {
    let n = tests.len();
    let base = n / total;
    let remainder = n % total;
    let mut start = 0;
    for shard_index in 0..total {
        let size = base + if shard_index < remainder { 1 } else { 0 };
        let end = start + size;
        if shard_index + 1 == current {
            return tests[start..end].to_vec();
        }
        start = end;
    }
    Vec::new()
}

fn suite_has_only(suite: &Suite) -> bool {
    suite.only || suite.has_only_descendant()
}

fn flatten_file_suite(file_suite: &FileSuite, only_active: bool, out: &mut Vec<Arc<Test>>) {
    let mut ordinal = 0usize;
    walk_suite(
        &file_suite.project,
        &file_suite.file,
        &file_suite.root,
        &[],
        &[],
        only_active,
        file_suite.root.only,
        &mut ordinal,
        out,
    );
}

#[allow(clippy::too_many_arguments)]
fn walk_suite(
    project: &Arc<Project>,
    file: &std::path::Path,
    suite: &Suite,
    ancestor_titles: &[&str],
    ancestor_annotations: &[crate::model::Annotation],
    only_active: bool,
    inherited_only: bool,
    ordinal: &mut usize,
    out: &mut Vec<Arc<Test>>,
) {
    let mut titles = ancestor_titles.to_vec();
    titles.push(&suite.title);

    let mut annotations = ancestor_annotations.to_vec();
    annotations.extend(suite.annotations.iter().cloned());

    for child in &suite.children {
        match child {
            SuiteChild::Suite(nested) => {
                walk_suite(
                    project,
                    file,
                    nested,
                    &titles,
                    &annotations,
                    only_active,
                    inherited_only || nested.only,
                    ordinal,
                    out,
                );
            }
            SuiteChild::Spec(spec) => {
                if only_active && !spec.only && !inherited_only {
                    *ordinal += 1;
                    continue;
                }
                let full_title = crate::model::full_title(&titles, &spec.title);
                let mut spec_annotations = annotations.clone();
                spec_annotations.extend(spec.annotations.iter().cloned());
                for variation in &project.define {
                    for repeat_index in 0..project.repeat_each {
                        let timeout = spec.options.timeout.unwrap_or(project.timeout);
                        let test = Test::new(
                            project.clone(),
                            file.to_path_buf(),
                            *ordinal,
                            full_title.clone(),
                            variation.clone(),
                            repeat_index,
                            spec_annotations.clone(),
                            timeout,
                            spec.body.clone(),
                        );
                        out.push(Arc::new(test));
                    }
                }
                *ordinal += 1;
            }
        }
    }
}

/// Formats a plan for `--list`/collect-only output: one line per test.
pub fn format_list(plan: &Plan) -> String {
    let mut out = String::new();
    for test in &plan.tests {
        out.push_str(&format!(
            "{}  [{}] {} ({:?})\n",
            test.id, test.project.name, test.title, test.expected_status
        ));
    }
    out
}
