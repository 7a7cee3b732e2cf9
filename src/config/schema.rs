//! Configuration schema definitions for flotilla.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema overview
//!
//! ```text
//! RunnerConfig (root)
//! ├── RunnerSettings          - workers, timeouts, retries, repeat-each
//! ├── Projects                - named projects (HashMap<String, ProjectConfig>)
//! └── ReportConfig            - output directory and reporter selection
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{Project, Variation};

/// Root configuration structure for flotilla.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Core runner settings.
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Named projects. Each spec discovered under a project's `test_dir`
    /// produces one `Test` per project x variation x repeat-index.
    pub projects: HashMap<String, ProjectConfig>,

    /// Reporting configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core runner settings: worker pool size, global deadline, failure policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerSettings {
    /// Maximum number of worker processes running in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default per-test timeout in seconds, overridable per project.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Wall-clock budget for the whole run, in seconds. `None` means no
    /// global deadline.
    pub global_timeout_secs: Option<u64>,

    /// Abort the run after this many test failures. `None` means unlimited.
    pub max_failures: Option<usize>,

    /// Fail the run immediately (before scheduling anything) if any spec
    /// carries an active `only` annotation.
    #[serde(default)]
    pub forbid_only: bool,

    /// `--grep`-style filter applied to each test's full title.
    pub grep: Option<String>,

    /// Shard selection: `(current, total)`, both 1-indexed.
    pub shard: Option<(usize, usize)>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            test_timeout_secs: default_test_timeout(),
            global_timeout_secs: None,
            max_failures: None,
            forbid_only: false,
            grep: None,
            shard: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_test_timeout() -> u64 {
    30
}

/// Configuration for a single project.
///
/// # Example
///
/// ```toml
/// [projects.default]
/// test_dir = "tests"
/// retries = 2
/// repeat_each = 1
///
/// [projects.default.env]
/// RUST_LOG = "debug"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Root directory searched for test files.
    pub test_dir: PathBuf,

    /// Glob-style patterns a file must match to be discovered. Default
    /// matches everything under `test_dir`.
    #[serde(default)]
    pub match_patterns: Vec<String>,

    /// Glob-style patterns that exclude an otherwise-matched file.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Number of retries allowed per test (`1 + retries` total attempts).
    /// Overrides `runner.test_timeout_secs`'s sibling retry default of 0.
    #[serde(default)]
    pub retries: usize,

    /// Number of times each spec is repeated.
    #[serde(default = "default_repeat_each")]
    pub repeat_each: usize,

    /// Per-test timeout override; falls back to `runner.test_timeout_secs`.
    pub timeout_secs: Option<u64>,

    /// Directory per-test output is written under.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Directory snapshots are compared/written against.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Environment variables merged into every worker running this
    /// project's tests. Supports `${VAR}` / `${VAR:-default}` expansion.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Named parameter sets: each spec under this project is instantiated
    /// once per entry (worker "variations" in spec.md's terminology). A
    /// project with no entries gets a single unnamed default variation.
    #[serde(default)]
    pub variations: Vec<VariationConfig>,
}

fn default_repeat_each() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("__snapshots__")
}

impl ProjectConfig {
    /// Builds the runtime [`Project`] this config describes. Both the
    /// planning side (discovery + `plan()`) and a worker process
    /// independently reconstructing its assigned project call this, so a
    /// worker started fresh in its own process sees an identical `Project`
    /// to the one the dispatcher planned against.
    pub fn to_project(&self, name: &str, runner: &RunnerSettings) -> Project {
        let timeout = Duration::from_secs(self.timeout_secs.unwrap_or(runner.test_timeout_secs));
        let define = if self.variations.is_empty() {
            vec![Variation::default()]
        } else {
            self.variations
                .iter()
                .map(|v| Variation { name: v.name.clone(), params: v.params.clone() })
                .collect()
        };
        Project {
            name: name.to_string(),
            test_dir: self.test_dir.clone(),
            match_patterns: self.match_patterns.clone(),
            ignore_patterns: self.ignore_patterns.clone(),
            retries: self.retries,
            repeat_each: self.repeat_each.max(1),
            timeout,
            output_dir: self.output_dir.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
            define,
        }
    }
}

/// One entry of `projects.<name>.variations`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariationConfig {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Reporting configuration.
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "test-results"
/// reporters = ["console", "junit"]
/// junit_file = "junit.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory report artifacts (e.g. the JUnit file) are written under.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Reporter names to fan results out to. Recognized: `"console"`,
    /// `"junit"`, `"null"`. Unknown names are a config error at startup.
    #[serde(default = "default_reporters")]
    pub reporters: Vec<String>,

    /// Filename for JUnit XML output, relative to `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Suppress per-test console lines, printing only the summary.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            reporters: default_reporters(),
            junit_file: default_junit_file(),
            quiet: false,
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_reporters() -> Vec<String> {
    vec!["console".to_string()]
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            [projects.default]
            test_dir = "tests"
        "#;
        let config: RunnerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.runner.test_timeout_secs, 30);
        assert!(!config.runner.forbid_only);
        assert_eq!(config.projects["default"].repeat_each, 1);
        assert_eq!(config.report.reporters, vec!["console".to_string()]);
    }

    #[test]
    fn shard_parses_as_tuple() {
        let toml = r#"
            [runner]
            shard = [2, 4]

            [projects.default]
            test_dir = "tests"
        "#;
        let config: RunnerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.runner.shard, Some((2, 4)));
    }

    #[test]
    fn to_project_falls_back_to_runner_timeout() {
        let toml = r#"
            [runner]
            test_timeout_secs = 45

            [projects.default]
            test_dir = "tests"
        "#;
        let config: RunnerConfig = toml::from_str(toml).unwrap();
        let project = config.projects["default"].to_project("default", &config.runner);
        assert_eq!(project.timeout, Duration::from_secs(45));
        assert_eq!(project.define.len(), 1);
    }

    #[test]
    fn project_with_variations_parses() {
        let toml = r#"
            [projects.default]
            test_dir = "tests"

            [[projects.default.variations]]
            name = "chromium"

            [[projects.default.variations]]
            name = "firefox"
        "#;
        let config: RunnerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.projects["default"].variations.len(), 2);
    }
}
