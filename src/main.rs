//! flotilla CLI - parallel test runner scheduling core.
//!
//! Test declaration and discovery are external collaborators (see
//! `source::TestSource`); this binary ships with no real filesystem scanner,
//! only the in-process `source::Registry` used by the crate's own tests.
//! Embedding `flotilla` as a library and supplying a real `TestSource` is
//! the intended way to get a working `run`/`list`; run unmodified, those
//! commands operate against an empty registry. The `__worker` subcommand
//! is the one genuinely load-bearing piece of this binary: it's what
//! `dispatcher::pool::SelfExeWorkerCommand` re-execs into.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use flotilla::config::{self, RunnerConfig};
use flotilla::dispatcher::pool::SelfExeWorkerCommand;
use flotilla::dispatcher::Dispatcher;
use flotilla::planner::{plan, PlanOptions};
use flotilla::report::{ConsoleReporter, JUnitReporter, MultiReporter, Reporter};
use flotilla::source::{Registry, TestSource};
use flotilla::worker;
use flotilla::worker::environment::NullEnvironment;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Parallel test runner scheduling core", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path. Defaults to `./flotilla.toml` if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output (debug-level logging).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and dispatch the configured workload.
    Run(RunArgs),

    /// Plan the workload and print it without spawning any workers.
    List(RunArgs),

    /// Load and schema-check a configuration file.
    Validate,

    /// Internal worker entrypoint. Not meant to be invoked directly: the
    /// dispatcher re-execs the current binary with this subcommand to spawn
    /// a worker process.
    #[command(hide = true, name = "__worker")]
    Worker {
        /// Index assigned to this worker by the dispatcher.
        index: usize,
    },
}

#[derive(Parser)]
struct RunArgs {
    /// Maximum number of worker processes running in parallel.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of retries allowed per test.
    #[arg(long)]
    retries: Option<usize>,

    /// Number of times each spec is repeated.
    #[arg(long)]
    repeat_each: Option<usize>,

    /// Per-test timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long)]
    global_timeout: Option<u64>,

    /// Filter applied to each test's full title.
    #[arg(long)]
    grep: Option<String>,

    /// Shard selection, formatted `current/total` (both 1-indexed).
    #[arg(long, value_parser = parse_shard)]
    shard: Option<(usize, usize)>,

    /// Restrict the run to a single configured project.
    #[arg(long)]
    project: Option<String>,

    /// Fail fast if any spec carries an active `only` annotation.
    #[arg(long)]
    forbid_only: bool,

    /// Abort the run after this many test failures.
    #[arg(long)]
    max_failures: Option<usize>,

    /// Reporter names to use, overriding the config file's `report.reporters`.
    #[arg(long)]
    reporter: Vec<String>,

    /// Directory report artifacts are written under, overriding the config
    /// file's `report.output_dir`.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Suppress per-test console lines.
    #[arg(long)]
    quiet: bool,
}

fn parse_shard(s: &str) -> Result<(usize, usize), String> {
    let (current, total) = s
        .split_once('/')
        .ok_or_else(|| format!("invalid --shard '{s}', expected current/total"))?;
    let current: usize = current.parse().map_err(|_| format!("invalid shard current: {current}"))?;
    let total: usize = total.parse().map_err(|_| format!("invalid shard total: {total}"))?;
    Ok((current, total))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber =
        FmtSubscriber::builder().with_max_level(log_level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run(&cli.config, args, false).await,
        Commands::List(args) => run(&cli.config, args, true).await,
        Commands::Validate => validate(&cli.config),
        Commands::Worker { index } => run_worker(index).await,
    }
}

fn resolve_config_path(config: &Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = config {
        return Ok(path.clone());
    }
    config::discover_config().ok_or_else(|| anyhow!("no --config given and flotilla.toml not found in the current directory"))
}

fn apply_overrides(config: &mut RunnerConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.runner.workers = workers;
    }
    if args.global_timeout.is_some() {
        config.runner.global_timeout_secs = args.global_timeout;
    }
    if args.max_failures.is_some() {
        config.runner.max_failures = args.max_failures;
    }
    if args.forbid_only {
        config.runner.forbid_only = true;
    }
    if args.grep.is_some() {
        config.runner.grep = args.grep.clone();
    }
    if args.shard.is_some() {
        config.runner.shard = args.shard;
    }
    if !args.reporter.is_empty() {
        config.report.reporters = args.reporter.clone();
    }
    if let Some(output) = &args.output {
        config.report.output_dir = output.clone();
    }
    if args.quiet {
        config.report.quiet = true;
    }
    for project in config.projects.values_mut() {
        if let Some(retries) = args.retries {
            project.retries = retries;
        }
        if let Some(repeat_each) = args.repeat_each {
            project.repeat_each = repeat_each;
        }
        if let Some(timeout) = args.timeout {
            project.timeout_secs = Some(timeout);
        }
    }
}

async fn run(config_path: &Option<PathBuf>, args: RunArgs, list_only: bool) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let mut config = config::load_config(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    apply_overrides(&mut config, &args);
    config::validate_reporters(&config.report.reporters)
        .context("invalid --reporter override")?;
    info!(path = %path.display(), "loaded configuration");

    let source = Registry::new();

    let mut all_file_suites = Vec::new();
    for (name, project_config) in &config.projects {
        if let Some(only) = &args.project {
            if name != only {
                continue;
            }
        }
        let project = Arc::new(project_config.to_project(name, &config.runner));
        let suites = source
            .discover(&project)
            .await
            .with_context(|| format!("discovery failed for project '{name}'"))?;
        all_file_suites.extend(suites);
    }

    let options = PlanOptions {
        grep: config.runner.grep.clone(),
        forbid_only: config.runner.forbid_only,
        shard: config.runner.shard,
    };
    let built_plan = plan(&all_file_suites, &options)
        .map_err(|e| anyhow!("{e}"))
        .context("planning failed")?;

    if list_only {
        for bucket in &built_plan.buckets {
            println!(
                "{}::{} (repeat {})",
                bucket.key.project, bucket.key.file, bucket.key.repeat_index
            );
            for test in &bucket.tests {
                println!("  {} [{:?}] {}", test.id, test.expected_status, test.title);
            }
        }
        println!("{} tests in {} buckets", built_plan.tests.len(), built_plan.buckets.len());
        return Ok(());
    }

    let reporter = build_reporter(&config);
    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    let command = Arc::new(SelfExeWorkerCommand { exe });

    let dispatcher = Dispatcher::new(&config.runner, reporter, command);
    let summary = dispatcher.run(built_plan).await;

    info!(
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        timed_out = summary.timed_out,
        flaky = summary.flaky,
        "run complete"
    );

    std::process::exit(summary.exit_code());
}

fn build_reporter(config: &RunnerConfig) -> Arc<dyn Reporter> {
    let mut multi = MultiReporter::new();
    for name in &config.report.reporters {
        multi = match name.as_str() {
            "console" => multi.with_reporter(ConsoleReporter::new(false, config.report.quiet)),
            "junit" => {
                let path = config.report.output_dir.join(&config.report.junit_file);
                multi.with_reporter(JUnitReporter::new(path, "flotilla"))
            }
            "null" => multi,
            // Config loading rejects unknown reporter names before this
            // ever runs (config.rs::validate_reporters).
            other => unreachable!("unvalidated reporter name reached build_reporter: {other}"),
        };
    }
    Arc::new(multi)
}

fn validate(config_path: &Option<PathBuf>) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    match config::load_config(&path) {
        Ok(config) => {
            println!("configuration is valid");
            println!();
            println!("workers: {}", config.runner.workers);
            println!("test timeout: {}s", config.runner.test_timeout_secs);
            for (name, project) in &config.projects {
                println!(
                    "project '{name}': test_dir={} retries={} repeat_each={}",
                    project.test_dir.display(),
                    project.retries,
                    project.repeat_each
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_worker(index: usize) -> Result<()> {
    let path = config::discover_config()
        .ok_or_else(|| anyhow!("flotilla.toml not found in the current directory"))?;
    let config = config::load_config(&path)
        .with_context(|| format!("worker {index} failed to load config from {}", path.display()))?;
    let source = Registry::new();
    let environment: Vec<Arc<dyn flotilla::worker::environment::Environment>> =
        vec![Arc::new(NullEnvironment)];

    worker::run(index, &config, &source, environment).await.map_err(|e| anyhow!(e))
}
