//! # flotilla
//!
//! A parallel test runner core: plan a workload, dispatch it across a fleet
//! of long-lived worker processes, and report structured results as they
//! stream back.
//!
//! ## Overview
//!
//! flotilla owns the scheduling and execution machinery a test runner needs
//! once test *declaration* is someone else's problem: turning a set of
//! discovered suites into a [`planner::Plan`], handing that plan's buckets
//! to a pool of worker processes via [`dispatcher::Dispatcher`], and fanning
//! each per-test outcome out to one or more [`report::Reporter`]s.
//!
//! - **Deterministic planning** ([`planner`]): grep/only/shard filtering,
//!   bucketing by project x file x repeat index x variation, all pure and
//!   unit-testable without spawning anything.
//! - **Worker pool dispatch** ([`dispatcher`]): a capacity-limited pool of
//!   worker processes, retry rescheduling, crash recovery, SIGINT/global
//!   timeout/max-failures shutdown.
//! - **Framed IPC** ([`ipc`]): the JSON-over-length-delimited-frames wire
//!   protocol spoken between the dispatcher and each worker's stdin/stdout.
//! - **Worker runtime** ([`worker`]): the depth-first suite walk a worker
//!   process runs to execute its assigned bucket, composing `beforeAll`/
//!   `beforeEach`/`afterEach`/`afterAll` with an ambient [`worker::environment::Environment`].
//! - **Reporting** ([`report`]): the [`report::Reporter`] fan-out contract,
//!   plus [`report::ConsoleReporter`] and [`report::JUnitReporter`] shipped
//!   as ready-to-use implementations.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!  TestSource ──────▶│   planner   │───▶ Plan (tests + buckets)
//!  (discovery,       └─────────────┘
//!   pluggable)              │
//!                           ▼
//!                   ┌───────────────┐        IPC (ipc.rs)       ┌──────────────┐
//!                   │  Dispatcher   │◀─────────────────────────▶│ worker process│
//!                   │ (worker pool, │   ParentMessage::{Init,   │ (worker.rs,  │
//!                   │  retries)     │    Run, Stop}             │  runtime.rs) │
//!                   └───────┬───────┘   WorkerMessage::{Ready,  └──────────────┘
//!                           │            TestBegin, TestEnd, ...}
//!                           ▼
//!                   ┌───────────────┐
//!                   │   Reporter    │ (console, junit, ...)
//!                   └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flotilla::config::load_config;
//! use flotilla::dispatcher::Dispatcher;
//! use flotilla::dispatcher::pool::SelfExeWorkerCommand;
//! use flotilla::planner::{plan, PlanOptions};
//! use flotilla::report::{ConsoleReporter, MultiReporter};
//! use flotilla::source::Registry;
//! use flotilla::source::TestSource;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("flotilla.toml"))?;
//! let project_cfg = &config.projects["default"];
//! let project = Arc::new(project_cfg.to_project("default", &config.runner));
//!
//! let registry = Registry::new(); // a real TestSource discovers actual suites
//! let file_suites = registry.discover(&project).await?;
//!
//! let plan = plan(&file_suites, &PlanOptions::default())?;
//!
//! let reporter = Arc::new(MultiReporter::new().with_reporter(ConsoleReporter::new(false, false)));
//! let command = Arc::new(SelfExeWorkerCommand { exe: std::env::current_exe()? });
//! let dispatcher = Dispatcher::new(&config.runner, reporter, command);
//! let summary = dispatcher.run(plan).await;
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! ## Configuration
//!
//! flotilla is configured via TOML files. See [`config`] for the schema.

pub mod config;
pub mod dispatcher;
pub mod ipc;
pub mod model;
pub mod planner;
pub mod report;
pub mod source;
pub mod worker;

pub use config::{load_config, RunnerConfig};
pub use dispatcher::{Dispatcher, RunSummary, StopReason};
pub use model::{Project, Test, TestResult};
pub use planner::{plan, Plan, PlanOptions};
pub use report::{ConsoleReporter, JUnitReporter, MultiReporter, NullReporter, Reporter};
pub use source::TestSource;
