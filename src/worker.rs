//! Worker process entrypoint.
//!
//! Spawned by the dispatcher as `<exe> __worker <index>` (see
//! `dispatcher::pool::SelfExeWorkerCommand`). A worker shares no memory with
//! the dispatcher: it reads its assigned project's name off `Init`, reloads
//! the same configuration, rediscovers that project's suites through the
//! same [`TestSource`], and re-derives test identity with the same
//! deterministic formula the planner used, matching against the `test_ids`
//! a `Run` message asks it to execute.

pub mod environment;
pub mod runtime;

use std::collections::HashSet;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::ipc::{IpcError, MessageCodec, ParentMessage, WorkerMessage};
use crate::model::{FileSuite, Project, SerializedError};
use crate::source::TestSource;

use environment::Environment;
use runtime::{resolve_run_target, BucketRunner, RuntimeEvent};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("unknown project: {0}")]
    UnknownProject(String),
}

/// Drives one worker process until it receives `Stop` or its stdin closes.
pub async fn run(
    worker_index: usize,
    config: &RunnerConfig,
    source: &dyn TestSource,
    environment: Vec<Arc<dyn Environment>>,
) -> Result<(), WorkerError> {
    let mut reader = FramedRead::new(tokio::io::stdin(), MessageCodec::<ParentMessage>::default());
    let mut writer = FramedWrite::new(tokio::io::stdout(), MessageCodec::<WorkerMessage>::default());

    let (project_name, variation_hash) = match reader.next().await {
        Some(Ok(ParentMessage::Init { project_name, variation_hash, .. })) => {
            (project_name, variation_hash)
        }
        other => {
            warn!(worker_index, ?other, "did not receive an init message, exiting");
            return Ok(());
        }
    };

    let Some(project_config) = config.projects.get(&project_name) else {
        let error = SerializedError {
            message: format!("unknown project: {project_name}"),
            stack: None,
            value: None,
        };
        let _ = writer.send(WorkerMessage::InitError { error }).await;
        return Err(WorkerError::UnknownProject(project_name));
    };
    let project = Arc::new(project_config.to_project(&project_name, &config.runner));

    let file_suites = match source.discover(&project).await {
        Ok(suites) => suites,
        Err(e) => {
            let error = SerializedError { message: e.to_string(), stack: None, value: None };
            let _ = writer.send(WorkerMessage::InitError { error }).await;
            return Ok(());
        }
    };

    if let Err(e) = writer.send(WorkerMessage::Ready).await {
        error!(worker_index, "failed to send ready: {e}");
        return Err(e.into());
    }
    info!(worker_index, project = %project_name, "worker ready");

    loop {
        match reader.next().await {
            Some(Ok(ParentMessage::Run { bucket_id, test_ids, attempt })) => {
                run_bucket(
                    worker_index,
                    &project,
                    &file_suites,
                    &variation_hash,
                    bucket_id,
                    test_ids,
                    attempt,
                    &environment,
                    &mut writer,
                )
                .await;
            }
            Some(Ok(ParentMessage::Stop)) => {
                info!(worker_index, "received stop, shutting down");
                break;
            }
            Some(Ok(ParentMessage::Init { .. })) => {
                warn!(worker_index, "unexpected second init message, ignoring");
            }
            Some(Err(e)) => {
                error!(worker_index, "ipc read error: {e}");
                break;
            }
            None => break,
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_bucket(
    worker_index: usize,
    project: &Arc<Project>,
    file_suites: &[FileSuite],
    variation_hash: &str,
    bucket_id: String,
    test_ids: Vec<String>,
    attempt: usize,
    environment: &[Arc<dyn Environment>],
    writer: &mut FramedWrite<tokio::io::Stdout, MessageCodec<WorkerMessage>>,
) {
    let requested: HashSet<String> = test_ids.into_iter().collect();

    let Some((file_suite, variation, repeat_index)) =
        resolve_run_target(project, file_suites, variation_hash, &requested)
    else {
        let error = SerializedError {
            message: format!("no discovered suite matched bucket {bucket_id}'s test ids"),
            stack: None,
            value: None,
        };
        let _ = writer.send(WorkerMessage::TeardownError { bucket_id: bucket_id.clone(), error: error.clone() }).await;
        let _ = writer
            .send(WorkerMessage::Done {
                bucket_id,
                failed_test_id: None,
                fatal_error: Some(error),
                remaining: requested.into_iter().collect(),
            })
            .await;
        return;
    };

    let runner = BucketRunner {
        project,
        variation: &variation,
        repeat_index,
        worker_index,
        attempt,
        environment,
    };

    let mut events: Vec<WorkerMessage> = Vec::new();
    {
        let mut emit = |event: RuntimeEvent| {
            let msg = match event {
                RuntimeEvent::TestBegin { test_id } => WorkerMessage::TestBegin { test_id, attempt },
                RuntimeEvent::StdOut { test_id, chunk } => WorkerMessage::StdOut { test_id, chunk },
                RuntimeEvent::StdErr { test_id, chunk } => WorkerMessage::StdErr { test_id, chunk },
                RuntimeEvent::TestEnd { test_id, result } => WorkerMessage::TestEnd {
                    test_id,
                    attempt: result.attempt,
                    status: result.status,
                    duration_ms: result.duration.as_millis() as u64,
                    error: result.error.clone(),
                    data: result.data.clone(),
                },
                RuntimeEvent::TeardownError { error } => {
                    WorkerMessage::TeardownError { bucket_id: bucket_id.clone(), error }
                }
            };
            events.push(msg);
        };
        runner.run(file_suite, &requested, &mut emit).await;
    }

    for msg in events {
        if writer.send(msg).await.is_err() {
            return;
        }
    }

    let _ = writer
        .send(WorkerMessage::Done {
            bucket_id,
            failed_test_id: None,
            fatal_error: None,
            remaining: Vec::new(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ReportConfig, RunnerConfig, RunnerSettings};
    use crate::model::{Suite, SuiteChild, Spec, SpecOptions};
    use async_trait::async_trait;
    use std::collections::HashMap;

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

    struct StaticSource(Vec<FileSuite>);

    #[async_trait]
    impl TestSource for StaticSource {
        async fn discover(
            &self,
            project: &Arc<Project>,
        ) -> crate::source::SourceResult<Vec<FileSuite>> {
            Ok(self.0.iter().filter(|fs| Arc::ptr_eq(&fs.project, project)).cloned().collect())
        }
    }

    fn sample_config() -> RunnerConfig {
        let mut projects = HashMap::new();
        projects.insert(
            "default".to_string(),
            ProjectConfig {
                test_dir: "tests".into(),
                match_patterns: vec![],
                ignore_patterns: vec![],
                retries: 0,
                repeat_each: 1,
                timeout_secs: None,
                output_dir: "test-results".into(),
                snapshot_dir: "__snapshots__".into(),
                env: HashMap::new(),
                variations: vec![],
            },
        );
        RunnerConfig { runner: RunnerSettings::default(), projects, report: ReportConfig::default() }
    }

    #[test]
    fn sample_config_round_trips_into_a_project() {
        let config = sample_config();
        let project = config.projects["default"].to_project("default", &config.runner);
        assert_eq!(project.name, "default");
        assert_eq!(project.define.len(), 1);
    }

    #[tokio::test]
    async fn static_source_only_returns_suites_for_its_project() {
        let project = Arc::new(Project::new("default", "tests"));
        let mut root = Suite::new("root", "a.spec");
        root.children.push(SuiteChild::Spec(passing_spec("one")));
        let fs = FileSuite { project: project.clone(), file: "a.spec".into(), root };
        let source = StaticSource(vec![fs]);

        let found = source.discover(&project).await.unwrap();
        assert_eq!(found.len(), 1);

        let other = Arc::new(Project::new("other", "tests"));
        let found_other = source.discover(&other).await.unwrap();
        assert!(found_other.is_empty());
    }
}
