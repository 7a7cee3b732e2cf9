//! Worker process pool: spawns, tracks, and recycles worker processes.
//!
//! Grounded on the teacher's `orchestrator/pool.rs::SandboxPool` lifecycle
//! (`take_one`/`return_all`/`terminate_all`) and `provider/process.rs`'s
//! piped-stdio process mechanics, generalized from a pool of ephemeral
//! command sandboxes to a pool of long-lived worker processes that speak
//! the framed IPC protocol over their own stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::ipc::{IpcError, MessageCodec, ParentMessage, WorkerMessage};
use crate::model::Project;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("worker exited before becoming ready")]
    DiedBeforeReady,
}

/// Where a worker process should come from. Abstracted mainly so tests can
/// spawn a harmless stand-in instead of the real `flotilla` binary.
pub trait WorkerCommand: Send + Sync {
    fn build(&self, worker_index: usize) -> Command;
}

/// Spawns `<exe> __worker` — the hidden internal entrypoint `main.rs` wires
/// up to run [`crate::worker::run`].
pub struct SelfExeWorkerCommand {
    pub exe: std::path::PathBuf,
}

impl WorkerCommand for SelfExeWorkerCommand {
    fn build(&self, worker_index: usize) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("__worker").arg(worker_index.to_string());
        cmd
    }
}

pub enum WorkerState {
    Initializing,
    Idle,
    Assigned { bucket_id: String },
    Dead,
}

/// A live worker process plus its framed IPC halves.
pub struct WorkerProcess {
    pub index: usize,
    pub state: WorkerState,
    child: Child,
    writer: FramedWrite<tokio::process::ChildStdin, MessageCodec<ParentMessage>>,
    reader: FramedRead<tokio::process::ChildStdout, MessageCodec<WorkerMessage>>,
}

impl WorkerProcess {
    pub async fn spawn(
        index: usize,
        command: &dyn WorkerCommand,
        project: &Arc<Project>,
        variation_hash: &str,
    ) -> Result<Self, PoolError> {
        let mut cmd = command.build(index);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let mut writer = FramedWrite::new(stdin, MessageCodec::<ParentMessage>::default());
        let mut reader = FramedRead::new(stdout, MessageCodec::<WorkerMessage>::default());

        writer
            .send(ParentMessage::Init {
                worker_index: index,
                project_name: project.name.clone(),
                variation_hash: variation_hash.to_string(),
            })
            .await?;

        match reader.next().await {
            Some(Ok(WorkerMessage::Ready)) => {}
            Some(Ok(WorkerMessage::InitError { error })) => {
                warn!(worker = index, error = %error.message, "worker failed to initialize");
                return Err(PoolError::DiedBeforeReady);
            }
            _ => return Err(PoolError::DiedBeforeReady),
        }

        debug!(worker = index, "worker ready");

        Ok(Self { index, state: WorkerState::Idle, child, writer, reader })
    }

    pub async fn send(&mut self, msg: ParentMessage) -> Result<(), IpcError> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Option<Result<WorkerMessage, IpcError>> {
        self.reader.next().await
    }

    pub async fn terminate(&mut self) {
        let _ = self.send(ParentMessage::Stop).await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await;
        let _ = self.child.start_kill();
        self.state = WorkerState::Dead;
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, WorkerState::Dead)
    }
}

