//! Real worker processes, started with `tokio::process` and signalled with nix

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chorus_core::{ShardAssignment, WorkerExit};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{WorkerProcess, WorkerSpawner};
use crate::error::SupervisorError;

/// Spawns `chorus-worker` processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    binary: PathBuf,
    bus_url: String,
    config_path: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new(binary: PathBuf, bus_url: String, config_path: Option<PathBuf>) -> Self {
        Self {
            binary,
            bus_url,
            config_path,
        }
    }

    /// `chorus-worker` next to the running launcher binary.
    pub fn sibling_binary() -> std::io::Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "launcher has no parent dir")
        })?;
        Ok(dir.join("chorus-worker"))
    }

    fn command(&self, assignment: &ShardAssignment) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--cluster-id")
            .arg(assignment.cluster_id.to_string())
            .arg("--shard-count")
            .arg(assignment.total_shards.to_string())
            .arg("--shards")
            .arg(assignment.shard_list())
            .arg("--bus-url")
            .arg(&self.bus_url)
            .stdin(Stdio::null());

        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        command
    }
}

struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> std::io::Result<WorkerExit> {
        self.0.wait().await.map(WorkerExit::from)
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        assignment: &ShardAssignment,
    ) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let child = self
            .command(assignment)
            .spawn()
            .map_err(|cause| SupervisorError::Spawn {
                cluster_id: assignment.cluster_id,
                binary: self.binary.display().to_string(),
                cause,
            })?;

        Ok(Box::new(ChildProcess(child)))
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<(), SupervisorError> {
        let sig = Signal::try_from(signal).map_err(|_| SupervisorError::InvalidSignal { signal })?;
        kill(Pid::from_raw(pid as i32), sig).map_err(|errno| SupervisorError::Signal {
            pid,
            signal,
            cause: std::io::Error::from(errno),
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        matches!(
            kill(Pid::from_raw(pid as i32), None),
            Ok(()) | Err(Errno::EPERM)
        )
    }
}
