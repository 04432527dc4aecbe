//! Worker exit codes and the restart decision derived from them
//!
//! A worker's exit code is its only return channel to the launcher. The raw
//! status is converted into [`WorkerExit`] at the process boundary and
//! classified into an [`ExitAction`] by the supervision loop.

use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

/// Exit codes a worker process may deliberately use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum WorkerExitCode {
    /// Bring the whole fleet down
    KillEverything = 0,
    /// Respawn this cluster with the same shards
    RestartCluster = 1,
    /// Never restart this cluster (fatal for the fleet)
    DoNotRestartCluster = 2,
}

impl WorkerExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::KillEverything),
            1 => Some(Self::RestartCluster),
            2 => Some(Self::DoNotRestartCluster),
            _ => None,
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    /// Terminated by the given signal number
    Signal(i32),
    /// The OS reported neither a code nor a signal
    Unknown,
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::Unknown
    }
}

/// Signal numbers treated as an intentional external kill.
pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;

/// What the supervision loop does after a worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Stop supervising and shut the launcher down
    ShutdownFleet(WorkerExitCode),
    /// Respawn with the same assignment
    Respawn,
    /// Respawn, but the exit was not one of the known codes
    RespawnAnomaly,
    /// Killed from outside; stop supervising quietly
    Retire,
    /// No status available yet, wait and join again
    RetryJoin,
}

impl WorkerExit {
    pub fn classify(self) -> ExitAction {
        match self {
            Self::Code(code) => match WorkerExitCode::from_code(code) {
                Some(WorkerExitCode::RestartCluster) => ExitAction::Respawn,
                Some(fatal) => ExitAction::ShutdownFleet(fatal),
                None => ExitAction::RespawnAnomaly,
            },
            Self::Signal(SIGTERM | SIGINT | SIGKILL) => ExitAction::Retire,
            Self::Signal(_) => ExitAction::RespawnAnomaly,
            Self::Unknown => ExitAction::RetryJoin,
        }
    }
}
