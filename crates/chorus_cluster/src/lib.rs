//! Chorus Cluster - the launcher process
//!
//! Starts one `chorus-worker` process per cluster of shards, keeps them
//! running according to their exit codes, talks to them over a WebSocket bus
//! and force-restarts clusters that stop answering pings.

pub mod bus;
pub mod error;
pub mod health;
pub mod launcher;
pub mod signals;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use bus::ClusterBus;
pub use error::{BusError, LauncherError, Result, SupervisorError};
pub use health::{HealthMonitor, HealthVerdict};
pub use launcher::ClusterLauncher;
pub use supervisor::{
    KillIntent, ProcessSpawner, Shutdown, ShutdownReason, WorkerHandle, WorkerProcess,
    WorkerSpawner, WorkerSupervisor,
};
