use std::time::Duration;

use chorus_core::protocol::ProtocolError;
use chorus_core::{ClusterId, CoreError};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum SupervisorError {
    #[error("Failed to start worker for cluster {cluster_id}")]
    #[diagnostic(
        code(chorus_cluster::supervisor::spawn),
        help("Check that the worker binary at {binary} exists and is executable")
    )]
    Spawn {
        cluster_id: ClusterId,
        binary: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("Cluster {cluster_id} is not running")]
    #[diagnostic(code(chorus_cluster::supervisor::not_running))]
    NotRunning { cluster_id: ClusterId },

    #[error("Failed to deliver signal {signal} to pid {pid}")]
    #[diagnostic(code(chorus_cluster::supervisor::signal))]
    Signal {
        pid: u32,
        signal: i32,
        #[source]
        cause: std::io::Error,
    },

    #[error("Signal number {signal} is not supported")]
    #[diagnostic(
        code(chorus_cluster::supervisor::invalid_signal),
        help("Use a standard POSIX signal number such as 15 (SIGTERM) or 9 (SIGKILL)")
    )]
    InvalidSignal { signal: i32 },
}

#[derive(Error, Diagnostic, Debug)]
pub enum BusError {
    #[error("No connection for cluster {cluster_id}")]
    #[diagnostic(
        code(chorus_cluster::bus::not_connected),
        help("The worker may still be starting or has disconnected")
    )]
    NotConnected { cluster_id: ClusterId },

    #[error("Request {nonce} timed out after {timeout:?}")]
    #[diagnostic(code(chorus_cluster::bus::timeout))]
    Timeout { nonce: uuid::Uuid, timeout: Duration },

    #[error("Request {nonce} was discarded before completing")]
    #[diagnostic(code(chorus_cluster::bus::discarded))]
    Discarded { nonce: uuid::Uuid },

    #[error("No cluster hosts the support guild")]
    #[diagnostic(
        code(chorus_cluster::bus::no_support_cluster),
        help("Set cluster.support_guild_id and make sure the bot is a member of that guild")
    )]
    NoSupportCluster,

    #[error("Failed to bind bus on {address}")]
    #[diagnostic(code(chorus_cluster::bus::bind))]
    Bind {
        address: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("Bus server failed")]
    #[diagnostic(code(chorus_cluster::bus::serve))]
    Serve(#[source] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Error, Diagnostic, Debug)]
pub enum LauncherError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Could not discover the recommended shard count")]
    #[diagnostic(
        code(chorus_cluster::launcher::shard_discovery),
        help("Set cluster.shard_count explicitly, or check the Discord token")
    )]
    ShardDiscovery(#[source] serenity::Error),

    #[error("Could not locate the worker binary")]
    #[diagnostic(
        code(chorus_cluster::launcher::worker_binary),
        help("Set cluster.worker_binary to the path of chorus-worker")
    )]
    WorkerBinary(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LauncherError>;
