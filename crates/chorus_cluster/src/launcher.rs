//! Top-level orchestration of a cluster fleet
//!
//! The launcher partitions the shards, starts one supervised worker per
//! cluster, serves the bus and runs the health monitor. Everything then waits
//! on a single [`Shutdown`] which may be triggered by an OS signal, a fatal
//! worker exit or a worker broadcasting `close`.

use std::sync::Arc;

use chorus_core::{ClusterConfig, Command, Target, partition_shards};
use futures::future::join_all;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bus::{self, ClusterBus};
use crate::error::{BusError, LauncherError, Result};
use crate::health::HealthMonitor;
use crate::signals::wait_for_termination;
use crate::supervisor::{Shutdown, ShutdownReason, WorkerSpawner, WorkerSupervisor};

/// Ask Discord for the recommended shard count (`GET /gateway/bot`).
pub async fn discover_shard_count(token: &str) -> Result<u32> {
    let http = serenity::http::Http::new(token);
    let gateway = http
        .get_bot_gateway()
        .await
        .map_err(LauncherError::ShardDiscovery)?;

    tracing::info!(shards = gateway.shards, "Discovered recommended shard count");
    Ok(gateway.shards)
}

pub async fn bind(address: &str) -> std::result::Result<TcpListener, BusError> {
    TcpListener::bind(address)
        .await
        .map_err(|cause| BusError::Bind {
            address: address.to_string(),
            cause,
        })
}

pub struct ClusterLauncher {
    config: ClusterConfig,
    spawner: Arc<dyn WorkerSpawner>,
    shutdown: Shutdown,
}

impl ClusterLauncher {
    pub fn new(config: ClusterConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config,
            spawner,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle that stops the fleet when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the fleet until it shuts down, returning what triggered the shutdown.
    pub async fn run(self, shard_count: u32, listener: TcpListener) -> Result<Option<ShutdownReason>> {
        let assignments = partition_shards(shard_count, self.config.shards_per_cluster)?;
        tracing::info!(
            shard_count,
            clusters = assignments.len(),
            shards_per_cluster = self.config.shards_per_cluster,
            "Launching clusters"
        );

        let health = self.config.health.clone();
        let supervisor =
            WorkerSupervisor::new(self.spawner, self.shutdown.clone(), health.retry_join());
        let bus = ClusterBus::new(Arc::clone(&supervisor), health.ping_timeout());
        let tasks = CancellationToken::new();

        let server = tokio::spawn(bus::serve(listener, Arc::clone(&bus), tasks.clone()));
        let workers: Vec<_> = assignments
            .into_iter()
            .map(|assignment| supervisor.supervise(assignment))
            .collect();

        let monitor = HealthMonitor::new(Arc::clone(&bus), Arc::clone(&supervisor), health);
        let health_task = tokio::spawn(monitor.run(tasks.clone()));

        let signals = tokio::spawn({
            let shutdown = self.shutdown.clone();
            async move {
                tokio::select! {
                    result = wait_for_termination() => match result {
                        Ok(()) => {
                            shutdown.trigger(ShutdownReason::Signal);
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
                    },
                    _ = shutdown.wait() => {}
                }
            }
        });

        self.shutdown.wait().await;
        let reason = self.shutdown.reason();
        tracing::info!(?reason, "Stopping cluster fleet");

        match bus.send(Target::All, Command::Close, json!({})).await {
            Ok(delivered) => tracing::info!(delivered, "Broadcast close to clusters"),
            Err(e) => tracing::warn!(error = %e, "Failed to broadcast close"),
        }

        tasks.cancel();
        signals.abort();

        let timeout = self.config.shutdown_timeout();
        let settle = async {
            match server.await {
                Ok(Err(e)) => chorus_core::log_error_chain!("Bus server stopped with an error", e),
                Err(e) if e.is_panic() => tracing::error!("Bus server panicked"),
                _ => {}
            }
            let _ = health_task.await;
        };
        if tokio::time::timeout(timeout, settle).await.is_err() {
            tracing::warn!("Bus and health tasks did not stop within {timeout:?}");
        }

        supervisor.terminate_all();
        if tokio::time::timeout(timeout, join_all(workers)).await.is_err() {
            tracing::warn!(
                remaining = ?supervisor.clusters(),
                "Clusters still running after {timeout:?}"
            );
        }

        tracing::info!("Cluster fleet stopped");
        Ok(reason)
    }
}
