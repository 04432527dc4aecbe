//! Periodic liveness checks for every supervised cluster

use std::sync::Arc;

use chorus_core::exit::SIGKILL;
use chorus_core::{ClusterId, Command, HealthConfig, InfoKind, Target};
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::ClusterBus;
use crate::supervisor::{KillIntent, WorkerSupervisor};

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Answered the ping in time
    Healthy,
    /// Not tracked or has no live process; nothing to do
    NotRunning,
    /// No bus connection, so the process was killed without pinging
    Disconnected,
    /// Missed the ping, was told to restart and did so within the grace period
    Restarted,
    /// Missed the ping and ignored the restart directive
    ForceKilled,
}

pub struct HealthMonitor {
    bus: Arc<ClusterBus>,
    supervisor: Arc<WorkerSupervisor>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(bus: Arc<ClusterBus>, supervisor: Arc<WorkerSupervisor>, config: HealthConfig) -> Self {
        Self {
            bus,
            supervisor,
            config,
        }
    }

    pub async fn check_cluster(&self, cluster_id: ClusterId) -> HealthVerdict {
        let Some(pid) = self.supervisor.current_pid(cluster_id) else {
            return HealthVerdict::NotRunning;
        };

        if !self.bus.is_connected(cluster_id) {
            tracing::warn!(%cluster_id, pid, "Cluster has no bus connection, killing");
            self.force_kill(cluster_id);
            return HealthVerdict::Disconnected;
        }

        let outcome = self
            .bus
            .request(
                vec![InfoKind::Ping],
                Target::Cluster(cluster_id),
                self.config.ping_timeout(),
            )
            .await;

        match outcome {
            Ok(responses) if !responses.is_empty() => return HealthVerdict::Healthy,
            Ok(_) => tracing::warn!(%cluster_id, "Cluster ping went undelivered"),
            Err(e) => tracing::warn!(%cluster_id, error = %e, "Cluster failed health check"),
        }

        if let Err(e) = self
            .bus
            .send(Target::Cluster(cluster_id), Command::Restart, json!({}))
            .await
        {
            tracing::warn!(%cluster_id, error = %e, "Failed to send restart directive");
        }

        tokio::time::sleep(self.config.restart_grace()).await;

        if self.supervisor.current_pid(cluster_id) == Some(pid) && self.supervisor.is_running(cluster_id) {
            tracing::warn!(
                %cluster_id,
                pid,
                "Cluster ignored restart directive for {:?}, killing",
                self.config.restart_grace()
            );
            self.force_kill(cluster_id);
            HealthVerdict::ForceKilled
        } else {
            HealthVerdict::Restarted
        }
    }

    fn force_kill(&self, cluster_id: ClusterId) {
        if let Err(e) = self.supervisor.kill(cluster_id, SIGKILL, KillIntent::Restart) {
            tracing::warn!(%cluster_id, error = %e, "Failed to kill cluster");
        }
    }

    /// Check every supervised cluster concurrently.
    pub async fn check_all(&self) -> Vec<(ClusterId, HealthVerdict)> {
        let clusters = self.supervisor.clusters();
        let verdicts = join_all(clusters.iter().map(|id| self.check_cluster(*id))).await;
        clusters.into_iter().zip(verdicts).collect()
    }

    /// Check all clusters every interval, after the initial delay.
    pub async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.initial_delay()) => {}
        }

        let mut interval = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let verdicts = self.check_all().await;
                    let unhealthy = verdicts
                        .iter()
                        .filter(|(_, v)| !matches!(v, HealthVerdict::Healthy | HealthVerdict::NotRunning))
                        .count();
                    tracing::debug!(checked = verdicts.len(), unhealthy, "Health check complete");
                }
            }
        }
    }
}
