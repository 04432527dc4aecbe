//! Worker process supervision
//!
//! One supervision loop per cluster owns that cluster's child process, waits
//! for it to exit and decides from the exit status whether to respawn it,
//! retire it, or bring the whole fleet down. The process table is shared so
//! the health monitor and the bus can look up pids and deliver signals.

pub mod process;
pub mod shutdown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::exit::{SIGKILL, SIGTERM};
use chorus_core::{ClusterId, ExitAction, ShardAssignment, WorkerExit};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::SupervisorError;

pub use process::ProcessSpawner;
pub use shutdown::{Shutdown, ShutdownReason};

/// A running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> std::io::Result<WorkerExit>;
}

/// Starts worker processes and delivers signals to them.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, assignment: &ShardAssignment)
    -> Result<Box<dyn WorkerProcess>, SupervisorError>;

    fn signal(&self, pid: u32, signal: i32) -> Result<(), SupervisorError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Why a signal is being sent, which decides what its exit means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillIntent {
    /// The launcher wants the cluster back (health check failure)
    Restart,
    /// The cluster should stay down
    Retire,
}

/// Snapshot of one tracked worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub cluster_id: ClusterId,
    pub pid: Option<u32>,
    pub last_exit: Option<WorkerExit>,
    /// Number of times this cluster has been respawned
    pub restarts: u32,
}

struct Tracked {
    handle: WorkerHandle,
    pending_kill: Option<KillIntent>,
}

pub struct WorkerSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    table: Mutex<HashMap<ClusterId, Tracked>>,
    shutdown: Shutdown,
    retry_join: Duration,
}

impl WorkerSupervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, shutdown: Shutdown, retry_join: Duration) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            table: Mutex::new(HashMap::new()),
            shutdown,
            retry_join,
        })
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Start the cluster's worker and keep it running on a background task.
    pub fn supervise(self: &Arc<Self>, assignment: ShardAssignment) -> JoinHandle<()> {
        self.table.lock().insert(
            assignment.cluster_id,
            Tracked {
                handle: WorkerHandle {
                    cluster_id: assignment.cluster_id,
                    pid: None,
                    last_exit: None,
                    restarts: 0,
                },
                pending_kill: None,
            },
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run(assignment).await })
    }

    async fn run(&self, assignment: ShardAssignment) {
        let cluster_id = assignment.cluster_id;

        loop {
            if self.shutdown.is_triggered() {
                self.forget(cluster_id);
                return;
            }

            let mut process = match self.spawner.spawn(&assignment) {
                Ok(process) => process,
                Err(e) => {
                    chorus_core::log_error_chain!(format!("Cluster {cluster_id} failed to start"), e);
                    self.forget(cluster_id);
                    self.shutdown
                        .trigger(ShutdownReason::SpawnFailed { cluster_id });
                    return;
                }
            };

            let pid = process.id();
            self.record_spawn(cluster_id, pid);
            tracing::info!(%cluster_id, ?pid, shards = %assignment.shard_list(), "Cluster started");

            loop {
                let (exit, action) = match process.wait().await {
                    Ok(exit) => (Some(exit), self.classify(cluster_id, exit)),
                    Err(e) => {
                        tracing::warn!(%cluster_id, error = %e, "Failed to wait on cluster process");
                        // The old process may still hold the shards
                        self.kill_orphan(cluster_id, pid);
                        (None, ExitAction::RespawnAnomaly)
                    }
                };
                self.record_exit(cluster_id, exit);

                match action {
                    ExitAction::ShutdownFleet(code) => {
                        tracing::info!(%cluster_id, ?code, "Cluster requested fleet shutdown");
                        self.forget(cluster_id);
                        self.shutdown
                            .trigger(ShutdownReason::WorkerExit { cluster_id, code });
                        return;
                    }
                    ExitAction::Retire => {
                        tracing::info!(%cluster_id, ?exit, "Cluster was killed, not restarting");
                        self.forget(cluster_id);
                        return;
                    }
                    ExitAction::Respawn => {
                        tracing::info!(%cluster_id, ?exit, "Restarting cluster");
                        break;
                    }
                    ExitAction::RespawnAnomaly => {
                        tracing::warn!(%cluster_id, ?exit, "Cluster exited unexpectedly, restarting");
                        break;
                    }
                    ExitAction::RetryJoin => {
                        tracing::warn!(
                            %cluster_id,
                            "Cluster exit status unavailable, retrying in {:?}",
                            self.retry_join
                        );
                        tokio::time::sleep(self.retry_join).await;
                    }
                }
            }
        }
    }

    /// Classify an exit, honouring a restart requested through [`kill`](Self::kill).
    fn classify(&self, cluster_id: ClusterId, exit: WorkerExit) -> ExitAction {
        let intent = self
            .table
            .lock()
            .get_mut(&cluster_id)
            .and_then(|tracked| tracked.pending_kill.take());

        match (exit.classify(), intent) {
            (ExitAction::Retire, Some(KillIntent::Restart)) => ExitAction::Respawn,
            (action, _) => action,
        }
    }

    fn kill_orphan(&self, cluster_id: ClusterId, pid: Option<u32>) {
        let Some(pid) = pid.filter(|pid| self.spawner.is_alive(*pid)) else {
            return;
        };
        match self.spawner.signal(pid, SIGKILL) {
            Ok(()) => tracing::warn!(%cluster_id, pid, "Killed unwaitable cluster process"),
            Err(e) => tracing::warn!(%cluster_id, pid, error = %e, "Failed to kill unwaitable cluster process"),
        }
    }

    fn record_spawn(&self, cluster_id: ClusterId, pid: Option<u32>) {
        if let Some(tracked) = self.table.lock().get_mut(&cluster_id) {
            if tracked.handle.pid.is_some() || tracked.handle.last_exit.is_some() {
                tracked.handle.restarts += 1;
            }
            tracked.handle.pid = pid;
            tracked.pending_kill = None;
        }
    }

    fn record_exit(&self, cluster_id: ClusterId, exit: Option<WorkerExit>) {
        if let Some(tracked) = self.table.lock().get_mut(&cluster_id) {
            tracked.handle.last_exit = exit.or(Some(WorkerExit::Unknown));
        }
    }

    fn forget(&self, cluster_id: ClusterId) {
        self.table.lock().remove(&cluster_id);
    }

    /// Send `signal` to the cluster's current process.
    pub fn kill(
        &self,
        cluster_id: ClusterId,
        signal: i32,
        intent: KillIntent,
    ) -> Result<(), SupervisorError> {
        let pid = {
            let mut table = self.table.lock();
            let tracked = table
                .get_mut(&cluster_id)
                .ok_or(SupervisorError::NotRunning { cluster_id })?;
            let pid = tracked
                .handle
                .pid
                .ok_or(SupervisorError::NotRunning { cluster_id })?;
            tracked.pending_kill = Some(intent);
            pid
        };

        tracing::info!(%cluster_id, pid, signal, ?intent, "Signalling cluster");
        self.spawner.signal(pid, signal)
    }

    pub fn current_pid(&self, cluster_id: ClusterId) -> Option<u32> {
        self.table
            .lock()
            .get(&cluster_id)
            .and_then(|tracked| tracked.handle.pid)
    }

    pub fn is_running(&self, cluster_id: ClusterId) -> bool {
        self.current_pid(cluster_id)
            .is_some_and(|pid| self.spawner.is_alive(pid))
    }

    /// Clusters currently supervised, in id order.
    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.table.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn handle(&self, cluster_id: ClusterId) -> Option<WorkerHandle> {
        self.table
            .lock()
            .get(&cluster_id)
            .map(|tracked| tracked.handle.clone())
    }

    /// SIGTERM every tracked worker. Used once the launcher is exiting.
    pub fn terminate_all(&self) {
        for cluster_id in self.clusters() {
            match self.kill(cluster_id, SIGTERM, KillIntent::Retire) {
                Ok(()) => {}
                Err(SupervisorError::NotRunning { .. }) => {}
                Err(e) => tracing::debug!(%cluster_id, error = %e, "Failed to terminate cluster"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSpawner, eventually};
    use chorus_core::WorkerExitCode;
    use pretty_assertions::assert_eq;

    fn assignment(cluster: u32) -> ShardAssignment {
        ShardAssignment {
            cluster_id: ClusterId(cluster),
            total_shards: 12,
            shards: (cluster * 4..cluster * 4 + 4).collect(),
        }
    }

    fn supervisor(spawner: &Arc<ScriptedSpawner>) -> Arc<WorkerSupervisor> {
        WorkerSupervisor::new(spawner.clone(), Shutdown::new(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn respawns_on_restart_code() {
        let spawner = ScriptedSpawner::new();
        spawner.script(ClusterId(0), vec![vec![WorkerExit::Code(1)]]);
        let sup = supervisor(&spawner);

        sup.supervise(assignment(0));
        eventually(|| spawner.spawn_count(ClusterId(0)) == 2).await;

        let handle = sup.handle(ClusterId(0)).unwrap();
        assert_eq!(handle.restarts, 1);
        assert_eq!(handle.last_exit, Some(WorkerExit::Code(1)));
        assert!(sup.is_running(ClusterId(0)));
        assert!(!sup.shutdown().is_triggered());
    }

    #[tokio::test]
    async fn kill_everything_shuts_fleet_down_once() {
        let spawner = ScriptedSpawner::new();
        spawner.script(ClusterId(1), vec![vec![WorkerExit::Code(0)]]);
        let sup = supervisor(&spawner);

        for cluster in 0..3 {
            sup.supervise(assignment(cluster));
        }
        sup.shutdown().wait().await;

        assert_eq!(
            sup.shutdown().reason(),
            Some(ShutdownReason::WorkerExit {
                cluster_id: ClusterId(1),
                code: WorkerExitCode::KillEverything,
            })
        );
        eventually(|| sup.clusters() == vec![ClusterId(0), ClusterId(2)]).await;
        assert_eq!(spawner.spawn_count(ClusterId(1)), 1);
    }

    #[tokio::test]
    async fn concurrent_fatal_exits_record_a_single_reason() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);

        let first = sup.supervise(assignment(0));
        let second = sup.supervise(assignment(1));
        eventually(|| {
            sup.current_pid(ClusterId(0)).is_some() && sup.current_pid(ClusterId(1)).is_some()
        })
        .await;

        // Both processes are already running, so both loops see a fatal exit
        spawner.exit(spawner.pid_of(ClusterId(0)).unwrap(), WorkerExit::Code(0));
        spawner.exit(spawner.pid_of(ClusterId(1)).unwrap(), WorkerExit::Code(2));
        first.await.unwrap();
        second.await.unwrap();

        assert!(sup.shutdown().is_triggered());
        assert!(matches!(
            sup.shutdown().reason(),
            Some(ShutdownReason::WorkerExit { .. })
        ));
        assert_eq!(sup.shutdown().attempts(), 2);
        assert_eq!(sup.shutdown().trigger_count(), 1);
        assert!(sup.clusters().is_empty());
    }

    #[tokio::test]
    async fn failed_wait_kills_the_old_process_before_respawning() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);
        sup.supervise(assignment(0));
        eventually(|| sup.current_pid(ClusterId(0)).is_some()).await;
        let old_pid = sup.current_pid(ClusterId(0)).unwrap();

        spawner.fail_wait(old_pid);
        eventually(|| spawner.spawn_count(ClusterId(0)) == 2).await;

        assert_eq!(spawner.signals(), vec![(old_pid, SIGKILL)]);
        assert_ne!(sup.current_pid(ClusterId(0)), Some(old_pid));
        assert_eq!(
            sup.handle(ClusterId(0)).unwrap().last_exit,
            Some(WorkerExit::Unknown)
        );
    }

    #[tokio::test]
    async fn external_kill_retires_cluster() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);
        let task = sup.supervise(assignment(0));
        eventually(|| sup.current_pid(ClusterId(0)).is_some()).await;

        sup.kill(ClusterId(0), SIGTERM, KillIntent::Retire).unwrap();
        task.await.unwrap();

        assert_eq!(spawner.spawn_count(ClusterId(0)), 1);
        assert!(sup.clusters().is_empty());
        assert!(!sup.shutdown().is_triggered());
    }

    #[tokio::test]
    async fn restart_kill_respawns_cluster() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);
        sup.supervise(assignment(0));
        eventually(|| sup.current_pid(ClusterId(0)).is_some()).await;
        let first_pid = sup.current_pid(ClusterId(0));

        sup.kill(ClusterId(0), SIGKILL, KillIntent::Restart).unwrap();
        eventually(|| spawner.spawn_count(ClusterId(0)) == 2).await;

        assert_ne!(sup.current_pid(ClusterId(0)), first_pid);
        assert_eq!(spawner.signals(), vec![(first_pid.unwrap(), SIGKILL)]);
    }

    #[tokio::test]
    async fn anomalous_signal_respawns() {
        let spawner = ScriptedSpawner::new();
        spawner.script(ClusterId(0), vec![vec![WorkerExit::Signal(11)]]);
        let sup = supervisor(&spawner);
        sup.supervise(assignment(0));
        eventually(|| spawner.spawn_count(ClusterId(0)) == 2).await;
        assert!(!sup.shutdown().is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_exit_retries_join() {
        let spawner = ScriptedSpawner::new();
        spawner.script(
            ClusterId(0),
            vec![vec![WorkerExit::Unknown, WorkerExit::Code(2)]],
        );
        let sup = supervisor(&spawner);

        let started = tokio::time::Instant::now();
        sup.supervise(assignment(0)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(spawner.spawn_count(ClusterId(0)), 1);
        assert!(sup.shutdown().is_triggered());
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let spawner = ScriptedSpawner::new();
        spawner.fail_spawns(ClusterId(0));
        let sup = supervisor(&spawner);

        sup.supervise(assignment(0)).await.unwrap();
        assert_eq!(
            sup.shutdown().reason(),
            Some(ShutdownReason::SpawnFailed {
                cluster_id: ClusterId(0)
            })
        );
    }

    #[tokio::test]
    async fn no_respawn_after_shutdown() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);
        let task = sup.supervise(assignment(0));
        eventually(|| sup.current_pid(ClusterId(0)).is_some()).await;

        sup.shutdown().trigger(ShutdownReason::Signal);
        sup.kill(ClusterId(0), SIGKILL, KillIntent::Restart).unwrap();
        task.await.unwrap();

        assert_eq!(spawner.spawn_count(ClusterId(0)), 1);
    }

    #[tokio::test]
    async fn terminate_all_signals_every_worker() {
        let spawner = ScriptedSpawner::new();
        let sup = supervisor(&spawner);
        let tasks: Vec<_> = (0..3).map(|c| sup.supervise(assignment(c))).collect();
        eventually(|| (0..3).all(|c| sup.current_pid(ClusterId(c)).is_some())).await;

        sup.terminate_all();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(spawner.signals().len(), 3);
        assert!(spawner.signals().iter().all(|(_, s)| *s == SIGTERM));
    }
}
