//! Fakes shared by the unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::{ClusterId, ShardAssignment, WorkerExit};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SupervisorError;
use crate::supervisor::{WorkerProcess, WorkerSpawner};

/// `None` makes the process's next `wait` fail.
type LiveTable = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Option<WorkerExit>>>>>;

/// Spawner whose processes exit when told to.
///
/// Each spawn of a cluster pops the next script entry: the exits listed are
/// delivered immediately, in order. With no entry left, the process runs
/// until it receives a signal.
#[derive(Default)]
pub(crate) struct ScriptedSpawner {
    next_pid: AtomicU32,
    scripts: Mutex<HashMap<ClusterId, VecDeque<Vec<WorkerExit>>>>,
    failing: Mutex<HashSet<ClusterId>>,
    spawns: Mutex<Vec<ClusterId>>,
    signals: Mutex<Vec<(u32, i32)>>,
    latest: Mutex<HashMap<ClusterId, u32>>,
    live: LiveTable,
}

impl ScriptedSpawner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    pub(crate) fn script(&self, cluster_id: ClusterId, runs: Vec<Vec<WorkerExit>>) {
        self.scripts.lock().insert(cluster_id, runs.into());
    }

    pub(crate) fn fail_spawns(&self, cluster_id: ClusterId) {
        self.failing.lock().insert(cluster_id);
    }

    pub(crate) fn spawn_count(&self, cluster_id: ClusterId) -> usize {
        self.spawns.lock().iter().filter(|c| **c == cluster_id).count()
    }

    pub(crate) fn signals(&self) -> Vec<(u32, i32)> {
        self.signals.lock().clone()
    }

    /// Pid of the most recent spawn of `cluster_id`.
    pub(crate) fn pid_of(&self, cluster_id: ClusterId) -> Option<u32> {
        self.latest.lock().get(&cluster_id).copied()
    }

    /// Make a running process exit on its own.
    pub(crate) fn exit(&self, pid: u32, exit: WorkerExit) {
        if let Some(tx) = self.live.lock().get(&pid) {
            let _ = tx.send(Some(exit));
        }
    }

    /// Make the next `wait` on a running process fail, leaving it alive.
    pub(crate) fn fail_wait(&self, pid: u32) {
        if let Some(tx) = self.live.lock().get(&pid) {
            let _ = tx.send(None);
        }
    }
}

struct ScriptedProcess {
    pid: u32,
    exits: mpsc::UnboundedReceiver<Option<WorkerExit>>,
    live: LiveTable,
}

#[async_trait]
impl WorkerProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<WorkerExit> {
        let exit = self
            .exits
            .recv()
            .await
            .ok_or_else(|| std::io::Error::other("process table dropped"))?
            .ok_or_else(|| std::io::Error::other("wait failed"))?;
        if exit != WorkerExit::Unknown {
            self.live.lock().remove(&self.pid);
        }
        Ok(exit)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        assignment: &ShardAssignment,
    ) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let cluster_id = assignment.cluster_id;
        if self.failing.lock().contains(&cluster_id) {
            return Err(SupervisorError::Spawn {
                cluster_id,
                binary: "scripted".into(),
                cause: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        self.spawns.lock().push(cluster_id);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let exits = self
            .scripts
            .lock()
            .get_mut(&cluster_id)
            .and_then(|runs| runs.pop_front())
            .unwrap_or_default();
        for exit in exits {
            let _ = tx.send(Some(exit));
        }
        self.live.lock().insert(pid, tx);
        self.latest.lock().insert(cluster_id, pid);

        Ok(Box::new(ScriptedProcess {
            pid,
            exits: rx,
            live: Arc::clone(&self.live),
        }))
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<(), SupervisorError> {
        self.signals.lock().push((pid, signal));
        match self.live.lock().get(&pid) {
            Some(tx) => {
                let _ = tx.send(Some(WorkerExit::Signal(signal)));
                Ok(())
            }
            None => Err(SupervisorError::Signal {
                pid,
                signal,
                cause: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.live.lock().contains_key(&pid)
    }
}

/// Poll `check` until it holds, failing the test after a while.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
