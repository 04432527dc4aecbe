use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chorus_core::{ClusterId, WorkerExitCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// What started the fleet shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The launcher received a termination signal
    Signal,
    WorkerExit {
        cluster_id: ClusterId,
        code: WorkerExitCode,
    },
    SpawnFailed {
        cluster_id: ClusterId,
    },
    /// A worker broadcast `close` to every cluster
    BusClose {
        from: ClusterId,
    },
}

struct Inner {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    attempts: AtomicUsize,
    wins: AtomicUsize,
}

/// One-shot fleet shutdown trigger, cheap to clone.
///
/// Only the first [`trigger`](Shutdown::trigger) takes effect; later calls
/// return `false` and leave the recorded reason untouched.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                attempts: AtomicUsize::new(0),
                wins: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns `true` for the call that actually started the shutdown.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                tracing::debug!(?reason, "Shutdown already in progress");
                return false;
            }
            *current = Some(reason);
            self.inner.wins.fetch_add(1, Ordering::SeqCst);
        }

        tracing::info!(?reason, "Shutting down cluster fleet");
        self.inner.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock()
    }

    /// Number of `trigger` calls that started a shutdown.
    pub fn trigger_count(&self) -> usize {
        self.inner.wins.load(Ordering::SeqCst)
    }

    /// Total `trigger` calls, including the ones that lost the race.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }

    /// A token cancelled when the shutdown starts, for tasks to select on.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
