//! Registry of in-flight scatter requests, keyed by nonce

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::shard::ClusterId;

/// One reply collected for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheredResponse {
    /// The responding cluster; `None` when the launcher itself answered
    pub cluster_id: Option<ClusterId>,
    pub data: Value,
}

/// What happened to a delivered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// This response completed the request
    Completed,
    /// No request is waiting on this nonce
    Dropped,
}

struct PendingRequest {
    expected: usize,
    responses: Vec<GatheredResponse>,
    done: Option<oneshot::Sender<Vec<GatheredResponse>>>,
}

impl PendingRequest {
    fn complete_if_ready(&mut self) -> bool {
        if self.responses.len() < self.expected {
            return false;
        }
        if let Some(done) = self.done.take() {
            // The waiter may already be gone; its guard cleans up
            let _ = done.send(std::mem::take(&mut self.responses));
        }
        true
    }
}

/// Outstanding requests. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start waiting for `expected` responses to `nonce`.
    ///
    /// The returned guard removes the entry when dropped, so abandoning the
    /// wait (timeout or cancellation) never leaks an entry.
    pub fn register(self: &Arc<Self>, nonce: Uuid, expected: usize) -> PendingGuard {
        let (tx, rx) = oneshot::channel();
        let mut pending = PendingRequest {
            expected,
            responses: Vec::with_capacity(expected),
            done: Some(tx),
        };

        if !pending.complete_if_ready() {
            self.inner.lock().insert(nonce, pending);
        }

        PendingGuard {
            nonce,
            registry: Arc::clone(self),
            rx,
        }
    }

    /// Record a response. Responses for unknown nonces are dropped.
    pub fn deliver(&self, nonce: Uuid, response: GatheredResponse) -> Delivery {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.get_mut(&nonce) else {
            tracing::debug!(%nonce, "Dropping response with no pending request");
            return Delivery::Dropped;
        };

        pending.responses.push(response);
        if pending.complete_if_ready() {
            inner.remove(&nonce);
            Delivery::Completed
        } else {
            Delivery::Accepted
        }
    }

    /// Expect one fewer response, e.g. because a send to a target failed.
    pub fn shrink(&self, nonce: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.get_mut(&nonce) {
            pending.expected = pending.expected.saturating_sub(1);
            if pending.complete_if_ready() {
                inner.remove(&nonce);
            }
        }
    }

    pub fn contains(&self, nonce: &Uuid) -> bool {
        self.inner.lock().contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, nonce: &Uuid) {
        self.inner.lock().remove(nonce);
    }
}

/// Why a gather did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GatherError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request was discarded")]
    Discarded,
}

/// Handle to one pending request.
pub struct PendingGuard {
    nonce: Uuid,
    registry: Arc<PendingRequests>,
    rx: oneshot::Receiver<Vec<GatheredResponse>>,
}

impl PendingGuard {
    pub fn nonce(&self) -> Uuid {
        self.nonce
    }

    /// Wait until every expected response arrived or `timeout` elapsed.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<GatheredResponse>, GatherError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(_)) => Err(GatherError::Discarded),
            Err(_) => Err(GatherError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.nonce);
    }
}
