//! Launcher side of the cluster bus
//!
//! Every worker holds one WebSocket connection to the launcher. The bus keeps
//! an outbound channel per connection and offers three operations on top:
//! fire-and-forget broadcast ([`ClusterBus::send`]), scatter/gather
//! ([`ClusterBus::request`]) and process kill ([`ClusterBus::kill`]). Frames
//! coming from workers are dispatched by [`ClusterBus::handle_envelope`], which
//! makes the launcher the hub for worker-to-worker traffic.

pub mod server;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chorus_core::exit::SIGTERM;
use chorus_core::protocol::pending::GatherError;
use chorus_core::protocol::{
    GatheredResponse, KillArgs, PendingRequests, ProtocolError, RequestArgs, SendArgs,
};
use chorus_core::{ClusterId, Command, Envelope, InfoKind, Target};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BusError;
use crate::supervisor::{KillIntent, Shutdown, ShutdownReason, WorkerSupervisor};

pub use server::{router, serve};

/// Identifies one connection of a cluster, so a stale disconnect cannot
/// evict a newer connection for the same cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId {
    pub cluster_id: ClusterId,
    generation: u64,
}

struct Connection {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

pub struct ClusterBus {
    connections: RwLock<HashMap<ClusterId, Connection>>,
    pending: Arc<PendingRequests>,
    support: Mutex<Option<ClusterId>>,
    supervisor: Arc<WorkerSupervisor>,
    shutdown: Shutdown,
    request_timeout: Duration,
    generations: AtomicU64,
}

impl ClusterBus {
    /// `request_timeout` bounds requests the launcher makes on a worker's
    /// behalf (relayed requests and support lookups).
    pub fn new(supervisor: Arc<WorkerSupervisor>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            pending: PendingRequests::new(),
            support: Mutex::new(None),
            shutdown: supervisor.shutdown().clone(),
            supervisor,
            request_timeout,
            generations: AtomicU64::new(0),
        })
    }

    /// Track a new connection, replacing any previous one for the cluster.
    pub fn register_connection(
        &self,
        cluster_id: ClusterId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if self
            .connections
            .write()
            .insert(cluster_id, Connection { generation, tx })
            .is_some()
        {
            tracing::info!(%cluster_id, "Cluster reconnected, replacing old connection");
        } else {
            tracing::info!(%cluster_id, "Cluster connected to bus");
        }

        (
            ConnectionId {
                cluster_id,
                generation,
            },
            rx,
        )
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        let mut connections = self.connections.write();
        let current = connections
            .get(&connection.cluster_id)
            .is_some_and(|c| c.generation == connection.generation);
        if current {
            connections.remove(&connection.cluster_id);
            tracing::info!(cluster_id = %connection.cluster_id, "Cluster disconnected from bus");
        }
    }

    pub fn is_connected(&self, cluster_id: ClusterId) -> bool {
        self.connections.read().contains_key(&cluster_id)
    }

    /// Connected clusters, in id order.
    pub fn connected(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.connections.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Write a frame to one cluster, evicting its connection on failure.
    fn deliver(&self, cluster_id: ClusterId, frame: &str) -> bool {
        let (generation, result) = {
            let connections = self.connections.read();
            let Some(connection) = connections.get(&cluster_id) else {
                tracing::debug!(%cluster_id, "No bus connection, dropping frame");
                return false;
            };
            (connection.generation, connection.tx.send(frame.to_string()))
        };

        if result.is_err() {
            tracing::warn!(%cluster_id, "Bus connection closed while sending, evicting");
            self.disconnect(ConnectionId {
                cluster_id,
                generation,
            });
            return false;
        }
        true
    }

    async fn resolve(&self, command: Command, target: Target) -> Result<Vec<ClusterId>, BusError> {
        match target {
            Target::All => Ok(self.connected()),
            Target::Cluster(id) => Ok(vec![id]),
            Target::Support => Ok(vec![self.resolve_support().await?]),
            Target::Nonce(_) => Err(ProtocolError::InvalidTarget { command, target }.into()),
        }
    }

    /// Find the cluster serving the support guild, asking every worker the
    /// first time. Concurrent first lookups each ask.
    pub async fn resolve_support(&self) -> Result<ClusterId, BusError> {
        if let Some(cluster_id) = *self.support.lock() {
            return Ok(cluster_id);
        }

        let responses = self
            .scatter(
                vec![InfoKind::HasSupport],
                Target::All,
                self.connected(),
                self.request_timeout,
            )
            .await?;

        let cluster_id = responses
            .iter()
            .find(|r| r.data.get(InfoKind::HasSupport.key()) == Some(&Value::Bool(true)))
            .and_then(|r| r.cluster_id)
            .ok_or(BusError::NoSupportCluster)?;

        *self.support.lock() = Some(cluster_id);
        tracing::debug!(%cluster_id, "Resolved support cluster");
        Ok(cluster_id)
    }

    /// Fire-and-forget `command` to `target`. Returns how many clusters the
    /// frame was written to.
    pub async fn send(&self, target: Target, command: Command, args: Value) -> Result<usize, BusError> {
        let clusters = self.resolve(command, target).await?;
        let wire_target = match (target, clusters.first()) {
            (Target::Support, Some(cluster_id)) => Target::Cluster(*cluster_id),
            _ => target,
        };
        let frame = Envelope::new(command, args, wire_target).encode();

        let delivered = clusters
            .into_iter()
            .filter(|id| self.deliver(*id, &frame))
            .count();
        tracing::debug!(%target, %command, delivered, "Sent bus command");
        Ok(delivered)
    }

    /// Ask `target` for `info` and wait for every response.
    pub async fn request(
        &self,
        info: Vec<InfoKind>,
        target: Target,
        timeout: Duration,
    ) -> Result<Vec<GatheredResponse>, BusError> {
        let clusters = self.resolve(Command::Request, target).await?;
        if let Target::Cluster(cluster_id) = target {
            if !self.is_connected(cluster_id) {
                return Err(BusError::NotConnected { cluster_id });
            }
        }
        self.scatter(info, target, clusters, timeout).await
    }

    async fn scatter(
        &self,
        info: Vec<InfoKind>,
        target: Target,
        clusters: Vec<ClusterId>,
        timeout: Duration,
    ) -> Result<Vec<GatheredResponse>, BusError> {
        let nonce = Uuid::new_v4();
        let guard = self.pending.register(nonce, clusters.len());
        let frame = Envelope::request(info, nonce, target).encode();

        for cluster_id in clusters {
            if !self.deliver(cluster_id, &frame) {
                self.pending.shrink(nonce);
            }
        }

        guard.wait(timeout).await.map_err(|e| match e {
            GatherError::Timeout(timeout) => BusError::Timeout { nonce, timeout },
            GatherError::Discarded => BusError::Discarded { nonce },
        })
    }

    /// Signal a cluster's process directly, SIGTERM unless told otherwise.
    pub fn kill(&self, cluster_id: ClusterId, signal: Option<i32>) -> Result<(), BusError> {
        self.supervisor
            .kill(cluster_id, signal.unwrap_or(SIGTERM), KillIntent::Retire)?;
        Ok(())
    }

    /// Dispatch a frame received from `from`.
    pub fn handle_envelope(self: &Arc<Self>, from: ClusterId, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(cluster_id = %from, error = %e, "Ignoring malformed bus frame");
                return;
            }
        };

        if let Err(e) = self.dispatch(from, envelope) {
            tracing::warn!(cluster_id = %from, error = %e, "Failed to handle bus frame");
        }
    }

    fn dispatch(self: &Arc<Self>, from: ClusterId, envelope: Envelope) -> Result<(), BusError> {
        match envelope.command {
            Command::Send => {
                let relay: SendArgs = envelope.args_as()?;
                if relay.command == Command::Close && envelope.target == Target::All {
                    tracing::info!(cluster_id = %from, "Cluster requested fleet close");
                    self.shutdown.trigger(ShutdownReason::BusClose { from });
                    return Ok(());
                }

                let bus = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = bus.send(envelope.target, relay.command, relay.args).await {
                        tracing::warn!(cluster_id = %from, error = %e, "Failed to relay command");
                    }
                });
            }
            Command::Request => {
                let request: RequestArgs = envelope.args_as()?;
                let bus = Arc::clone(self);
                tokio::spawn(async move {
                    let data = match bus
                        .request(request.info, envelope.target, bus.request_timeout)
                        .await
                    {
                        Ok(responses) => json!({ "responses": responses }),
                        Err(e) => {
                            tracing::warn!(cluster_id = %from, error = %e, "Relayed request failed");
                            json!({ "responses": [], "error": e.to_string() })
                        }
                    };
                    bus.deliver(from, &Envelope::response(request.nonce, data).encode());
                });
            }
            Command::Response => {
                if let Target::Nonce(nonce) = envelope.target {
                    self.pending.deliver(
                        nonce,
                        GatheredResponse {
                            cluster_id: Some(from),
                            data: envelope.args,
                        },
                    );
                }
            }
            Command::Kill => {
                let args: KillArgs = envelope.args_as()?;
                if let Target::Cluster(cluster_id) = envelope.target {
                    tracing::info!(from = %from, %cluster_id, "Cluster requested kill");
                    self.kill(cluster_id, args.signal)?;
                }
            }
            Command::Close | Command::Restart => {
                tracing::warn!(
                    cluster_id = %from,
                    command = %envelope.command,
                    "Unexpected worker-bound command from cluster"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSpawner, eventually};
    use chorus_core::ShardAssignment;
    use pretty_assertions::assert_eq;

    fn bus() -> (Arc<ClusterBus>, Arc<ScriptedSpawner>) {
        let spawner = ScriptedSpawner::new();
        let supervisor =
            WorkerSupervisor::new(spawner.clone(), Shutdown::new(), Duration::from_secs(10));
        (ClusterBus::new(supervisor, Duration::from_secs(5)), spawner)
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
        Envelope::decode(&rx.try_recv().expect("no frame")).unwrap()
    }

    /// Answer the next request on `rx` as `cluster_id`.
    fn answer(bus: &Arc<ClusterBus>, cluster_id: u32, rx: &mut mpsc::UnboundedReceiver<String>, data: Value) {
        let request: RequestArgs = next(rx).args_as().unwrap();
        let reply = Envelope::response(request.nonce, data).encode();
        bus.handle_envelope(ClusterId(cluster_id), &reply);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let (bus, _) = bus();
        let (_, mut a) = bus.register_connection(ClusterId(0));
        let (_, mut b) = bus.register_connection(ClusterId(1));

        let sent = bus
            .send(Target::All, Command::Close, json!({}))
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(next(&mut a).command, Command::Close);
        assert_eq!(next(&mut b).target, Target::All);
    }

    #[tokio::test]
    async fn failed_send_evicts_only_that_connection() {
        let (bus, _) = bus();
        let (_, a) = bus.register_connection(ClusterId(0));
        let (_, mut b) = bus.register_connection(ClusterId(1));
        drop(a);

        let sent = bus
            .send(Target::All, Command::Restart, json!({}))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(bus.connected(), vec![ClusterId(1)]);
        assert_eq!(next(&mut b).command, Command::Restart);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_new_connection() {
        let (bus, _) = bus();
        let (old, _old_rx) = bus.register_connection(ClusterId(0));
        let (_new, _new_rx) = bus.register_connection(ClusterId(0));

        bus.disconnect(old);
        assert!(bus.is_connected(ClusterId(0)));
    }

    #[tokio::test]
    async fn scatter_gathers_all_responses() {
        let (bus, _) = bus();
        let (_, mut a) = bus.register_connection(ClusterId(0));
        let (_, mut b) = bus.register_connection(ClusterId(1));

        let request = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                bus.request(vec![InfoKind::GuildCount], Target::All, Duration::from_secs(5))
                    .await
            }
        });
        eventually(|| !bus.pending().is_empty()).await;

        // Answer out of order
        answer(&bus, 1, &mut b, json!({ "guild_count": 7 }));
        answer(&bus, 0, &mut a, json!({ "guild_count": 3 }));

        let mut responses = request.await.unwrap().unwrap();
        responses.sort_by_key(|r| r.cluster_id);
        let counts: Vec<_> = responses.iter().map(|r| r.data["guild_count"].clone()).collect();
        assert_eq!(counts, vec![json!(3), json!(7)]);
        assert!(bus.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_discards_pending() {
        let (bus, _) = bus();
        let (_, _rx) = bus.register_connection(ClusterId(0));

        let result = bus
            .request(vec![InfoKind::Ping], Target::Cluster(ClusterId(0)), Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert!(bus.pending().is_empty());
    }

    #[tokio::test]
    async fn request_to_disconnected_cluster_fails_fast() {
        let (bus, _) = bus();
        let result = bus
            .request(vec![InfoKind::Ping], Target::Cluster(ClusterId(3)), Duration::from_secs(10))
            .await;
        assert!(matches!(
            result,
            Err(BusError::NotConnected { cluster_id: ClusterId(3) })
        ));
    }

    #[tokio::test]
    async fn support_is_resolved_once_and_cached() {
        let (bus, _) = bus();
        let (_, mut a) = bus.register_connection(ClusterId(0));
        let (_, mut b) = bus.register_connection(ClusterId(1));

        let send = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.send(Target::Support, Command::Restart, json!({})).await }
        });
        eventually(|| !bus.pending().is_empty()).await;
        answer(&bus, 0, &mut a, json!({ "has_support": false }));
        answer(&bus, 1, &mut b, json!({ "has_support": true }));

        assert_eq!(send.await.unwrap().unwrap(), 1);
        let restart = next(&mut b);
        assert_eq!(restart.command, Command::Restart);
        assert_eq!(restart.target, Target::Cluster(ClusterId(1)));

        // Second lookup uses the cache
        bus.send(Target::Support, Command::Restart, json!({}))
            .await
            .unwrap();
        assert_eq!(next(&mut b).command, Command::Restart);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn worker_close_broadcast_triggers_shutdown() {
        let (bus, _) = bus();
        let frame = Envelope::relay(Command::Close, json!({}), Target::All).encode();
        bus.handle_envelope(ClusterId(2), &frame);

        assert_eq!(
            bus.shutdown.reason(),
            Some(ShutdownReason::BusClose { from: ClusterId(2) })
        );
    }

    #[tokio::test]
    async fn worker_send_is_relayed_to_target() {
        let (bus, _) = bus();
        let (_, _a) = bus.register_connection(ClusterId(0));
        let (_, mut b) = bus.register_connection(ClusterId(1));

        let frame = Envelope::relay(Command::Restart, json!({}), ClusterId(1)).encode();
        bus.handle_envelope(ClusterId(0), &frame);

        eventually(|| !b.is_empty()).await;
        assert_eq!(next(&mut b).command, Command::Restart);
        assert!(!bus.shutdown.is_triggered());
    }

    #[tokio::test]
    async fn worker_request_is_gathered_and_answered() {
        let (bus, _) = bus();
        let (_, mut asker) = bus.register_connection(ClusterId(0));
        let (_, mut other) = bus.register_connection(ClusterId(1));

        let nonce = Uuid::new_v4();
        let frame = Envelope::request(vec![InfoKind::VoiceCount], nonce, ClusterId(1)).encode();
        bus.handle_envelope(ClusterId(0), &frame);

        eventually(|| !other.is_empty()).await;
        answer(&bus, 1, &mut other, json!({ "voice_count": 4 }));

        eventually(|| !asker.is_empty()).await;
        let reply = next(&mut asker);
        assert_eq!(reply.command, Command::Response);
        assert_eq!(reply.target, Target::Nonce(nonce));
        assert_eq!(reply.args["responses"][0]["data"]["voice_count"], json!(4));
        assert_eq!(reply.args["responses"][0]["cluster_id"], json!(1));
    }

    #[tokio::test]
    async fn kill_command_signals_process() {
        let (bus, spawner) = bus();
        let supervisor = Arc::clone(&bus.supervisor);
        supervisor.supervise(ShardAssignment {
            cluster_id: ClusterId(1),
            total_shards: 2,
            shards: vec![1],
        });
        eventually(|| supervisor.current_pid(ClusterId(1)).is_some()).await;
        let pid = supervisor.current_pid(ClusterId(1)).unwrap();

        let frame = Envelope::kill(ClusterId(1), None).encode();
        bus.handle_envelope(ClusterId(0), &frame);

        assert_eq!(spawner.signals(), vec![(pid, SIGTERM)]);
        eventually(|| supervisor.clusters().is_empty()).await;
    }

    #[tokio::test]
    async fn kill_frame_without_args_uses_default_signal() {
        let (bus, spawner) = bus();
        let supervisor = Arc::clone(&bus.supervisor);
        supervisor.supervise(ShardAssignment {
            cluster_id: ClusterId(0),
            total_shards: 1,
            shards: vec![0],
        });
        eventually(|| supervisor.current_pid(ClusterId(0)).is_some()).await;
        let pid = supervisor.current_pid(ClusterId(0)).unwrap();

        bus.handle_envelope(ClusterId(1), r#"{"c": "kill", "t": 0}"#);

        assert_eq!(spawner.signals(), vec![(pid, SIGTERM)]);
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let (bus, _) = bus();
        let frame = Envelope::response(Uuid::new_v4(), json!({ "ping": true })).encode();
        bus.handle_envelope(ClusterId(0), &frame);
        assert!(bus.pending().is_empty());
    }
}
