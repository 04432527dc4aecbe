//! Worker side of the cluster bus
//!
//! One WebSocket to the launcher at `{bus_url}/{cluster_id}`. Requests from
//! the launcher are answered from [`WorkerInfo`], `close` and `restart`
//! directives end the connection with a [`BusExit`], and the worker can relay
//! its own commands and requests through the launcher.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::protocol::{GatheredResponse, PendingRequests, ProtocolError, RequestArgs};
use chorus_core::{ClusterId, Command, Envelope, InfoKind, Target, WorkerExitCode};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::error::{Result, WorkerError};

/// What the launcher may ask a worker about.
pub trait WorkerInfo: Send + Sync {
    fn guild_count(&self) -> usize;
    fn voice_count(&self) -> usize;
    /// Whether this worker's shards include the support guild
    fn has_support(&self) -> bool;
    fn shards(&self) -> Vec<u32>;
}

/// Build the response object for a request. Unknown kinds answer `null`.
pub fn answer(info: &dyn WorkerInfo, kinds: &[InfoKind]) -> Value {
    let mut data = Map::new();
    for kind in kinds {
        let value = match kind {
            InfoKind::Ping => json!(true),
            InfoKind::GuildCount => json!(info.guild_count()),
            InfoKind::VoiceCount => json!(info.voice_count()),
            InfoKind::HasSupport => json!(info.has_support()),
            InfoKind::Shards => json!(info.shards()),
            InfoKind::Unknown => Value::Null,
        };
        data.insert(kind.key().to_string(), value);
    }
    Value::Object(data)
}

/// Why the bus connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusExit {
    /// The launcher is shutting the fleet down
    Close,
    /// The launcher wants this cluster respawned
    Restart,
    /// The connection dropped without a directive
    Disconnected,
}

impl BusExit {
    /// The process exit code that communicates this outcome to the launcher.
    pub fn exit_code(self) -> WorkerExitCode {
        match self {
            Self::Close => WorkerExitCode::KillEverything,
            Self::Restart | Self::Disconnected => WorkerExitCode::RestartCluster,
        }
    }
}

/// Handle for sending to the launcher. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    cluster_id: ClusterId,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<PendingRequests>,
    request_timeout: Duration,
}

impl BusClient {
    fn new(
        cluster_id: ClusterId,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let client = Self {
            cluster_id,
            outbound,
            pending: PendingRequests::new(),
            request_timeout,
        };
        (client, rx)
    }

    /// Connect to the launcher and start serving the connection.
    ///
    /// The returned task resolves when the connection ends.
    pub async fn connect(
        bus_url: &str,
        cluster_id: ClusterId,
        info: Arc<dyn WorkerInfo>,
        request_timeout: Duration,
    ) -> Result<(Self, JoinHandle<BusExit>)> {
        let url = format!("{}/{}", bus_url.trim_end_matches('/'), cluster_id);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|cause| WorkerError::BusConnect {
                url: url.clone(),
                cause,
            })?;
        tracing::info!(%url, "Connected to cluster bus");

        let (client, outbound) = Self::new(cluster_id, request_timeout);
        let task = tokio::spawn(client.clone().drive(socket, outbound, info));
        Ok((client, task))
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    fn write(&self, envelope: &Envelope) -> Result<()> {
        self.outbound
            .send(envelope.encode())
            .map_err(|_| WorkerError::BusClosed)
    }

    /// Ask the launcher to relay `command` to `target`.
    pub fn send(&self, target: Target, command: Command, args: Value) -> Result<()> {
        self.write(&Envelope::relay(command, args, target))
    }

    /// Ask the launcher to signal a cluster's process (SIGTERM by default).
    pub fn kill(&self, cluster_id: ClusterId, signal: Option<i32>) -> Result<()> {
        self.write(&Envelope::kill(cluster_id, signal))
    }

    /// Ask every cluster in `target` for `info`, through the launcher.
    pub async fn request(
        &self,
        info: Vec<InfoKind>,
        target: Target,
    ) -> Result<Vec<GatheredResponse>> {
        let nonce = Uuid::new_v4();
        let guard = self.pending.register(nonce, 1);
        self.write(&Envelope::request(info, nonce, target))?;

        let mut replies = guard
            .wait(self.request_timeout)
            .await
            .map_err(|_| WorkerError::BusTimeout { nonce })?;
        let Some(reply) = replies.pop() else {
            return Ok(Vec::new());
        };

        if let Some(message) = reply.data.get("error").and_then(Value::as_str) {
            return Err(WorkerError::RelayFailed {
                message: message.to_string(),
            });
        }
        let responses = reply.data.get("responses").cloned().unwrap_or_default();
        serde_json::from_value(responses).map_err(|cause| {
            ProtocolError::InvalidArgs {
                command: Command::Response,
                cause,
            }
            .into()
        })
    }

    /// Handle one frame from the launcher. Returns the exit reason for
    /// directives that end the connection.
    fn handle_frame(&self, info: &dyn WorkerInfo, frame: &str) -> Option<BusExit> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed bus frame");
                return None;
            }
        };

        match envelope.command {
            Command::Request => match envelope.args_as::<RequestArgs>() {
                Ok(request) => {
                    let reply = Envelope::response(request.nonce, answer(info, &request.info));
                    if self.write(&reply).is_err() {
                        tracing::warn!(nonce = %request.nonce, "Bus closed before reply");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed request"),
            },
            Command::Response => {
                if let Target::Nonce(nonce) = envelope.target {
                    self.pending.deliver(
                        nonce,
                        GatheredResponse {
                            cluster_id: None,
                            data: envelope.args,
                        },
                    );
                }
            }
            Command::Close => {
                tracing::info!("Launcher sent close");
                return Some(BusExit::Close);
            }
            Command::Restart => {
                tracing::warn!("Launcher requested restart");
                return Some(BusExit::Restart);
            }
            Command::Send | Command::Kill => {
                tracing::warn!(command = %envelope.command, "Unexpected launcher-bound command");
            }
        }
        None
    }

    async fn drive<S>(
        self,
        socket: S,
        mut outbound: mpsc::UnboundedReceiver<String>,
        info: Arc<dyn WorkerInfo>,
    ) -> BusExit
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let exit = loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break BusExit::Disconnected };
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        tracing::warn!(error = %e, "Failed to write to cluster bus");
                        break BusExit::Disconnected;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.handle_frame(info.as_ref(), &text) {
                            break exit;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            if let Some(exit) = self.handle_frame(info.as_ref(), text) {
                                break exit;
                            }
                        }
                        Err(_) => tracing::warn!("Ignoring non UTF-8 bus frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break BusExit::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Cluster bus connection error");
                        break BusExit::Disconnected;
                    }
                },
            }
        };

        let _ = sink.close().await;
        tracing::info!(cluster_id = %self.cluster_id, ?exit, "Cluster bus connection ended");
        exit
    }
}
