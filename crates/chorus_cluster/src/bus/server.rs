//! WebSocket endpoint workers connect to: `GET /{cluster_id}`

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use chorus_core::ClusterId;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::ClusterBus;
use crate::error::BusError;

pub fn router(bus: Arc<ClusterBus>) -> Router {
    Router::new()
        .route("/:cluster_id", get(upgrade))
        .with_state(bus)
}

/// Serve the bus on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    bus: Arc<ClusterBus>,
    cancel: CancellationToken,
) -> Result<(), BusError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Cluster bus listening");
    }

    axum::serve(listener, router(bus))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(BusError::Serve)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(cluster_id): Path<u32>,
    State(bus): State<Arc<ClusterBus>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ClusterId(cluster_id), bus))
}

async fn handle_socket(socket: WebSocket, cluster_id: ClusterId, bus: Arc<ClusterBus>) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = bus.register_connection(cluster_id);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                // None: a newer connection for this cluster replaced us
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => bus.handle_envelope(cluster_id, &text),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => bus.handle_envelope(cluster_id, text),
                        Err(_) => tracing::warn!(%cluster_id, "Ignoring non UTF-8 bus frame"),
                    },
                    Ok(Message::Ping(payload)) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!(%cluster_id, error = %e, "Bus connection error");
                        break;
                    }
                }
            }
        }
    }

    bus.disconnect(connection);
    let _ = sender.close().await;
}
