//! Observer WebSockets
//!
//! `/requests` streams every request summary published after the client
//! connects. `/requests/details/{id}` replays and then follows one
//! request's detail chunks. A slow or broken observer is disconnected
//! without touching the record or other observers.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capture::{DataChunk, DataType};

use super::AppState;

/// An observer blocked longer than this is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn requests_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| summary_session(socket, state))
}

async fn summary_session(mut socket: WebSocket, state: AppState) {
    info!("summary observer connected");
    let mut summaries = state.bus.subscribe();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            received = summaries.recv() => match received {
                Ok(summary) => {
                    if !send_json(&mut socket, &summary).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "summary observer lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }
    info!("summary observer disconnected");
}

pub async fn details_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| detail_session(socket, id, state))
}

async fn detail_session(mut socket: WebSocket, raw_id: String, state: AppState) {
    info!(id = %raw_id, "detail observer connected");

    let record = match raw_id.parse::<i64>() {
        Ok(id) => match state.registry.get(id) {
            Some(record) => record,
            None => {
                send_error_chunk(socket, "Detail info has been cleaned!").await;
                return;
            }
        },
        Err(_) => {
            send_error_chunk(socket, "Invalid request ID format").await;
            return;
        }
    };

    let mut chunks = record.subscribe_details();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    if !send_json(&mut socket, &chunk).await {
                        debug!(id = record.id(), "detail observer dropped mid-stream");
                        break;
                    }
                }
                // Stream complete.
                None => break,
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }
    let _ = socket.close().await;
    info!(id = record.id(), "detail observer disconnected");
}

async fn send_error_chunk(mut socket: WebSocket, message: &str) {
    let chunk = DataChunk::new(DataType::Error, message.as_bytes().to_vec(), true);
    let _ = send_json(&mut socket, &chunk).await;
    let _ = socket.close().await;
}

/// Serializes and sends one value; false means the observer is gone or
/// too slow to keep.
async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to serialize observer message");
            return true;
        }
    };
    matches!(
        tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(text.into()))).await,
        Ok(Ok(()))
    )
}
