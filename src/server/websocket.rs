//! Live progress WebSocket.
//!
//! Protocol:
//!   client -> server: `{"file_id": "<uuid>"}` subscribes to that file,
//!                     `{"type": "ping"}` is a keepalive.
//!   server -> client: progress frames (`progress` / `complete` / `error`),
//!                     `{"type": "pong"}`.
//!
//! The current store snapshot is sent right after each subscribe, AFTER
//! attaching to the bus, so the client sees at most one stale frame and
//! dedups by (stage, status, progress).

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::state::ServerState;
use crate::metrics;
use crate::progress::{ProgressFrame, SinkId};
use crate::store::FileStatus;

/// A silent client is disconnected after this long.
const WS_TIMEOUT: Duration = Duration::from_secs(300);

/// 1001 "going away", sent on inactivity.
const CLOSE_GOING_AWAY: u16 = 1001;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    metrics::WS_CONNECTIONS.inc();
    let (sink_id, mut frames, sender) = state.bus.register();
    debug!("WebSocket connected");

    let idle = tokio::time::sleep(WS_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            () = &mut idle => {
                info!("WebSocket inactivity timeout, closing");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "Inactivity timeout".into(),
                    })))
                    .await;
                break;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + WS_TIMEOUT);
                        handle_client_text(&text, &state, sink_id, &sender, &mut socket).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and low-level ping/pong are ignored; the
                        // protocol keepalive is the JSON ping.
                        idle.as_mut().reset(tokio::time::Instant::now() + WS_TIMEOUT);
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if send_json(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.bus.unsubscribe(sink_id).await;
    metrics::WS_CONNECTIONS.dec();
    debug!("WebSocket disconnected");
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn handle_client_text(
    text: &str,
    state: &ServerState,
    sink_id: SinkId,
    sender: &mpsc::Sender<ProgressFrame>,
    socket: &mut WebSocket,
) {
    let data: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            let _ = send_json(socket, &json!({"type": "error", "error": "Invalid JSON"})).await;
            return;
        }
    };

    if data.get("type").and_then(|t| t.as_str()) == Some("ping") {
        let _ = send_json(socket, &json!({"type": "pong"})).await;
        return;
    }

    let Some(file_id_raw) = data.get("file_id").and_then(|v| v.as_str()) else {
        let _ = send_json(socket, &json!({"type": "error", "error": "Missing file_id"})).await;
        return;
    };
    let file_id = match Uuid::parse_str(file_id_raw) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => {
            let _ = send_json(
                socket,
                &json!({"type": "error", "error": format!("Invalid file_id: {file_id_raw}")}),
            )
            .await;
            return;
        }
    };

    // Attach first, snapshot second: a transition landing in between is
    // delivered through the bus, and the client drops the duplicate.
    state.bus.subscribe(sink_id, sender.clone(), &file_id).await;
    info!("WebSocket subscribed to file {}", file_id);

    match state.store.get_file(&file_id) {
        Ok(Some(record)) => {
            let error = if record.status == FileStatus::Failed {
                record.error_message.clone()
            } else {
                None
            };
            let frame = ProgressFrame::new(
                &file_id,
                record.status,
                record.stage,
                record.progress,
                error,
            );
            let _ = send_json(socket, &frame).await;
        }
        Ok(None) => {
            let _ = send_json(
                socket,
                &json!({"type": "error", "file_id": file_id, "error": "File not found"}),
            )
            .await;
        }
        Err(e) => {
            debug!("Snapshot lookup failed for {}: {:#}", file_id, e);
        }
    }
}
