use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::models::DealStage;
use super::pipeline::{DragState, drop_deal};
use super::sync::TableCounts;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    DataRefreshed {
        counts: TableCounts,
        refresh_count: u64,
    },
    RefreshFailed {
        error: String,
    },
    DealStageChanged {
        deal_id: String,
        stage: DealStage,
    },
    DealDeleted {
        deal_id: String,
    },
    IncidentsRefreshed {
        count: usize,
    },

    // Replies to the connection driving a drag
    DragUpdated {
        state: DragState,
    },
    DropAllowed {
        stage: DealStage,
        allowed: bool,
    },
    DragError {
        message: String,
    },
}

/// Messages a board client may send over its socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    DragStart { deal_id: String },
    DragOver { stage: DealStage },
    DragCancel,
    Drop { stage: DealStage },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    tracing::debug!("websocket client connected");
    run_socket_loop(sender, receiver, rx, state).await;
    tracing::debug!("websocket client disconnected");
}

/// Apply one client message to this connection's drag state and produce the
/// reply for that connection. A successful drop is also broadcast.
pub async fn handle_client_text(state: &SharedState, drag: &mut DragState, text: &str) -> WsMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return WsMessage::DragError {
                message: format!("Invalid client message: {}", e),
            };
        }
    };
    match msg {
        ClientMessage::DragStart { deal_id } => {
            drag.start(deal_id);
            WsMessage::DragUpdated {
                state: drag.clone(),
            }
        }
        ClientMessage::DragOver { stage } => WsMessage::DropAllowed {
            stage,
            allowed: drag.drag_over(stage),
        },
        ClientMessage::DragCancel => {
            drag.cancel();
            WsMessage::DragUpdated {
                state: drag.clone(),
            }
        }
        ClientMessage::Drop { stage } => match drop_deal(&state.crm, drag, stage).await {
            Ok(deal) => {
                broadcast_message(
                    &state.ws_tx,
                    &WsMessage::DealStageChanged {
                        deal_id: deal.id,
                        stage: deal.stage,
                    },
                );
                WsMessage::DragUpdated {
                    state: drag.clone(),
                }
            }
            Err(e) => WsMessage::DragError {
                message: e.to_string(),
            },
        },
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    state: SharedState,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;
    let mut drag = DragState::default();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_text(&state, &mut drag, text.as_str()).await;
                        let Ok(json) = serde_json::to_string(&reply) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize websocket message");
        }
    }
}
