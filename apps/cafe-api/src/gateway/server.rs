//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::AppState;

use super::events::{ClientCommand, ServerEvent};
use super::fanout::BroadcastPayload;
use super::handler::{error_event, handle_command, handle_identify, HEARTBEAT_INTERVAL_MS};
use super::session::GatewaySession;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: wait for IDENTIFY within timeout.
    let identify = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => return Err("client closed"),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            return match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Identify { ticket }) => Ok(ticket),
                Ok(_) => Err("Expected IDENTIFY"),
                Err(_) => Err("Invalid JSON"),
            };
        }
        Err("connection closed before identify")
    })
    .await;

    let ticket = match identify {
        Ok(Ok(ticket)) => ticket,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    let conn = match handle_identify(&state, &ticket).await {
        Ok(conn) => conn,
        Err(reason) => {
            tracing::debug!(%reason, "identify failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    let ready = ServerEvent::Ready {
        user_id: conn.user_id.clone(),
        username: conn.username.clone(),
    };
    if !send_event(&mut ws_tx, &ready).await {
        return;
    }
    tracing::info!(user_id = %conn.user_id, "gateway connection established");

    // Subscribe before anything can be published on this user's behalf.
    let broadcast_rx = state.broadcast.subscribe();
    let mut conn = run_session(&state, conn, ws_tx, ws_rx, broadcast_rx).await;

    if let Some(session) = conn.exit() {
        if let Err(err) = state.chat.leave_room(&session.session_id).await {
            tracing::warn!(?err, session_id = %session.session_id, "leave on disconnect failed");
        }
    }
    tracing::info!(user_id = %conn.user_id, "gateway connection ended");
}

/// Main loop: run client commands in arrival order, forward broadcasts and
/// direct replies, enforce the heartbeat. Returns the connection state for
/// cleanup.
async fn run_session(
    state: &AppState,
    mut conn: GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) -> GatewaySession {
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let command = match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(command) => command,
                            Err(e) => {
                                tracing::debug!(%e, user_id = %conn.user_id, "unparseable command");
                                let event = ServerEvent::error("INVALID_COMMAND", "Unrecognised command");
                                if !send_event(&mut ws_tx, &event).await {
                                    break;
                                }
                                continue;
                            }
                        };
                        if matches!(command, ClientCommand::Identify { .. }) {
                            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                            break;
                        }
                        if matches!(command, ClientCommand::Heartbeat) {
                            got_heartbeat = true;
                        }
                        if let Err(err) = handle_command(state, &mut conn, command, &direct_tx).await {
                            let event = error_event(&err, state.clock.now());
                            if !send_event(&mut ws_tx, &event).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, user_id = %conn.user_id, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                }
            }

            Some(event) = direct_rx.recv() => {
                if !send_event(&mut ws_tx, &event).await {
                    break;
                }
            }

            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !conn.wants(&payload.audience) {
                            continue;
                        }
                        if ws_tx.send(Message::Text(payload.json.clone().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(user_id = %conn.user_id, skipped = n, "gateway connection lagged behind broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(user_id = %conn.user_id, "heartbeat timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
    conn
}

/// Serialize and send one event. Returns `false` once the socket is gone.
async fn send_event(ws_tx: &mut WsSink, event: &ServerEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(%e, event = event.name(), "failed to serialize event");
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
