//! Command dispatch: IDENTIFY, then one handler per client command.

use chrono::{DateTime, Utc};

use crate::auth::tokens;
use crate::chat::agent::EventSink;
use crate::chat::pokes::PokeOutcome;
use crate::error::{ChatError, DenialReason};
use crate::AppState;

use super::events::{ClientCommand, ServerEvent};
use super::session::GatewaySession;

/// Heartbeat interval clients are expected to honour (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Redeem the IDENTIFY ticket. Returns the new connection state on success.
pub async fn handle_identify(
    state: &AppState,
    ticket: &str,
) -> Result<GatewaySession, &'static str> {
    let data = tokens::consume_ws_ticket(state.kv.as_ref(), ticket)
        .await
        .map_err(|_| "Ticket lookup failed")?
        .ok_or("Invalid or expired ticket")?;

    let banned = state
        .chat
        .moderator
        .is_banned(&data.user_id)
        .await
        .map_err(|_| "Ban lookup failed")?;
    if banned {
        return Err("User is banned");
    }

    Ok(GatewaySession::new(data.user_id, data.username))
}

/// Run one command for `conn`. Replies meant only for this connection go to
/// `sink`; room-wide effects travel through the event bus.
pub async fn handle_command(
    state: &AppState,
    conn: &mut GatewaySession,
    command: ClientCommand,
    sink: &EventSink,
) -> Result<(), ChatError> {
    if !matches!(
        command,
        ClientCommand::Identify { .. }
            | ClientCommand::JoinRoom { .. }
            | ClientCommand::LeaveRoom { .. }
    ) {
        refresh_presence(state, conn, sink).await?;
    }

    let chat = &state.chat;
    match command {
        ClientCommand::Identify { .. } => Err(ChatError::ValidationFailed(
            "Already identified".into(),
        )),
        ClientCommand::JoinRoom { cafe_id, in_cafe } => {
            if let Some(previous) = conn.exit() {
                chat.leave_room(&previous.session_id).await?;
            }
            let joined = chat
                .join_room(&conn.user_id, &conn.username, &cafe_id, in_cafe)
                .await?;
            let _ = sink.send(ServerEvent::RoomJoined {
                cafe_id,
                session_id: joined.session.session_id.clone(),
                history: joined.history,
                pending_pokes: joined.pending_pokes,
            });
            conn.enter(joined.session);
            Ok(())
        }
        ClientCommand::LeaveRoom { cafe_id } => {
            let session_id = conn.joined(&cafe_id)?.session_id.clone();
            conn.exit();
            chat.leave_room(&session_id).await
        }
        ClientCommand::SendMessage { cafe_id, content } => {
            let session = conn.joined(&cafe_id)?;
            chat.send_message(session, &content).await.map(|_| ())
        }
        ClientCommand::StartTyping { cafe_id } => {
            chat.set_typing(conn.joined(&cafe_id)?, true).await
        }
        ClientCommand::StopTyping { cafe_id } => {
            chat.set_typing(conn.joined(&cafe_id)?, false).await
        }
        ClientCommand::MentionAgent {
            cafe_id,
            agent_username,
            question,
        } => {
            // The answer can take a while; keep reading this socket meanwhile.
            let session = conn.joined(&cafe_id)?.clone();
            let chat = chat.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Err(err) = chat
                    .mention_agent(&session, &agent_username, &question, &sink)
                    .await
                {
                    let _ = sink.send(error_event(&err, chat.clock().now()));
                }
            });
            Ok(())
        }
        ClientCommand::SendPoke {
            to_user_id,
            shared_interest,
        } => {
            let session = conn.current()?;
            match chat.send_poke(session, &to_user_id, &shared_interest).await? {
                PokeOutcome::Sent(_) | PokeOutcome::Matched { .. } => Ok(()),
                PokeOutcome::AlreadyPending => {
                    let _ = sink.send(ServerEvent::error(
                        "POKE_ALREADY_PENDING",
                        "You already poked this user",
                    ));
                    Ok(())
                }
                PokeOutcome::AlreadyMatched => {
                    let _ = sink.send(ServerEvent::error(
                        "ALREADY_MATCHED",
                        "You are already matched with this user",
                    ));
                    Ok(())
                }
                PokeOutcome::Declined => {
                    let _ = sink.send(ServerEvent::error(
                        "POKE_DECLINED",
                        "This user declined your poke",
                    ));
                    Ok(())
                }
            }
        }
        ClientCommand::DeclinePoke { from_user_id } => {
            let session = conn.current()?;
            chat.decline_poke(session, &from_user_id).await.map(|_| ())
        }
        ClientCommand::UpdatePresence { in_cafe } => {
            let session_id = conn.current()?.session_id.clone();
            let result = chat.update_presence(&session_id, in_cafe).await;
            if matches!(result, Err(ChatError::NotFound(_))) {
                conn.exit();
            }
            result
        }
        ClientCommand::Heartbeat => {
            let _ = sink.send(ServerEvent::HeartbeatAck);
            Ok(())
        }
    }
}

/// Every frame from a joined connection counts as activity for its session.
/// A session that already lapsed is dropped and the client told to rejoin.
async fn refresh_presence(
    state: &AppState,
    conn: &mut GatewaySession,
    sink: &EventSink,
) -> Result<(), ChatError> {
    let Some(session) = conn.room() else {
        return Ok(());
    };
    let session_id = session.session_id.clone();
    if state.chat.heartbeat(&session_id).await?.is_none() {
        conn.exit();
        let _ = sink.send(ServerEvent::error(
            "SESSION_EXPIRED",
            "Session expired, join the room again",
        ));
    }
    Ok(())
}

/// The event a rejected command produces for its sender.
pub fn error_event(err: &ChatError, now: DateTime<Utc>) -> ServerEvent {
    match err {
        ChatError::RateLimited {
            action, reset_at, ..
        } => ServerEvent::RateLimitNotice {
            action: (*action).to_string(),
            message: format!("Too many {action} requests, try again later"),
            reset_at: *reset_at,
            seconds_until_reset: (*reset_at - now).num_seconds().max(0),
        },
        ChatError::AccessDenied(DenialReason::Muted { until, reason }) => {
            let message = match reason {
                Some(reason) => format!("You are muted until {until}: {reason}"),
                None => format!("You are muted until {until}"),
            };
            ServerEvent::error(err.code(), message)
        }
        ChatError::AccessDenied(DenialReason::Banned) => {
            ServerEvent::error(err.code(), "You are banned")
        }
        ChatError::StoreUnavailable(_) => {
            ServerEvent::error(err.code(), "Service temporarily unavailable")
        }
        ChatError::ValidationFailed(message)
        | ChatError::NotFound(message)
        | ChatError::UpstreamFailure(message) => ServerEvent::error(err.code(), message.clone()),
        ChatError::Duplicate => {
            ServerEvent::error(err.code(), "Duplicate message")
        }
        ChatError::Internal(message) => ServerEvent::error(err.code(), message.clone()),
    }
}
