//! Gateway wire format: inbound commands and outbound events.
//!
//! Both directions are closed, internally tagged enums (`{"type": "...", ...}`)
//! so every event carries exactly the fields it needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::pokes::PokeView;
use crate::chat::presence::PresenceSummary;
use crate::chat::topics::TopicCount;
use crate::models::message::ChatMessage;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Must be the first frame on a connection.
    Identify { ticket: String },
    JoinRoom {
        cafe_id: String,
        #[serde(default)]
        in_cafe: bool,
    },
    LeaveRoom { cafe_id: String },
    SendMessage { cafe_id: String, content: String },
    StartTyping { cafe_id: String },
    StopTyping { cafe_id: String },
    MentionAgent {
        cafe_id: String,
        agent_username: String,
        question: String,
    },
    SendPoke {
        to_user_id: String,
        shared_interest: String,
    },
    DeclinePoke { from_user_id: String },
    UpdatePresence { in_cafe: bool },
    Heartbeat,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Ready {
        user_id: String,
        username: String,
    },
    RoomJoined {
        cafe_id: String,
        session_id: String,
        history: Vec<ChatMessage>,
        pending_pokes: Vec<PokeView>,
    },
    MessageNew {
        message: ChatMessage,
    },
    UsersUpdate {
        cafe_id: String,
        #[serde(flatten)]
        summary: PresenceSummary,
    },
    TypingIndicator {
        cafe_id: String,
        user_id: String,
        username: String,
        is_typing: bool,
    },
    TopicsUpdate {
        cafe_id: String,
        topics: Vec<TopicCount>,
    },
    RateLimitNotice {
        action: String,
        message: String,
        reset_at: DateTime<Utc>,
        seconds_until_reset: i64,
    },
    AgentResponseStart {
        query_id: String,
        cafe_id: String,
    },
    AgentResponseChunk {
        query_id: String,
        chunk: String,
    },
    AgentResponseComplete {
        query_id: String,
        content: String,
        cached: bool,
    },
    PokeReceived {
        poke_id: String,
        shared_interest: String,
    },
    PokeMatched {
        matched_user: String,
        channel_id: String,
        shared_interest: String,
    },
    HeartbeatAck,
    Error {
        message: String,
        code: String,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            code: code.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready { .. } => "ready",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::MessageNew { .. } => "message-new",
            ServerEvent::UsersUpdate { .. } => "users-update",
            ServerEvent::TypingIndicator { .. } => "typing-indicator",
            ServerEvent::TopicsUpdate { .. } => "topics-update",
            ServerEvent::RateLimitNotice { .. } => "rate-limit-notice",
            ServerEvent::AgentResponseStart { .. } => "agent-response-start",
            ServerEvent::AgentResponseChunk { .. } => "agent-response-chunk",
            ServerEvent::AgentResponseComplete { .. } => "agent-response-complete",
            ServerEvent::PokeReceived { .. } => "poke-received",
            ServerEvent::PokeMatched { .. } => "poke-matched",
            ServerEvent::HeartbeatAck => "heartbeat-ack",
            ServerEvent::Error { .. } => "error",
        }
    }
}
