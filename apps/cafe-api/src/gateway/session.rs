//! Per-connection gateway state.

use crate::chat::presence::Session;
use crate::error::ChatError;

use super::fanout::Audience;

/// State for a single WebSocket connection.
pub struct GatewaySession {
    /// Authenticated user ID (from the redeemed ticket).
    pub user_id: String,
    pub username: String,
    /// Presence session of the room this connection joined, if any.
    room: Option<Session>,
}

impl GatewaySession {
    pub fn new(user_id: String, username: String) -> Self {
        Self {
            user_id,
            username,
            room: None,
        }
    }

    pub fn room(&self) -> Option<&Session> {
        self.room.as_ref()
    }

    pub fn enter(&mut self, session: Session) {
        self.room = Some(session);
    }

    pub fn exit(&mut self) -> Option<Session> {
        self.room.take()
    }

    /// The joined room's session, provided the command names that room.
    pub fn joined(&self, cafe_id: &str) -> Result<&Session, ChatError> {
        match &self.room {
            Some(session) if session.cafe_id == cafe_id => Ok(session),
            Some(_) => Err(ChatError::ValidationFailed(format!(
                "Not joined to cafe {cafe_id}"
            ))),
            None => Err(ChatError::ValidationFailed("Join a room first".into())),
        }
    }

    /// The joined room's session for commands that do not name a room.
    pub fn current(&self) -> Result<&Session, ChatError> {
        self.room
            .as_ref()
            .ok_or_else(|| ChatError::ValidationFailed("Join a room first".into()))
    }

    /// Whether an event for `audience` belongs on this connection.
    pub fn wants(&self, audience: &Audience) -> bool {
        match audience {
            Audience::User(user_id) => *user_id == self.user_id,
            Audience::Room(cafe_id) => self
                .room
                .as_ref()
                .is_some_and(|session| session.cafe_id == *cafe_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn session_in(cafe_id: &str) -> Session {
        Session {
            session_id: "ses_1".into(),
            user_id: "u1".into(),
            username: "ana".into(),
            cafe_id: cafe_id.into(),
            connected_at: Utc::now(),
            last_activity: Utc::now(),
            in_cafe: false,
        }
    }

    #[test]
    fn filters_by_room_and_user() {
        let mut conn = GatewaySession::new("u1".into(), "ana".into());
        assert!(conn.wants(&Audience::User("u1".into())));
        assert!(!conn.wants(&Audience::User("u2".into())));
        assert!(!conn.wants(&Audience::Room("c1".into())));

        conn.enter(session_in("c1"));
        assert!(conn.wants(&Audience::Room("c1".into())));
        assert!(!conn.wants(&Audience::Room("c2".into())));

        conn.exit();
        assert!(!conn.wants(&Audience::Room("c1".into())));
    }

    #[test]
    fn commands_must_name_the_joined_room() {
        let mut conn = GatewaySession::new("u1".into(), "ana".into());
        assert!(conn.joined("c1").is_err());
        assert!(conn.current().is_err());
        conn.enter(session_in("c1"));
        assert!(conn.joined("c1").is_ok());
        assert!(conn.joined("c2").is_err());
    }
}
