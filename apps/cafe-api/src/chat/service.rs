//! The command pipeline behind the gateway.
//!
//! Every inbound message runs the same ordered gauntlet: cheap validation,
//! then the rate limiter, then ban and mute checks, then duplicate detection,
//! and only then room delivery. Store failures on that path deny the send;
//! presence reads elsewhere fail open.

use std::sync::Arc;

use cafe_common::SnowflakeGenerator;

use super::agent::{AgentBackend, AgentService, EventSink};
use super::moderation::Moderator;
use super::pokes::{validate_poke, PokeOutcome, PokeService, PokeView};
use super::presence::{PresenceRegistry, PresenceSummary, Session};
use super::rate_limit::{RateAction, RateLimiter};
use super::room::{RoomService, DEFAULT_HISTORY_LIMIT};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::kv::KeyValueStore;
use crate::db::repo::Repository;
use crate::error::{ChatError, DenialReason, StoreError};
use crate::gateway::events::ServerEvent;
use crate::gateway::fanout::EventBus;
use crate::models::message::{ChatMessage, MESSAGE_TYPE_AGENT, MESSAGE_TYPE_USER};

pub const MAX_CONTENT_CHARS: usize = 1000;
pub const BADGE_CACHE_TTL_SECS: u64 = 3600;

pub fn badge_cache_key(user_id: &str) -> String {
    format!("badge:active:{user_id}")
}

/// Trimmed content, or why it cannot be sent.
pub fn validate_content(content: &str) -> Result<&str, ChatError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::ValidationFailed("Message cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::ValidationFailed(format!(
            "Message cannot exceed {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Result of a successful `join-room`.
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub session: Session,
    pub history: Vec<ChatMessage>,
    pub pending_pokes: Vec<PokeView>,
}

pub struct ChatService {
    kv: Arc<dyn KeyValueStore>,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    snowflake: Arc<SnowflakeGenerator>,
    bus: EventBus,
    pub presence: Arc<PresenceRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub moderator: Arc<Moderator>,
    pub room: Arc<RoomService>,
    pub pokes: Arc<PokeService>,
    pub agent: Arc<AgentService>,
}

impl ChatService {
    /// Wire every chat component over one store, repository and clock.
    pub fn assemble(
        kv: Arc<dyn KeyValueStore>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: &Config,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        let bus = EventBus::new(kv.clone());
        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            clock.clone(),
            config.rate_limits.clone(),
        ));
        Self {
            presence: Arc::new(PresenceRegistry::new(kv.clone(), clock.clone())),
            moderator: Arc::new(Moderator::new(kv.clone(), clock.clone())),
            room: Arc::new(RoomService::new(kv.clone(), repo.clone(), bus.clone())),
            pokes: Arc::new(PokeService::new(
                kv.clone(),
                repo.clone(),
                bus.clone(),
                clock.clone(),
            )),
            agent: Arc::new(AgentService::new(
                kv.clone(),
                limiter.clone(),
                backend,
                config.agent.username.clone(),
            )),
            snowflake: Arc::new(SnowflakeGenerator::new(config.worker_id)),
            limiter,
            bus,
            kv,
            repo,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Badge status, cached per user. Repository trouble reads as "no
    /// badge", the lower ceiling.
    pub async fn has_badge(&self, user_id: &str) -> Result<bool, StoreError> {
        let key = badge_cache_key(user_id);
        if let Some(cached) = self.kv.get(&key).await? {
            return Ok(cached == "1");
        }
        let active = match self.repo.has_active_badge(user_id, self.clock.now()).await {
            Ok(active) => active,
            Err(err) => {
                tracing::warn!(?err, %user_id, "badge lookup failed, using free tier");
                return Ok(false);
            }
        };
        self.kv
            .set_ex(&key, if active { "1" } else { "0" }, BADGE_CACHE_TTL_SECS)
            .await?;
        Ok(active)
    }

    pub async fn join_room(
        &self,
        user_id: &str,
        username: &str,
        cafe_id: &str,
        in_cafe: bool,
    ) -> Result<JoinedRoom, ChatError> {
        if self.moderator.is_banned(user_id).await? {
            return Err(ChatError::AccessDenied(DenialReason::Banned));
        }
        let session = self
            .presence
            .join(user_id, username, cafe_id, in_cafe)
            .await?;
        self.broadcast_users(cafe_id).await;

        let history = self.room.history(cafe_id, DEFAULT_HISTORY_LIMIT, 0).await?;
        let pending_pokes = match self.pokes.list_pending(user_id).await {
            Ok(pokes) => pokes,
            Err(err) => {
                tracing::warn!(?err, %user_id, "pending pokes unavailable on join");
                Vec::new()
            }
        };
        tracing::info!(%user_id, %cafe_id, session_id = %session.session_id, "joined room");
        Ok(JoinedRoom {
            session,
            history,
            pending_pokes,
        })
    }

    pub async fn leave_room(&self, session_id: &str) -> Result<(), ChatError> {
        if let Some(session) = self.presence.leave(session_id).await? {
            self.broadcast_users(&session.cafe_id).await;
        }
        Ok(())
    }

    pub async fn heartbeat(&self, session_id: &str) -> Result<Option<Session>, ChatError> {
        Ok(self.presence.heartbeat(session_id).await?)
    }

    pub async fn update_presence(&self, session_id: &str, in_cafe: bool) -> Result<(), ChatError> {
        let session = self
            .presence
            .update_presence(session_id, in_cafe)
            .await?
            .ok_or_else(|| ChatError::NotFound("Session expired, join the room again".into()))?;
        self.broadcast_users(&session.cafe_id).await;
        Ok(())
    }

    pub async fn send_message(
        &self,
        session: &Session,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let content = validate_content(content)?;

        let has_badge = self.has_badge(&session.user_id).await?;
        let decision = self
            .limiter
            .check(RateAction::Message {
                user_id: &session.user_id,
                has_badge,
            })
            .await?;
        if !decision.allowed {
            return Err(ChatError::RateLimited {
                action: "message",
                remaining: 0,
                reset_at: decision.reset_at,
            });
        }

        self.ensure_may_post(&session.cafe_id, &session.user_id).await?;

        let message = ChatMessage {
            id: self.snowflake.generate(),
            cafe_id: session.cafe_id.clone(),
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            content: content.to_string(),
            type_: MESSAGE_TYPE_USER,
            created_at: self.clock.now(),
        };

        if self
            .moderator
            .check_duplicate(&session.user_id, content)
            .await?
        {
            self.moderator
                .flag_message(
                    &session.cafe_id,
                    &message.id.to_string(),
                    &session.user_id,
                    "duplicate message",
                )
                .await?;
            self.moderator
                .record_strike(&session.cafe_id, &session.user_id)
                .await?;
            return Err(ChatError::Duplicate);
        }

        self.room.publish(&message).await?;
        Ok(message)
    }

    pub async fn set_typing(&self, session: &Session, is_typing: bool) -> Result<(), ChatError> {
        let event = ServerEvent::TypingIndicator {
            cafe_id: session.cafe_id.clone(),
            user_id: session.user_id.clone(),
            username: session.username.clone(),
            is_typing,
        };
        self.bus.to_room(&session.cafe_id, &event).await?;
        Ok(())
    }

    /// Ask the cafe assistant. The answer is streamed to `sink` and then
    /// posted to the room as an agent message.
    pub async fn mention_agent(
        &self,
        session: &Session,
        agent_username: &str,
        question: &str,
        sink: &EventSink,
    ) -> Result<ChatMessage, ChatError> {
        if !agent_username
            .trim_start_matches('@')
            .eq_ignore_ascii_case(self.agent.agent_username())
        {
            return Err(ChatError::NotFound(format!("Unknown agent {agent_username}")));
        }
        let question = validate_content(question)?;
        self.ensure_may_post(&session.cafe_id, &session.user_id).await?;

        let query_id = self.snowflake.generate().to_string();
        let answer = self
            .agent
            .ask(
                &session.cafe_id,
                &session.user_id,
                &session.session_id,
                &query_id,
                question,
                sink,
            )
            .await?;

        self.post_as_agent(&session.cafe_id, answer.content, MESSAGE_TYPE_AGENT)
            .await
    }

    /// Publish a message authored by the cafe assistant.
    pub async fn post_as_agent(
        &self,
        cafe_id: &str,
        content: String,
        type_: i16,
    ) -> Result<ChatMessage, ChatError> {
        let message = ChatMessage {
            id: self.snowflake.generate(),
            cafe_id: cafe_id.to_string(),
            user_id: self.agent.agent_username().to_string(),
            username: self.agent.agent_username().to_string(),
            content,
            type_,
            created_at: self.clock.now(),
        };
        self.room.publish(&message).await?;
        Ok(message)
    }

    pub async fn send_poke(
        &self,
        session: &Session,
        to_user_id: &str,
        shared_interest: &str,
    ) -> Result<PokeOutcome, ChatError> {
        validate_poke(&session.user_id, to_user_id, shared_interest)?;
        let decision = self
            .limiter
            .check(RateAction::Poke {
                user_id: &session.user_id,
            })
            .await?;
        if !decision.allowed {
            return Err(ChatError::RateLimited {
                action: "poke",
                remaining: 0,
                reset_at: decision.reset_at,
            });
        }
        if self.moderator.is_banned(&session.user_id).await? {
            return Err(ChatError::AccessDenied(DenialReason::Banned));
        }
        self.pokes
            .send(&session.cafe_id, &session.user_id, to_user_id, shared_interest)
            .await
    }

    pub async fn decline_poke(
        &self,
        session: &Session,
        from_user_id: &str,
    ) -> Result<PokeView, ChatError> {
        self.pokes.decline(&session.user_id, from_user_id).await
    }

    /// Current room counts to everyone in the room. Best effort.
    pub async fn broadcast_users(&self, cafe_id: &str) {
        let summary = self.presence.presence_summary(cafe_id).await;
        self.publish_users(cafe_id, summary).await;
    }

    async fn publish_users(&self, cafe_id: &str, summary: PresenceSummary) {
        let event = ServerEvent::UsersUpdate {
            cafe_id: cafe_id.to_string(),
            summary,
        };
        if let Err(err) = self.bus.to_room(cafe_id, &event).await {
            tracing::warn!(?err, %cafe_id, "users update not delivered");
        }
    }

    async fn ensure_may_post(&self, cafe_id: &str, user_id: &str) -> Result<(), ChatError> {
        if self.moderator.is_banned(user_id).await? {
            return Err(ChatError::AccessDenied(DenialReason::Banned));
        }
        if let Some(mute) = self.moderator.mute_record(cafe_id, user_id).await? {
            return Err(ChatError::AccessDenied(DenialReason::Muted {
                until: mute.until,
                reason: mute.reason,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tokio::sync::mpsc;

    use super::*;
    use crate::chat::agent::DisabledAgentBackend;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;
    use crate::db::repo::MemoryRepository;

    struct Fixture {
        chat: ChatService,
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let chat = ChatService::assemble(
            store.clone(),
            Arc::new(MemoryRepository::new()),
            Arc::new(clock.clone()),
            &Config::default(),
            Arc::new(DisabledAgentBackend),
        );
        Fixture { chat, store, clock }
    }

    async fn joined(f: &Fixture, user: &str) -> Session {
        f.chat
            .join_room(user, user, "c1", true)
            .await
            .unwrap()
            .session
    }

    #[test]
    fn content_is_trimmed_and_bounded() {
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
        assert!(validate_content("   ").is_err());
        assert!(validate_content(&"a".repeat(1000)).is_ok());
        assert!(validate_content(&"a".repeat(1001)).is_err());
    }

    #[tokio::test]
    async fn message_reaches_history() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        let sent = f.chat.send_message(&session, "  hello there  ").await.unwrap();
        assert_eq!(sent.content, "hello there");

        let history = f.chat.room.history("c1", 50, 0).await.unwrap();
        assert_eq!(history, vec![sent]);
    }

    #[tokio::test]
    async fn invalid_content_does_not_consume_quota() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        for _ in 0..40 {
            let err = f.chat.send_message(&session, "   ").await.unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        let status = f.chat.limiter.status("u1", false).await.unwrap();
        assert_eq!(status.message.used, 0);
    }

    #[tokio::test]
    async fn invalid_poke_does_not_consume_quota() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        for _ in 0..5 {
            let err = f.chat.send_poke(&session, "u1", "jazz").await.unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
            let err = f.chat.send_poke(&session, "u2", "   ").await.unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        let status = f.chat.limiter.status("u1", false).await.unwrap();
        assert_eq!(status.poke.used, 0);

        let outcome = f.chat.send_poke(&session, "u2", "jazz").await.unwrap();
        assert!(matches!(outcome, PokeOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn thirty_first_message_is_rate_limited() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        for i in 0..30 {
            f.chat
                .send_message(&session, &format!("message {i}"))
                .await
                .unwrap();
        }
        let err = f.chat.send_message(&session, "one more").await.unwrap_err();
        assert!(matches!(err, ChatError::RateLimited { action: "message", .. }));
    }

    #[tokio::test]
    async fn muted_user_is_denied_before_duplicate_check() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        f.chat.send_message(&session, "same words").await.unwrap();
        f.chat
            .moderator
            .record_mute("c1", "u1", 5, None)
            .await
            .unwrap();

        let err = f.chat.send_message(&session, "same words").await.unwrap_err();
        assert_eq!(err.code(), "MUTED");
        assert!(f.chat.moderator.flagged("c1").await.unwrap().is_empty());

        f.clock.advance(Duration::minutes(6));
        let err = f.chat.send_message(&session, "same words").await.unwrap_err();
        assert!(matches!(err, ChatError::Duplicate));
        assert_eq!(f.chat.moderator.flagged("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_duplicates_end_in_a_mute() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        f.chat.send_message(&session, "buy my mixtape").await.unwrap();
        for _ in 0..3 {
            let err = f
                .chat
                .send_message(&session, "buy my mixtape")
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::Duplicate));
        }
        assert!(f.chat.moderator.is_muted("c1", "u1").await.unwrap());
        let err = f.chat.send_message(&session, "something new").await.unwrap_err();
        assert_eq!(err.code(), "MUTED");
    }

    #[tokio::test]
    async fn banned_user_cannot_join() {
        let f = fixture();
        f.chat.moderator.ban("u9", Some("abuse")).await.unwrap();
        let err = f.chat.join_room("u9", "u9", "c1", false).await.unwrap_err();
        assert_eq!(err.code(), "BANNED");
    }

    #[tokio::test]
    async fn send_fails_closed_when_store_is_down() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        f.store.set_unavailable(true);

        let err = f.chat.send_message(&session, "hello").await.unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        // presence reads fail open
        let summary = f.chat.presence.presence_summary("c1").await;
        assert_eq!(summary, PresenceSummary::default());
    }

    #[tokio::test]
    async fn badge_status_is_cached() {
        let f = fixture();
        assert!(!f.chat.has_badge("u1").await.unwrap());
        assert_eq!(
            f.store.get(&badge_cache_key("u1")).await.unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn agent_mention_requires_known_name() {
        let f = fixture();
        let session = joined(&f, "u1").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = f
            .chat
            .mention_agent(&session, "@someone", "menu?", &tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        // known name, but no backend configured
        let err = f
            .chat
            .mention_agent(&session, "@Barista", "menu?", &tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_FAILURE");
    }
}
