//! Fixed-window rate limiting with explicit reset.
//!
//! A window is `{count, reset_at}` stored as a hash. Once `now > reset_at` the
//! next hit replaces the window with a fresh count of 1; it is never corrected
//! incrementally. The hit itself is a single atomic store call
//! ([`KeyValueStore::window_hit`]), so concurrent processes cannot lose
//! updates.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::db::kv::{KeyValueStore, WindowHit};
use crate::error::StoreError;

pub const AGENT_GLOBAL_KEY: &str = "rl:agent_global";

pub fn message_key(user_id: &str) -> String {
    format!("rl:message:{user_id}")
}

pub fn poke_key(user_id: &str) -> String {
    format!("rl:poke:{user_id}")
}

pub fn agent_key(user_id: &str, session_id: &str) -> String {
    format!("rl:agent:{user_id}:{session_id}")
}

/// What is being limited, and for whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAction<'a> {
    Message { user_id: &'a str, has_badge: bool },
    Poke { user_id: &'a str },
    AgentPersonal { user_id: &'a str, session_id: &'a str },
    AgentGlobal,
}

impl RateAction<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            RateAction::Message { .. } => "message",
            RateAction::Poke { .. } => "poke",
            RateAction::AgentPersonal { .. } => "agent",
            RateAction::AgentGlobal => "agent_global",
        }
    }

    fn key(&self) -> String {
        match self {
            RateAction::Message { user_id, .. } => message_key(user_id),
            RateAction::Poke { user_id } => poke_key(user_id),
            RateAction::AgentPersonal { user_id, session_id } => agent_key(user_id, session_id),
            RateAction::AgentGlobal => AGENT_GLOBAL_KEY.to_string(),
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Read-only view of one window, as reported by [`RateLimiter::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatus {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    /// `None` when no window is open.
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub message: WindowStatus,
    pub poke: WindowStatus,
    pub agent_global: WindowStatus,
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    limits: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, limits: RateLimitConfig) -> Self {
        Self { kv, clock, limits }
    }

    /// `(limit, window_secs)` for an action. The message ceiling is chosen
    /// from the badge status passed in now, not the one the window was opened
    /// under.
    fn limit_for(&self, action: &RateAction<'_>) -> (u64, u64) {
        let l = &self.limits;
        match action {
            RateAction::Message { has_badge: true, .. } => (l.messages_badge, l.message_window_secs),
            RateAction::Message { has_badge: false, .. } => (l.messages_free, l.message_window_secs),
            RateAction::Poke { .. } => (l.pokes, l.poke_window_secs),
            RateAction::AgentPersonal { .. } => (l.agent_personal, l.agent_personal_window_secs),
            RateAction::AgentGlobal => (l.agent_global, l.agent_global_window_secs),
        }
    }

    /// Consume one token for `action` if the window allows it.
    pub async fn check(&self, action: RateAction<'_>) -> Result<RateDecision, StoreError> {
        let (limit, window_secs) = self.limit_for(&action);
        let hit = self
            .kv
            .window_hit(&action.key(), limit, window_secs as i64 * 1000, self.clock.now_ms())
            .await?;
        let decision = decision_from_hit(hit, limit);
        if !decision.allowed {
            tracing::debug!(action = action.name(), reset_at = %decision.reset_at, "rate limit hit");
        }
        Ok(decision)
    }

    /// Agent queries pass two gates: the caller's personal window and the
    /// shared cooldown. The cooldown is peeked first so a busy cooldown never
    /// burns a personal token.
    pub async fn check_agent(&self, user_id: &str, session_id: &str) -> Result<RateDecision, StoreError> {
        let (global_limit, _) = self.limit_for(&RateAction::AgentGlobal);
        let global = self.peek(AGENT_GLOBAL_KEY, global_limit).await?;
        if let Some(reset_at) = global.reset_at {
            if global.remaining == 0 {
                return Ok(RateDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at,
                });
            }
        }

        let personal = self
            .check(RateAction::AgentPersonal { user_id, session_id })
            .await?;
        if !personal.allowed {
            return Ok(personal);
        }

        let global = self.check(RateAction::AgentGlobal).await?;
        if !global.allowed {
            return Ok(global);
        }
        Ok(personal)
    }

    /// Administrative reset: clears every user-scoped window. The shared
    /// agent cooldown is left alone.
    pub async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.del(&message_key(user_id)).await?;
        self.kv.del(&poke_key(user_id)).await?;
        for key in self.kv.scan_prefix(&format!("rl:agent:{user_id}:")).await? {
            self.kv.del(&key).await?;
        }
        tracing::info!(%user_id, "rate limits reset");
        Ok(())
    }

    /// Snapshot without consuming anything.
    pub async fn status(&self, user_id: &str, has_badge: bool) -> Result<RateLimitStatus, StoreError> {
        let (message_limit, _) = self.limit_for(&RateAction::Message { user_id, has_badge });
        let (poke_limit, _) = self.limit_for(&RateAction::Poke { user_id });
        let (global_limit, _) = self.limit_for(&RateAction::AgentGlobal);
        Ok(RateLimitStatus {
            message: self.peek(&message_key(user_id), message_limit).await?,
            poke: self.peek(&poke_key(user_id), poke_limit).await?,
            agent_global: self.peek(AGENT_GLOBAL_KEY, global_limit).await?,
        })
    }

    async fn peek(&self, key: &str, limit: u64) -> Result<WindowStatus, StoreError> {
        let fields = self.kv.hgetall(key).await?;
        let count = fields.get("count").and_then(|v| v.parse::<u64>().ok());
        let reset_at = fields.get("reset_at").and_then(|v| v.parse::<i64>().ok());

        Ok(match count.zip(reset_at) {
            Some((used, reset_at)) if self.clock.now_ms() <= reset_at => WindowStatus {
                limit,
                used,
                remaining: limit.saturating_sub(used),
                reset_at: Some(ms_to_datetime(reset_at)),
            },
            _ => WindowStatus {
                limit,
                used: 0,
                remaining: limit,
                reset_at: None,
            },
        })
    }
}

fn decision_from_hit(hit: WindowHit, limit: u64) -> RateDecision {
    RateDecision {
        allowed: hit.allowed,
        remaining: if hit.allowed {
            limit.saturating_sub(hit.count)
        } else {
            0
        },
        reset_at: ms_to_datetime(hit.reset_at_ms),
    }
}
