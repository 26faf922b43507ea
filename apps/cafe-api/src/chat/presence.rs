//! Store-backed presence and session registry.
//!
//! Presence is shared across processes: every session lives under its own
//! key with a liveness TTL, and each room keeps a session set, a member set,
//! and an in-cafe sorted set scored by last-seen time. A process that crashes
//! simply stops refreshing TTLs and its sessions fall out on their own.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use cafe_common::id::{prefix, prefixed_ulid};

use crate::clock::Clock;
use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Session liveness window.
pub const SESSION_TTL_SECS: u64 = 30 * 60;

fn session_key(session_id: &str) -> String {
    format!("presence:session:{session_id}")
}

fn room_sessions_key(cafe_id: &str) -> String {
    format!("presence:room:{cafe_id}:sessions")
}

fn room_members_key(cafe_id: &str) -> String {
    format!("presence:room:{cafe_id}:members")
}

fn room_in_cafe_key(cafe_id: &str) -> String {
    format!("presence:room:{cafe_id}:in_cafe")
}

/// One active connection joined to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub cafe_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub in_cafe: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSummary {
    pub total: u64,
    pub in_cafe: u64,
}

pub struct PresenceRegistry {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl PresenceRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Register a new session in `cafe_id` and return it.
    pub async fn join(
        &self,
        user_id: &str,
        username: &str,
        cafe_id: &str,
        in_cafe: bool,
    ) -> Result<Session, StoreError> {
        let now = self.clock.now();
        let session = Session {
            session_id: prefixed_ulid(prefix::SESSION),
            user_id: user_id.to_string(),
            username: username.to_string(),
            cafe_id: cafe_id.to_string(),
            connected_at: now,
            last_activity: now,
            in_cafe,
        };

        self.store(&session).await?;
        self.kv
            .sadd(&room_sessions_key(cafe_id), &session.session_id)
            .await?;
        self.kv.sadd(&room_members_key(cafe_id), user_id).await?;
        if in_cafe {
            self.stamp_in_cafe(&session).await?;
        }

        tracing::debug!(
            session_id = %session.session_id,
            %user_id,
            %cafe_id,
            in_cafe,
            "presence session joined"
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let Some(raw) = self.kv.get(&session_key(session_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: session_key(session_id),
                reason: e.to_string(),
            })
    }

    /// Refresh liveness. Returns the session, or `None` if it already expired.
    pub async fn heartbeat(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(None);
        };
        session.last_activity = self.clock.now();
        self.store(&session).await?;
        if session.in_cafe {
            self.stamp_in_cafe(&session).await?;
        }
        Ok(Some(session))
    }

    /// Flip the physically-present flag of a session.
    pub async fn update_presence(
        &self,
        session_id: &str,
        in_cafe: bool,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(None);
        };
        session.in_cafe = in_cafe;
        session.last_activity = self.clock.now();
        self.store(&session).await?;

        if in_cafe {
            self.stamp_in_cafe(&session).await?;
        } else if !self
            .user_has_other_session(&session, |other| other.in_cafe)
            .await?
        {
            self.kv
                .zrem(&room_in_cafe_key(&session.cafe_id), &session.user_id)
                .await?;
        }
        Ok(Some(session))
    }

    /// Remove a session. Unknown or already-expired sessions are a no-op.
    pub async fn leave(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(None);
        };
        self.kv.del(&session_key(session_id)).await?;
        self.kv
            .srem(&room_sessions_key(&session.cafe_id), session_id)
            .await?;

        if !self.user_has_other_session(&session, |_| true).await? {
            self.kv
                .srem(&room_members_key(&session.cafe_id), &session.user_id)
                .await?;
            self.kv
                .zrem(&room_in_cafe_key(&session.cafe_id), &session.user_id)
                .await?;
        }
        tracing::debug!(%session_id, cafe_id = %session.cafe_id, "presence session left");
        Ok(Some(session))
    }

    /// Live sessions of a room. Ids whose session key has expired are pruned,
    /// along with members left without any live session.
    pub async fn room_sessions(&self, cafe_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut live = Vec::new();
        let mut pruned = false;
        for session_id in self.kv.smembers(&room_sessions_key(cafe_id)).await? {
            match self.get(&session_id).await? {
                Some(session) => live.push(session),
                None => {
                    self.kv.srem(&room_sessions_key(cafe_id), &session_id).await?;
                    pruned = true;
                }
            }
        }

        if pruned {
            let live_users: HashSet<&str> = live.iter().map(|s| s.user_id.as_str()).collect();
            for member in self.kv.smembers(&room_members_key(cafe_id)).await? {
                if !live_users.contains(member.as_str()) {
                    self.kv.srem(&room_members_key(cafe_id), &member).await?;
                    self.kv.zrem(&room_in_cafe_key(cafe_id), &member).await?;
                }
            }
        }
        Ok(live)
    }

    /// `{total, in_cafe}` for a room. Reads fail open: a store outage is
    /// logged and reported as an empty room.
    pub async fn presence_summary(&self, cafe_id: &str) -> PresenceSummary {
        match self.try_summary(cafe_id).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(?err, %cafe_id, "presence summary unavailable, reporting empty room");
                PresenceSummary::default()
            }
        }
    }

    async fn try_summary(&self, cafe_id: &str) -> Result<PresenceSummary, StoreError> {
        self.room_sessions(cafe_id).await?;

        let in_cafe_key = room_in_cafe_key(cafe_id);
        let cutoff = (self.clock.now_ms() - SESSION_TTL_SECS as i64 * 1000) as f64;
        self.kv
            .zrem_range_by_score(&in_cafe_key, f64::NEG_INFINITY, cutoff)
            .await?;

        Ok(PresenceSummary {
            total: self.kv.scard(&room_members_key(cafe_id)).await?,
            in_cafe: self
                .kv
                .zcount(&in_cafe_key, cutoff, f64::INFINITY)
                .await?,
        })
    }

    async fn store(&self, session: &Session) -> Result<(), StoreError> {
        let key = session_key(&session.session_id);
        let value = serde_json::to_string(session).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.kv.set_ex(&key, &value, SESSION_TTL_SECS).await
    }

    async fn stamp_in_cafe(&self, session: &Session) -> Result<(), StoreError> {
        self.kv
            .zadd(
                &room_in_cafe_key(&session.cafe_id),
                &session.user_id,
                self.clock.now_ms() as f64,
            )
            .await
    }

    async fn user_has_other_session(
        &self,
        session: &Session,
        pred: impl Fn(&Session) -> bool,
    ) -> Result<bool, StoreError> {
        Ok(self
            .room_sessions(&session.cafe_id)
            .await?
            .iter()
            .any(|s| s.user_id == session.user_id && s.session_id != session.session_id && pred(s)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;

    fn registry() -> (PresenceRegistry, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let kv = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        (
            PresenceRegistry::new(kv.clone(), Arc::new(clock.clone())),
            kv,
            clock,
        )
    }

    #[tokio::test]
    async fn join_counts_members_and_in_cafe_users() {
        let (reg, _, _) = registry();
        reg.join("u1", "ana", "c1", true).await.unwrap();
        reg.join("u2", "ben", "c1", false).await.unwrap();
        reg.join("u1", "ana", "c1", false).await.unwrap();

        let summary = reg.presence_summary("c1").await;
        assert_eq!(summary, PresenceSummary { total: 2, in_cafe: 1 });
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_keeps_user_with_other_session() {
        let (reg, _, _) = registry();
        let first = reg.join("u1", "ana", "c1", true).await.unwrap();
        reg.join("u1", "ana", "c1", true).await.unwrap();

        assert!(reg.leave(&first.session_id).await.unwrap().is_some());
        assert!(reg.leave(&first.session_id).await.unwrap().is_none());
        assert_eq!(reg.presence_summary("c1").await.total, 1);
        assert_eq!(reg.presence_summary("c1").await.in_cafe, 1);
    }

    #[tokio::test]
    async fn silent_sessions_expire_and_are_pruned() {
        let (reg, _, clock) = registry();
        let quiet = reg.join("u1", "ana", "c1", true).await.unwrap();
        let chatty = reg.join("u2", "ben", "c1", true).await.unwrap();

        clock.advance(Duration::minutes(20));
        reg.heartbeat(&chatty.session_id).await.unwrap();
        clock.advance(Duration::minutes(15));

        assert!(reg.heartbeat(&quiet.session_id).await.unwrap().is_none());
        let sessions = reg.room_sessions("c1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].user_id, "u2");
        assert_eq!(reg.presence_summary("c1").await, PresenceSummary { total: 1, in_cafe: 1 });
    }

    #[tokio::test]
    async fn update_presence_moves_user_out_of_cafe() {
        let (reg, _, _) = registry();
        let s = reg.join("u1", "ana", "c1", true).await.unwrap();
        reg.update_presence(&s.session_id, false).await.unwrap();
        assert_eq!(reg.presence_summary("c1").await, PresenceSummary { total: 1, in_cafe: 0 });

        reg.update_presence(&s.session_id, true).await.unwrap();
        assert_eq!(reg.presence_summary("c1").await.in_cafe, 1);
    }

    #[tokio::test]
    async fn summary_fails_open_when_store_is_down() {
        let (reg, kv, _) = registry();
        reg.join("u1", "ana", "c1", true).await.unwrap();
        kv.set_unavailable(true);
        assert_eq!(reg.presence_summary("c1").await, PresenceSummary::default());
    }
}
