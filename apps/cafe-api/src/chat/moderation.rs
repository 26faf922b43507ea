//! Duplicate detection, escalating auto-mutes, flags, and bans.
//!
//! Mutes expire lazily: the record stays in the cafe's mute hash, reason
//! included, until the first read after `until` clears it. Nothing sweeps
//! them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use cafe_common::id::{prefix, prefixed_ulid};

use super::sha256_hex;
use crate::clock::Clock;
use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

pub const DUPLICATE_SLOT_TTL_SECS: u64 = 3600;
pub const STRIKE_TTL_SECS: u64 = 3600;
pub const FLAGGED_CAP: usize = 100;

const BANNED_KEY: &str = "mod:banned";
const BAN_REASONS_KEY: &str = "mod:ban_reasons";

fn last_message_key(user_id: &str) -> String {
    format!("spam:last:{user_id}")
}

fn strikes_key(cafe_id: &str, user_id: &str) -> String {
    format!("spam:strikes:{cafe_id}:{user_id}")
}

fn mutes_key(cafe_id: &str) -> String {
    format!("mod:mutes:{cafe_id}")
}

fn flagged_key(cafe_id: &str) -> String {
    format!("mod:flagged:{cafe_id}")
}

/// Mute length for a strike count, if that count earns one.
pub fn mute_minutes_for_strikes(strikes: i64) -> Option<i64> {
    match strikes {
        3 | 4 => Some(5),
        5 | 6 => Some(30),
        n if n >= 7 => Some(24 * 60),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MuteRecord {
    pub until: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    pub muted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedMessage {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

pub struct Moderator {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl Moderator {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Whether `content` repeats this user's previous message. Only the one
    /// immediately prior message is remembered.
    pub async fn check_duplicate(&self, user_id: &str, content: &str) -> Result<bool, StoreError> {
        let hash = sha256_hex(content.trim());
        let previous = self
            .kv
            .get_set_ex(&last_message_key(user_id), &hash, DUPLICATE_SLOT_TTL_SECS)
            .await?;
        Ok(previous.as_deref() == Some(hash.as_str()))
    }

    /// Count a spam strike and apply the escalation ladder. Returns the mute
    /// issued by this strike, if any.
    pub async fn record_strike(
        &self,
        cafe_id: &str,
        user_id: &str,
    ) -> Result<Option<MuteRecord>, StoreError> {
        let key = strikes_key(cafe_id, user_id);
        let strikes = self.kv.incr_by(&key, 1).await?;
        self.kv.expire(&key, STRIKE_TTL_SECS).await?;

        let Some(minutes) = mute_minutes_for_strikes(strikes) else {
            return Ok(None);
        };
        let reason = format!("Automatic mute after {strikes} spam strikes");
        let record = self
            .record_mute(cafe_id, user_id, minutes, Some(reason))
            .await?;
        tracing::info!(%cafe_id, %user_id, strikes, minutes, "auto-mute applied");
        Ok(Some(record))
    }

    pub async fn record_mute(
        &self,
        cafe_id: &str,
        user_id: &str,
        duration_minutes: i64,
        reason: Option<String>,
    ) -> Result<MuteRecord, StoreError> {
        let now = self.clock.now();
        let record = MuteRecord {
            until: now + Duration::minutes(duration_minutes),
            reason,
            muted_at: now,
        };
        let value = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: mutes_key(cafe_id),
            reason: e.to_string(),
        })?;
        self.kv.hset(&mutes_key(cafe_id), user_id, &value).await?;
        Ok(record)
    }

    /// Returns `true` if a mute record was removed.
    pub async fn unmute(&self, cafe_id: &str, user_id: &str) -> Result<bool, StoreError> {
        self.kv.hdel(&mutes_key(cafe_id), user_id).await
    }

    /// The active mute for a user. An expired record reads as not muted and
    /// is deleted by this call.
    pub async fn mute_record(
        &self,
        cafe_id: &str,
        user_id: &str,
    ) -> Result<Option<MuteRecord>, StoreError> {
        let key = mutes_key(cafe_id);
        let Some(raw) = self.kv.hget(&key, user_id).await? else {
            return Ok(None);
        };
        let record: MuteRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(%cafe_id, %user_id, error = %e, "dropping unreadable mute record");
                self.kv.hdel(&key, user_id).await?;
                return Ok(None);
            }
        };

        if record.until <= self.clock.now() {
            self.kv.hdel(&key, user_id).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn is_muted(&self, cafe_id: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.mute_record(cafe_id, user_id).await?.is_some())
    }

    /// Append to the cafe's flag timeline, evicting the oldest past the cap.
    pub async fn flag_message(
        &self,
        cafe_id: &str,
        message_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<FlaggedMessage, StoreError> {
        let flag = FlaggedMessage {
            id: prefixed_ulid(prefix::FLAG),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            flagged_at: self.clock.now(),
        };
        let value = serde_json::to_string(&flag).map_err(|e| StoreError::Corrupt {
            key: flagged_key(cafe_id),
            reason: e.to_string(),
        })?;
        self.kv
            .lpush_trim(&flagged_key(cafe_id), &value, FLAGGED_CAP)
            .await?;
        Ok(flag)
    }

    /// Flags for a cafe, newest first.
    pub async fn flagged(&self, cafe_id: &str) -> Result<Vec<FlaggedMessage>, StoreError> {
        let raw = self.kv.lrange(&flagged_key(cafe_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub async fn ban(&self, user_id: &str, reason: Option<&str>) -> Result<(), StoreError> {
        self.kv.sadd(BANNED_KEY, user_id).await?;
        if let Some(reason) = reason {
            self.kv.hset(BAN_REASONS_KEY, user_id, reason).await?;
        }
        tracing::info!(%user_id, "user banned");
        Ok(())
    }

    pub async fn unban(&self, user_id: &str) -> Result<bool, StoreError> {
        self.kv.hdel(BAN_REASONS_KEY, user_id).await?;
        self.kv.srem(BANNED_KEY, user_id).await
    }

    pub async fn is_banned(&self, user_id: &str) -> Result<bool, StoreError> {
        self.kv.sismember(BANNED_KEY, user_id).await
    }
}
