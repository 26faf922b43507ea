//! Persistent storage collaborator.
//!
//! The realtime core only needs a handful of relational operations; they are
//! gathered behind [`Repository`] so the same components run against Postgres
//! ([`super::pg_repo::PgRepository`]) or the in-memory [`MemoryRepository`].
//! Every write the background jobs issue is conditional, so reruns are safe.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;

use cafe_common::id::{pair_key, prefix, prefixed_ulid};

use crate::error::RepoError;
use crate::models::analytics::{HourlyAnalytics, NewProactiveSend};
use crate::models::badge::{
    AwardPeriod, Badge, BadgeKind, BADGE_VALIDITY_DAYS, EARLY_BIRD_BEFORE_HOUR,
    FREQUENT_VISITOR_MIN_DAYS, NIGHT_OWL_FROM_HOUR, SOCIAL_BUTTERFLY_MIN_MATCHES,
    TIME_OF_DAY_MIN_DAYS,
};
use crate::models::cafe::Cafe;
use crate::models::dm_channel::DmChannel;
use crate::models::message::{ChatMessage, MESSAGE_TYPE_USER};
use crate::models::poke::{Poke, PokeStatus};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_cafe(&self, cafe: &Cafe) -> Result<(), RepoError>;
    async fn list_cafes(&self) -> Result<Vec<Cafe>, RepoError>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepoError>;
    /// Newest first.
    async fn recent_messages(&self, cafe_id: &str, limit: i64) -> Result<Vec<ChatMessage>, RepoError>;

    async fn insert_poke(&self, poke: &Poke) -> Result<(), RepoError>;
    /// Move a poke from `from` to `to`. Returns `false` when the poke was not
    /// in `from` (already transitioned by someone else).
    async fn transition_poke(
        &self,
        poke_id: &str,
        from: PokeStatus,
        to: PokeStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepoError>;
    /// Mark every pending poke with `expires_at <= now` as expired and return
    /// the pokes this call transitioned. The same instant counts as lapsed for
    /// a re-poke.
    async fn expire_pokes(&self, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError>;
    /// Pending, unexpired pokes addressed to `user_id`, newest first.
    async fn pending_pokes_for(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError>;

    /// Create the DM channel for a user pair, or return the existing one.
    async fn create_dm_channel(
        &self,
        user_a: &str,
        user_b: &str,
        now: DateTime<Utc>,
    ) -> Result<DmChannel, RepoError>;

    async fn has_active_badge(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, RepoError>;
    /// Deactivate lapsed badges; returns affected user ids.
    async fn expire_badges(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepoError>;
    /// Award `kind` for the period containing `now` to every qualifying user
    /// that does not hold it yet; returns newly awarded user ids.
    async fn award_badges(&self, kind: BadgeKind, now: DateTime<Utc>) -> Result<Vec<String>, RepoError>;

    /// Recompute and overwrite the bucket for the hour starting at `hour_start`.
    async fn upsert_hourly_analytics(
        &self,
        cafe_id: &str,
        hour_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HourlyAnalytics, RepoError>;
    async fn hourly_analytics(&self, cafe_id: &str, date: NaiveDate) -> Result<Vec<HourlyAnalytics>, RepoError>;

    async fn record_proactive_send(&self, send: &NewProactiveSend) -> Result<(), RepoError>;
}

/// Truncate a timestamp to the start of its hour.
pub fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    cafes: HashMap<String, Cafe>,
    messages: Vec<ChatMessage>,
    pokes: HashMap<String, Poke>,
    dm_channels: HashMap<(String, String), DmChannel>,
    badges: Vec<Badge>,
    analytics: HashMap<(String, NaiveDate, i16), HourlyAnalytics>,
    proactive: Vec<NewProactiveSend>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    failing_cafes: Mutex<HashSet<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make message and analytics operations for `cafe_id` fail, to exercise
    /// failure handling on the send path and in the jobs.
    pub fn fail_cafe(&self, cafe_id: &str) {
        self.failing_cafes.lock().insert(cafe_id.to_string());
    }

    fn check_cafe(&self, cafe_id: &str) -> Result<(), RepoError> {
        if self.failing_cafes.lock().contains(cafe_id) {
            return Err(RepoError::Pool(format!("injected failure for {cafe_id}")));
        }
        Ok(())
    }

    pub fn poke(&self, poke_id: &str) -> Option<Poke> {
        self.tables.lock().pokes.get(poke_id).cloned()
    }

    pub fn badges(&self) -> Vec<Badge> {
        self.tables.lock().badges.clone()
    }

    pub fn insert_badge(&self, badge: Badge) {
        self.tables.lock().badges.push(badge);
    }

    pub fn dm_channel_count(&self) -> usize {
        self.tables.lock().dm_channels.len()
    }

    pub fn proactive_sends(&self) -> Vec<NewProactiveSend> {
        self.tables.lock().proactive.clone()
    }
}

fn qualifying_users(tables: &Tables, kind: BadgeKind, period: &AwardPeriod) -> BTreeSet<String> {
    let in_period = |at: DateTime<Utc>| at >= period.starts_at && at < period.ends_at;

    if kind == BadgeKind::SocialButterfly {
        let mut matches: HashMap<&str, usize> = HashMap::new();
        for poke in tables.pokes.values() {
            let matched_in_period = poke.status() == Some(PokeStatus::Matched)
                && poke.responded_at.is_some_and(in_period);
            if matched_in_period {
                *matches.entry(poke.from_user.as_str()).or_default() += 1;
                *matches.entry(poke.to_user.as_str()).or_default() += 1;
            }
        }
        return matches
            .into_iter()
            .filter(|(_, n)| *n >= SOCIAL_BUTTERFLY_MIN_MATCHES)
            .map(|(user, _)| user.to_string())
            .collect();
    }

    let (hours, min_days) = match kind {
        BadgeKind::EarlyBird => (0..EARLY_BIRD_BEFORE_HOUR, TIME_OF_DAY_MIN_DAYS),
        BadgeKind::NightOwl => (NIGHT_OWL_FROM_HOUR..24, TIME_OF_DAY_MIN_DAYS),
        _ => (0..24, FREQUENT_VISITOR_MIN_DAYS),
    };

    let mut days: HashMap<&str, HashSet<NaiveDate>> = HashMap::new();
    for message in &tables.messages {
        if message.type_ == MESSAGE_TYPE_USER
            && in_period(message.created_at)
            && hours.contains(&message.created_at.hour())
        {
            days.entry(message.user_id.as_str())
                .or_default()
                .insert(message.created_at.date_naive());
        }
    }
    days.into_iter()
        .filter(|(_, d)| d.len() >= min_days)
        .map(|(user, _)| user.to_string())
        .collect()
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_cafe(&self, cafe: &Cafe) -> Result<(), RepoError> {
        self.tables.lock().cafes.insert(cafe.id.clone(), cafe.clone());
        Ok(())
    }

    async fn list_cafes(&self) -> Result<Vec<Cafe>, RepoError> {
        let mut cafes: Vec<Cafe> = self.tables.lock().cafes.values().cloned().collect();
        cafes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cafes)
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepoError> {
        self.check_cafe(&message.cafe_id)?;
        self.tables.lock().messages.push(message.clone());
        Ok(())
    }

    async fn recent_messages(&self, cafe_id: &str, limit: i64) -> Result<Vec<ChatMessage>, RepoError> {
        self.check_cafe(cafe_id)?;
        let tables = self.tables.lock();
        let mut found: Vec<ChatMessage> = tables
            .messages
            .iter()
            .filter(|m| m.cafe_id == cafe_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.id.cmp(&a.id));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn insert_poke(&self, poke: &Poke) -> Result<(), RepoError> {
        let mut tables = self.tables.lock();
        let (lo, hi) = pair_key(&poke.from_user, &poke.to_user);
        let duplicate_pending = poke.is_pending()
            && tables.pokes.values().any(|p| {
                p.is_pending() && pair_key(&p.from_user, &p.to_user) == (lo, hi)
            });
        if duplicate_pending {
            return Err(RepoError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                Box::new("pending poke already exists for pair".to_string()),
            )));
        }
        tables.pokes.insert(poke.id.clone(), poke.clone());
        Ok(())
    }

    async fn transition_poke(
        &self,
        poke_id: &str,
        from: PokeStatus,
        to: PokeStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut tables = self.tables.lock();
        match tables.pokes.get_mut(poke_id) {
            Some(poke) if poke.status() == Some(from) => {
                poke.status = to.as_str().to_string();
                if matches!(to, PokeStatus::Matched | PokeStatus::Declined) {
                    poke.responded_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_pokes(&self, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError> {
        let mut tables = self.tables.lock();
        let mut expired = Vec::new();
        for poke in tables.pokes.values_mut() {
            if poke.is_pending() && poke.is_lapsed(now) {
                poke.status = PokeStatus::Expired.as_str().to_string();
                expired.push(poke.clone());
            }
        }
        Ok(expired)
    }

    async fn pending_pokes_for(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError> {
        let tables = self.tables.lock();
        let mut pending: Vec<Poke> = tables
            .pokes
            .values()
            .filter(|p| p.to_user == user_id && p.is_pending() && !p.is_lapsed(now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pending)
    }

    async fn create_dm_channel(
        &self,
        user_a: &str,
        user_b: &str,
        now: DateTime<Utc>,
    ) -> Result<DmChannel, RepoError> {
        let (lo, hi) = pair_key(user_a, user_b);
        let mut tables = self.tables.lock();
        let channel = tables
            .dm_channels
            .entry((lo.to_string(), hi.to_string()))
            .or_insert_with(|| DmChannel {
                id: prefixed_ulid(prefix::DM_CHANNEL),
                user_a: lo.to_string(),
                user_b: hi.to_string(),
                created_at: now,
            });
        Ok(channel.clone())
    }

    async fn has_active_badge(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, RepoError> {
        Ok(self
            .tables
            .lock()
            .badges
            .iter()
            .any(|b| b.user_id == user_id && b.active && b.expires_at > now))
    }

    async fn expire_badges(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepoError> {
        let mut tables = self.tables.lock();
        let mut users = BTreeSet::new();
        for badge in tables.badges.iter_mut() {
            if badge.active && badge.expires_at <= now {
                badge.active = false;
                users.insert(badge.user_id.clone());
            }
        }
        Ok(users.into_iter().collect())
    }

    async fn award_badges(&self, kind: BadgeKind, now: DateTime<Utc>) -> Result<Vec<String>, RepoError> {
        let period = AwardPeriod::containing(now);
        let mut tables = self.tables.lock();
        let qualifying = qualifying_users(&tables, kind, &period);

        let mut awarded = Vec::new();
        for user_id in qualifying {
            let already = tables.badges.iter().any(|b| {
                b.user_id == user_id && b.kind == kind.as_str() && b.period_start == period.start_date
            });
            if already {
                continue;
            }
            tables.badges.push(Badge {
                id: prefixed_ulid(prefix::BADGE),
                user_id: user_id.clone(),
                kind: kind.as_str().to_string(),
                period_start: period.start_date,
                awarded_at: now,
                expires_at: now + Duration::days(BADGE_VALIDITY_DAYS),
                active: true,
            });
            awarded.push(user_id);
        }
        Ok(awarded)
    }

    async fn upsert_hourly_analytics(
        &self,
        cafe_id: &str,
        hour_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HourlyAnalytics, RepoError> {
        self.check_cafe(cafe_id)?;

        let hour_end = hour_start + Duration::hours(1);
        let in_hour = |at: DateTime<Utc>| at >= hour_start && at < hour_end;

        let mut tables = self.tables.lock();
        let user_messages: Vec<&ChatMessage> = tables
            .messages
            .iter()
            .filter(|m| m.cafe_id == cafe_id && m.type_ == MESSAGE_TYPE_USER && in_hour(m.created_at))
            .collect();
        let active_users: HashSet<&str> = user_messages.iter().map(|m| m.user_id.as_str()).collect();
        let cafe_pokes = tables.pokes.values().filter(|p| p.cafe_id == cafe_id);
        let pokes_sent = cafe_pokes.clone().filter(|p| in_hour(p.created_at)).count();
        let matches = cafe_pokes
            .filter(|p| {
                p.status() == Some(PokeStatus::Matched) && p.responded_at.is_some_and(in_hour)
            })
            .count();

        let row = HourlyAnalytics {
            cafe_id: cafe_id.to_string(),
            bucket_date: hour_start.date_naive(),
            bucket_hour: hour_start.hour() as i16,
            message_count: user_messages.len() as i32,
            active_users: active_users.len() as i32,
            pokes_sent: pokes_sent as i32,
            matches: matches as i32,
            updated_at: now,
        };
        tables.analytics.insert(
            (row.cafe_id.clone(), row.bucket_date, row.bucket_hour),
            row.clone(),
        );
        Ok(row)
    }

    async fn hourly_analytics(&self, cafe_id: &str, date: NaiveDate) -> Result<Vec<HourlyAnalytics>, RepoError> {
        let tables = self.tables.lock();
        let mut rows: Vec<HourlyAnalytics> = tables
            .analytics
            .values()
            .filter(|r| r.cafe_id == cafe_id && r.bucket_date == date)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.bucket_hour);
        Ok(rows)
    }

    async fn record_proactive_send(&self, send: &NewProactiveSend) -> Result<(), RepoError> {
        self.tables.lock().proactive.push(send.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: i64, user: &str, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id,
            cafe_id: "cafe_1".into(),
            user_id: user.into(),
            username: user.into(),
            content: "hello there".into(),
            type_: MESSAGE_TYPE_USER,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn early_bird_needs_three_distinct_mornings() {
        let repo = MemoryRepository::new();
        // Monday 2026-03-02 .. Wednesday 2026-03-04, 07:15 UTC.
        for day in 2..=4 {
            let at = Utc.with_ymd_and_hms(2026, 3, day, 7, 15, 0).unwrap();
            repo.insert_message(&message(i64::from(day), "usr_early", at)).await.unwrap();
        }
        // Two mornings only.
        for day in 2..=3 {
            let at = Utc.with_ymd_and_hms(2026, 3, day, 6, 0, 0).unwrap();
            repo.insert_message(&message(100 + i64::from(day), "usr_almost", at)).await.unwrap();
        }

        let now = Utc.with_ymd_and_hms(2026, 3, 5, 3, 0, 0).unwrap();
        let awarded = repo.award_badges(BadgeKind::EarlyBird, now).await.unwrap();
        assert_eq!(awarded, vec!["usr_early".to_string()]);

        // Rerun in the same period awards nothing new.
        let again = repo.award_badges(BadgeKind::EarlyBird, now).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(repo.badges().len(), 1);
        assert!(repo.has_active_badge("usr_early", now).await.unwrap());
    }

    #[tokio::test]
    async fn dm_channel_creation_is_idempotent_per_pair() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let first = repo.create_dm_channel("usr_b", "usr_a", now).await.unwrap();
        let second = repo.create_dm_channel("usr_a", "usr_b", now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!((first.user_a.as_str(), first.user_b.as_str()), ("usr_a", "usr_b"));
        assert_eq!(repo.dm_channel_count(), 1);
    }

    #[test]
    fn hour_floor_truncates() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 41, 7).unwrap();
        assert_eq!(hour_floor(at), Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }
}
