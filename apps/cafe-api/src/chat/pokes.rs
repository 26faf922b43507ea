//! Poke matching.
//!
//! Each unordered user pair owns one slot in the shared store
//! (`poke:pair:{lo}:{hi}`). Every transition is a compare-and-swap against
//! the exact value read, so two processes handling A→B and B→A at the same
//! time can produce at most one match. The repository mirrors each record
//! and transition for history, badges, and analytics.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use cafe_common::id::{pair_key, prefix, prefixed_ulid};

use crate::clock::Clock;
use crate::db::kv::KeyValueStore;
use crate::db::repo::Repository;
use crate::error::{ChatError, StoreError};
use crate::gateway::events::ServerEvent;
use crate::gateway::fanout::EventBus;
use crate::models::dm_channel::DmChannel;
use crate::models::poke::{Poke, PokeStatus};

pub const POKE_VALIDITY_HOURS: i64 = 24;
pub const PAIR_RECORD_TTL_SECS: u64 = 2 * POKE_VALIDITY_HOURS as u64 * 3600;
pub const POKE_CACHE_TTL_SECS: u64 = 300;
pub const INBOX_TTL_SECS: u64 = 7 * 24 * 3600;
pub const MAX_INTEREST_LEN: usize = 100;
const MAX_CAS_ATTEMPTS: usize = 5;

pub fn pair_record_key(a: &str, b: &str) -> String {
    let (lo, hi) = pair_key(a, b);
    format!("poke:pair:{lo}:{hi}")
}

pub fn inbox_key(user_id: &str) -> String {
    format!("poke:inbox:{user_id}")
}

pub fn cache_key(user_id: &str) -> String {
    format!("poke:cache:{user_id}")
}

/// Check a poke request without touching any state. Returns the trimmed
/// interest.
pub fn validate_poke<'a>(from: &str, to: &str, shared_interest: &'a str) -> Result<&'a str, ChatError> {
    if from == to {
        return Err(ChatError::ValidationFailed("You cannot poke yourself".into()));
    }
    let interest = shared_interest.trim();
    if interest.is_empty() || interest.chars().count() > MAX_INTEREST_LEN {
        return Err(ChatError::ValidationFailed(format!(
            "Shared interest must be 1 to {MAX_INTEREST_LEN} characters"
        )));
    }
    Ok(interest)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PairRecord {
    id: String,
    cafe_id: String,
    from: String,
    to: String,
    shared_interest: String,
    status: PokeStatus,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl PairRecord {
    /// Repository row for a freshly recorded poke. `responded_at` is only
    /// ever set by a status transition.
    fn to_poke(&self) -> Poke {
        Poke {
            id: self.id.clone(),
            cafe_id: self.cafe_id.clone(),
            from_user: self.from.clone(),
            to_user: self.to.clone(),
            shared_interest: self.shared_interest.clone(),
            status: self.status.as_str().to_string(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            responded_at: None,
        }
    }

    fn view(&self) -> PokeView {
        PokeView {
            id: self.id.clone(),
            shared_interest: self.shared_interest.clone(),
            status: self.status,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// A poke as its recipient sees it: the sender stays hidden until a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PokeView {
    pub id: String,
    pub shared_interest: String,
    pub status: PokeStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Poke> for PokeView {
    fn from(poke: &Poke) -> Self {
        Self {
            id: poke.id.clone(),
            shared_interest: poke.shared_interest.clone(),
            status: poke.status().unwrap_or(PokeStatus::Pending),
            created_at: poke.created_at,
            expires_at: poke.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PokeOutcome {
    Sent(PokeView),
    Matched { poke_id: String, channel: DmChannel },
    AlreadyPending,
    AlreadyMatched,
    Declined,
}

enum Step {
    Create { lapsed: Option<PairRecord> },
    Match(PairRecord),
    Done(PokeOutcome),
}

fn decide(current: Option<&PairRecord>, from: &str, now: DateTime<Utc>) -> Step {
    let Some(record) = current else {
        return Step::Create { lapsed: None };
    };
    match record.status {
        PokeStatus::Pending if record.expires_at <= now => Step::Create {
            lapsed: Some(record.clone()),
        },
        PokeStatus::Pending if record.from == from => Step::Done(PokeOutcome::AlreadyPending),
        PokeStatus::Pending => Step::Match(record.clone()),
        PokeStatus::Matched => Step::Done(PokeOutcome::AlreadyMatched),
        PokeStatus::Declined if record.from == from && now < record.expires_at => {
            Step::Done(PokeOutcome::Declined)
        }
        PokeStatus::Declined | PokeStatus::Expired => Step::Create { lapsed: None },
    }
}

fn parse_record(key: &str, raw: &str) -> Result<PairRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode_record(key: &str, record: &PairRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub struct PokeService {
    kv: Arc<dyn KeyValueStore>,
    repo: Arc<dyn Repository>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl PokeService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        repo: Arc<dyn Repository>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kv,
            repo,
            bus,
            clock,
        }
    }

    pub async fn send(
        &self,
        cafe_id: &str,
        from: &str,
        to: &str,
        shared_interest: &str,
    ) -> Result<PokeOutcome, ChatError> {
        let interest = validate_poke(from, to, shared_interest)?;

        let key = pair_record_key(from, to);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current = raw
                .as_deref()
                .map(|r| parse_record(&key, r))
                .transpose()?;
            let now = self.clock.now();

            match decide(current.as_ref(), from, now) {
                Step::Done(outcome) => return Ok(outcome),
                Step::Create { lapsed } => {
                    let record = PairRecord {
                        id: prefixed_ulid(prefix::POKE),
                        cafe_id: cafe_id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                        shared_interest: interest.to_string(),
                        status: PokeStatus::Pending,
                        created_at: now,
                        expires_at: now + Duration::hours(POKE_VALIDITY_HOURS),
                    };
                    let swapped = self
                        .kv
                        .compare_and_swap(
                            &key,
                            raw.as_deref(),
                            &encode_record(&key, &record)?,
                            PAIR_RECORD_TTL_SECS,
                        )
                        .await?;
                    if !swapped {
                        continue;
                    }
                    if let Some(old) = lapsed {
                        self.retire_lapsed(&old, now).await?;
                    }
                    return self.deliver_new(record).await;
                }
                Step::Match(pending) => {
                    let matched = PairRecord {
                        status: PokeStatus::Matched,
                        ..pending.clone()
                    };
                    let swapped = self
                        .kv
                        .compare_and_swap(
                            &key,
                            raw.as_deref(),
                            &encode_record(&key, &matched)?,
                            PAIR_RECORD_TTL_SECS,
                        )
                        .await?;
                    if !swapped {
                        continue;
                    }
                    return self.complete_match(&pending, interest, now).await;
                }
            }
        }

        tracing::warn!(%from, %to, "poke slot contention, giving up");
        Err(ChatError::Internal("Poke could not be recorded, try again".into()))
    }

    /// The recipient turns down a pending poke.
    pub async fn decline(&self, by_user: &str, from_user: &str) -> Result<PokeView, ChatError> {
        let key = pair_record_key(by_user, from_user);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current = raw
                .as_deref()
                .map(|r| parse_record(&key, r))
                .transpose()?;
            let now = self.clock.now();

            let Some(pending) = current.filter(|r| {
                r.status == PokeStatus::Pending
                    && r.from == from_user
                    && r.to == by_user
                    && r.expires_at > now
            }) else {
                return Err(ChatError::NotFound("No pending poke from that user".into()));
            };

            let declined = PairRecord {
                status: PokeStatus::Declined,
                ..pending
            };
            let swapped = self
                .kv
                .compare_and_swap(
                    &key,
                    raw.as_deref(),
                    &encode_record(&key, &declined)?,
                    PAIR_RECORD_TTL_SECS,
                )
                .await?;
            if !swapped {
                continue;
            }

            self.repo
                .transition_poke(&declined.id, PokeStatus::Pending, PokeStatus::Declined, now)
                .await?;
            self.bump_inbox(by_user, -1).await?;
            self.invalidate_cache(by_user).await?;
            tracing::info!(poke_id = %declined.id, "poke declined");
            return Ok(declined.view());
        }
        Err(ChatError::Internal("Poke could not be declined, try again".into()))
    }

    /// Pending pokes addressed to `user_id`, cache-aside over the repository.
    pub async fn list_pending(&self, user_id: &str) -> Result<Vec<PokeView>, ChatError> {
        let now = self.clock.now();
        let key = cache_key(user_id);
        if let Some(raw) = self.kv.get(&key).await? {
            if let Ok(views) = serde_json::from_str::<Vec<PokeView>>(&raw) {
                return Ok(views.into_iter().filter(|v| v.expires_at > now).collect());
            }
        }

        let views: Vec<PokeView> = self
            .repo
            .pending_pokes_for(user_id, now)
            .await?
            .iter()
            .map(PokeView::from)
            .collect();
        let json = serde_json::to_string(&views).map_err(|e| ChatError::Internal(e.to_string()))?;
        self.kv.set_ex(&key, &json, POKE_CACHE_TTL_SECS).await?;
        Ok(views)
    }

    pub async fn inbox_count(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .kv
            .get(&inbox_key(user_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Bookkeeping for a poke the repository just marked expired: the slot
    /// follows if it still holds that poke, the recipient's counter drops, and
    /// both users' caches are invalidated.
    pub async fn on_expired(&self, poke: &Poke) -> Result<(), StoreError> {
        let key = pair_record_key(&poke.from_user, &poke.to_user);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current = raw
                .as_deref()
                .map(|r| parse_record(&key, r))
                .transpose()?;
            let Some(record) = current.filter(|r| r.id == poke.id && r.status == PokeStatus::Pending)
            else {
                break;
            };
            let expired = PairRecord {
                status: PokeStatus::Expired,
                ..record
            };
            if self
                .kv
                .compare_and_swap(
                    &key,
                    raw.as_deref(),
                    &encode_record(&key, &expired)?,
                    PAIR_RECORD_TTL_SECS,
                )
                .await?
            {
                break;
            }
        }

        self.bump_inbox(&poke.to_user, -1).await?;
        self.invalidate_cache(&poke.to_user).await?;
        self.invalidate_cache(&poke.from_user).await
    }

    pub async fn invalidate_cache(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.del(&cache_key(user_id)).await
    }

    async fn deliver_new(&self, record: PairRecord) -> Result<PokeOutcome, ChatError> {
        self.repo.insert_poke(&record.to_poke()).await?;
        self.bump_inbox(&record.to, 1).await?;
        self.invalidate_cache(&record.to).await?;

        let event = ServerEvent::PokeReceived {
            poke_id: record.id.clone(),
            shared_interest: record.shared_interest.clone(),
        };
        if let Err(err) = self.bus.to_user(&record.to, &event).await {
            tracing::warn!(?err, poke_id = %record.id, "poke notification not delivered");
        }
        tracing::info!(poke_id = %record.id, cafe_id = %record.cafe_id, "poke sent");
        Ok(PokeOutcome::Sent(record.view()))
    }

    async fn complete_match(
        &self,
        pending: &PairRecord,
        interest: &str,
        now: DateTime<Utc>,
    ) -> Result<PokeOutcome, ChatError> {
        let moved = self
            .repo
            .transition_poke(&pending.id, PokeStatus::Pending, PokeStatus::Matched, now)
            .await?;
        if !moved {
            tracing::warn!(poke_id = %pending.id, "matched poke was no longer pending in repository");
        }

        let reciprocal = PairRecord {
            id: prefixed_ulid(prefix::POKE),
            cafe_id: pending.cafe_id.clone(),
            from: pending.to.clone(),
            to: pending.from.clone(),
            shared_interest: interest.to_string(),
            status: PokeStatus::Matched,
            created_at: now,
            expires_at: now + Duration::hours(POKE_VALIDITY_HOURS),
        };
        // Only the transitioned row carries `responded_at`, so a match counts once.
        self.repo.insert_poke(&reciprocal.to_poke()).await?;

        let channel = self
            .repo
            .create_dm_channel(&pending.from, &pending.to, now)
            .await?;

        self.bump_inbox(&pending.to, -1).await?;
        self.invalidate_cache(&pending.to).await?;
        self.invalidate_cache(&pending.from).await?;

        for (user, matched_user) in [(&pending.from, &pending.to), (&pending.to, &pending.from)] {
            let event = ServerEvent::PokeMatched {
                matched_user: matched_user.clone(),
                channel_id: channel.id.clone(),
                shared_interest: pending.shared_interest.clone(),
            };
            if let Err(err) = self.bus.to_user(user, &event).await {
                tracing::warn!(?err, %user, "match notification not delivered");
            }
        }

        tracing::info!(poke_id = %pending.id, channel_id = %channel.id, "poke matched");
        Ok(PokeOutcome::Matched {
            poke_id: pending.id.clone(),
            channel,
        })
    }

    async fn retire_lapsed(&self, old: &PairRecord, now: DateTime<Utc>) -> Result<(), ChatError> {
        // The sweep may have expired it already; only the winner decrements.
        let moved = self
            .repo
            .transition_poke(&old.id, PokeStatus::Pending, PokeStatus::Expired, now)
            .await?;
        if moved {
            self.bump_inbox(&old.to, -1).await?;
            self.invalidate_cache(&old.to).await?;
        }
        Ok(())
    }

    async fn bump_inbox(&self, user_id: &str, delta: i64) -> Result<(), StoreError> {
        let key = inbox_key(user_id);
        let value = self.kv.incr_by(&key, delta).await?;
        if value < 0 {
            self.kv.set_ex(&key, "0", INBOX_TTL_SECS).await
        } else {
            self.kv.expire(&key, INBOX_TTL_SECS).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;
    use crate::db::repo::MemoryRepository;

    struct Fixture {
        pokes: PokeService,
        repo: Arc<MemoryRepository>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let repo = Arc::new(MemoryRepository::new());
        let pokes = PokeService::new(
            kv.clone(),
            repo.clone(),
            EventBus::new(kv),
            Arc::new(clock.clone()),
        );
        Fixture { pokes, repo, clock }
    }

    fn sent_id(outcome: PokeOutcome) -> String {
        match outcome {
            PokeOutcome::Sent(view) => view.id,
            other => panic!("expected Sent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reciprocal_poke_matches_exactly_once() {
        let f = fixture();
        let id = sent_id(f.pokes.send("c1", "a", "b", "jazz").await.unwrap());
        assert_eq!(f.pokes.inbox_count("b").await.unwrap(), 1);

        let matched = f.pokes.send("c1", "b", "a", "vinyl").await.unwrap();
        let PokeOutcome::Matched { poke_id, channel } = matched else {
            panic!("expected a match");
        };
        assert_eq!(poke_id, id);
        assert_eq!((channel.user_a.as_str(), channel.user_b.as_str()), ("a", "b"));
        assert_eq!(f.repo.poke(&id).unwrap().status(), Some(PokeStatus::Matched));
        assert_eq!(f.pokes.inbox_count("b").await.unwrap(), 0);

        assert_eq!(f.pokes.send("c1", "b", "a", "jazz").await.unwrap(), PokeOutcome::AlreadyMatched);
        assert_eq!(f.pokes.send("c1", "a", "b", "jazz").await.unwrap(), PokeOutcome::AlreadyMatched);
        assert_eq!(f.repo.dm_channel_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_reciprocal_pokes_match_once() {
        let f = fixture();
        let (ab, ba) = tokio::join!(
            f.pokes.send("c1", "a", "b", "jazz"),
            f.pokes.send("c1", "b", "a", "jazz")
        );
        let outcomes = [ab.unwrap(), ba.unwrap()];
        let matches = outcomes
            .iter()
            .filter(|o| matches!(o, PokeOutcome::Matched { .. }))
            .count();
        assert_eq!(matches, 1);
        assert_eq!(f.repo.dm_channel_count(), 1);
    }

    #[tokio::test]
    async fn repeat_poke_same_direction_stays_single_pending() {
        let f = fixture();
        f.pokes.send("c1", "a", "b", "jazz").await.unwrap();
        assert_eq!(f.pokes.send("c1", "a", "b", "tea").await.unwrap(), PokeOutcome::AlreadyPending);
        assert_eq!(f.pokes.inbox_count("b").await.unwrap(), 1);
        assert_eq!(f.pokes.list_pending("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn self_poke_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.pokes.send("c1", "a", "a", "jazz").await,
            Err(ChatError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn declined_poke_blocks_sender_until_expiry() {
        let f = fixture();
        let id = sent_id(f.pokes.send("c1", "a", "b", "jazz").await.unwrap());
        let view = f.pokes.decline("b", "a").await.unwrap();
        assert_eq!(view.status, PokeStatus::Declined);
        assert_eq!(f.repo.poke(&id).unwrap().status(), Some(PokeStatus::Declined));
        assert_eq!(f.pokes.inbox_count("b").await.unwrap(), 0);

        assert_eq!(f.pokes.send("c1", "a", "b", "jazz").await.unwrap(), PokeOutcome::Declined);
        // the other direction starts fresh
        assert!(matches!(
            f.pokes.send("c1", "b", "a", "jazz").await.unwrap(),
            PokeOutcome::Sent(_)
        ));
    }

    #[tokio::test]
    async fn decline_without_pending_poke_is_not_found() {
        let f = fixture();
        assert!(matches!(f.pokes.decline("b", "a").await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn lapsed_pending_poke_is_replaced() {
        let f = fixture();
        let old = sent_id(f.pokes.send("c1", "a", "b", "jazz").await.unwrap());
        f.clock.advance(Duration::hours(POKE_VALIDITY_HOURS));

        let new = sent_id(f.pokes.send("c1", "a", "b", "jazz").await.unwrap());
        assert_ne!(old, new);
        assert_eq!(f.repo.poke(&old).unwrap().status(), Some(PokeStatus::Expired));
        assert!(f.repo.poke(&new).unwrap().is_pending());
        assert_eq!(f.pokes.inbox_count("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lapsed_reverse_poke_does_not_match() {
        let f = fixture();
        f.pokes.send("c1", "a", "b", "jazz").await.unwrap();
        f.clock.advance(Duration::hours(25));
        assert!(matches!(
            f.pokes.send("c1", "b", "a", "jazz").await.unwrap(),
            PokeOutcome::Sent(_)
        ));
    }

    #[tokio::test]
    async fn pending_list_is_cached_until_invalidated() {
        let f = fixture();
        f.pokes.send("c1", "a", "c", "jazz").await.unwrap();
        assert_eq!(f.pokes.list_pending("c").await.unwrap().len(), 1);
        f.clock.advance(Duration::minutes(1));
        f.pokes.send("c1", "b", "c", "tea").await.unwrap();
        // sending invalidated the cache
        let pending = f.pokes.list_pending("c").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].shared_interest, "tea");
    }
}
