//! Postgres-backed [`Repository`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Date, Int2, Text, Timestamptz};
use diesel_async::AsyncConnection;
use scoped_futures::ScopedFutureExt;

use cafe_common::id::pair_key;

use super::pool::DbPool;
use super::repo::Repository;
use super::schema::{badges, cafe_hourly_analytics, cafes, dm_channels, messages, pokes, proactive_messages};
use crate::error::RepoError;
use crate::models::analytics::{HourlyAnalytics, NewProactiveSend};
use crate::models::badge::{
    AwardPeriod, BadgeKind, BADGE_VALIDITY_DAYS, EARLY_BIRD_BEFORE_HOUR, FREQUENT_VISITOR_MIN_DAYS,
    NIGHT_OWL_FROM_HOUR, SOCIAL_BUTTERFLY_MIN_MATCHES, TIME_OF_DAY_MIN_DAYS,
};
use crate::models::cafe::Cafe;
use crate::models::dm_channel::DmChannel;
use crate::models::message::{ChatMessage, MESSAGE_TYPE_USER};
use crate::models::poke::{Poke, PokeStatus};

#[derive(QueryableByName)]
struct UserIdRow {
    #[diesel(sql_type = Text)]
    user_id: String,
}

pub struct PgRepository {
    db: DbPool,
}

impl PgRepository {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

/// Users qualifying for `kind` between `$5` (inclusive) and `$6` (exclusive).
fn qualifying_users_sql(kind: BadgeKind) -> String {
    let by_message_hour = |hour_filter: String, min_days: usize| {
        format!(
            "SELECT user_id FROM messages \
             WHERE type = {MESSAGE_TYPE_USER} AND created_at >= $5 AND created_at < $6 {hour_filter} \
             GROUP BY user_id \
             HAVING COUNT(DISTINCT (created_at AT TIME ZONE 'UTC')::date) >= {min_days}"
        )
    };
    match kind {
        BadgeKind::EarlyBird => by_message_hour(
            format!("AND EXTRACT(HOUR FROM created_at AT TIME ZONE 'UTC') < {EARLY_BIRD_BEFORE_HOUR}"),
            TIME_OF_DAY_MIN_DAYS,
        ),
        BadgeKind::NightOwl => by_message_hour(
            format!("AND EXTRACT(HOUR FROM created_at AT TIME ZONE 'UTC') >= {NIGHT_OWL_FROM_HOUR}"),
            TIME_OF_DAY_MIN_DAYS,
        ),
        BadgeKind::FrequentVisitor => by_message_hour(String::new(), FREQUENT_VISITOR_MIN_DAYS),
        BadgeKind::SocialButterfly => format!(
            "SELECT user_id FROM ( \
               SELECT from_user AS user_id FROM pokes \
               WHERE status = 'matched' AND responded_at >= $5 AND responded_at < $6 \
               UNION ALL \
               SELECT to_user AS user_id FROM pokes \
               WHERE status = 'matched' AND responded_at >= $5 AND responded_at < $6 \
             ) m GROUP BY user_id HAVING COUNT(*) >= {SOCIAL_BUTTERFLY_MIN_MATCHES}"
        ),
    }
}

const UPSERT_HOURLY_SQL: &str = "\
INSERT INTO cafe_hourly_analytics \
    (cafe_id, bucket_date, bucket_hour, message_count, active_users, pokes_sent, matches, updated_at) \
SELECT $1, $2, $3, \
    (SELECT COUNT(*) FROM messages WHERE cafe_id = $1 AND type = 0 AND created_at >= $4 AND created_at < $5)::int, \
    (SELECT COUNT(DISTINCT user_id) FROM messages WHERE cafe_id = $1 AND type = 0 AND created_at >= $4 AND created_at < $5)::int, \
    (SELECT COUNT(*) FROM pokes WHERE cafe_id = $1 AND created_at >= $4 AND created_at < $5)::int, \
    (SELECT COUNT(*) FROM pokes WHERE cafe_id = $1 AND status = 'matched' AND responded_at >= $4 AND responded_at < $5)::int, \
    $6 \
ON CONFLICT (cafe_id, bucket_date, bucket_hour) DO UPDATE SET \
    message_count = EXCLUDED.message_count, \
    active_users = EXCLUDED.active_users, \
    pokes_sent = EXCLUDED.pokes_sent, \
    matches = EXCLUDED.matches, \
    updated_at = EXCLUDED.updated_at \
RETURNING *";

#[async_trait]
impl Repository for PgRepository {
    async fn upsert_cafe(&self, cafe: &Cafe) -> Result<(), RepoError> {
        let mut conn = self.db.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(cafes::table)
                .values(cafe)
                .on_conflict(cafes::id)
                .do_update()
                .set((
                    cafes::name.eq(&cafe.name),
                    cafes::proactive_enabled.eq(cafe.proactive_enabled),
                )),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn list_cafes(&self) -> Result<Vec<Cafe>, RepoError> {
        let mut conn = self.db.get().await?;
        let rows = diesel_async::RunQueryDsl::load(
            cafes::table.order(cafes::id.asc()).select(Cafe::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows)
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepoError> {
        let mut conn = self.db.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(messages::table).values(message),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn recent_messages(&self, cafe_id: &str, limit: i64) -> Result<Vec<ChatMessage>, RepoError> {
        let mut conn = self.db.get().await?;
        let rows = diesel_async::RunQueryDsl::load(
            messages::table
                .filter(messages::cafe_id.eq(cafe_id))
                .order(messages::id.desc())
                .limit(limit)
                .select(ChatMessage::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows)
    }

    async fn insert_poke(&self, poke: &Poke) -> Result<(), RepoError> {
        let mut conn = self.db.get().await?;
        diesel_async::RunQueryDsl::execute(diesel::insert_into(pokes::table).values(poke), &mut conn)
            .await?;
        Ok(())
    }

    async fn transition_poke(
        &self,
        poke_id: &str,
        from: PokeStatus,
        to: PokeStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut conn = self.db.get().await?;
        let target = pokes::table
            .find(poke_id)
            .filter(pokes::status.eq(from.as_str()));
        let updated = if matches!(to, PokeStatus::Matched | PokeStatus::Declined) {
            diesel_async::RunQueryDsl::execute(
                diesel::update(target).set((
                    pokes::status.eq(to.as_str()),
                    pokes::responded_at.eq(Some(at)),
                )),
                &mut conn,
            )
            .await?
        } else {
            diesel_async::RunQueryDsl::execute(
                diesel::update(target).set(pokes::status.eq(to.as_str())),
                &mut conn,
            )
            .await?
        };
        Ok(updated == 1)
    }

    async fn expire_pokes(&self, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError> {
        let mut conn = self.db.get().await?;
        let expired = diesel_async::RunQueryDsl::get_results(
            diesel::update(
                pokes::table
                    .filter(pokes::status.eq(PokeStatus::Pending.as_str()))
                    .filter(pokes::expires_at.le(now)),
            )
            .set(pokes::status.eq(PokeStatus::Expired.as_str()))
            .returning(Poke::as_returning()),
            &mut conn,
        )
        .await?;
        Ok(expired)
    }

    async fn pending_pokes_for(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Poke>, RepoError> {
        let mut conn = self.db.get().await?;
        let rows = diesel_async::RunQueryDsl::load(
            pokes::table
                .filter(pokes::to_user.eq(user_id))
                .filter(pokes::status.eq(PokeStatus::Pending.as_str()))
                .filter(pokes::expires_at.gt(now))
                .order(pokes::created_at.desc())
                .select(Poke::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows)
    }

    async fn create_dm_channel(
        &self,
        user_a: &str,
        user_b: &str,
        now: DateTime<Utc>,
    ) -> Result<DmChannel, RepoError> {
        let (lo, hi) = pair_key(user_a, user_b);
        let (lo, hi) = (lo.to_string(), hi.to_string());
        let mut conn = self.db.get().await?;
        let candidate = DmChannel {
            id: cafe_common::id::prefixed_ulid(cafe_common::id::prefix::DM_CHANNEL),
            user_a: lo.clone(),
            user_b: hi.clone(),
            created_at: now,
        };

        // Insert-or-read under one transaction: both sides of a match may race here.
        let channel = conn
            .transaction::<_, RepoError, _>(|conn| {
                async move {
                    diesel_async::RunQueryDsl::execute(
                        diesel::insert_into(dm_channels::table)
                            .values(&candidate)
                            .on_conflict((dm_channels::user_a, dm_channels::user_b))
                            .do_nothing(),
                        conn,
                    )
                    .await?;

                    let channel = diesel_async::RunQueryDsl::get_result(
                        dm_channels::table
                            .filter(dm_channels::user_a.eq(&lo))
                            .filter(dm_channels::user_b.eq(&hi))
                            .select(DmChannel::as_select()),
                        conn,
                    )
                    .await?;
                    Ok(channel)
                }
                .scope_boxed()
            })
            .await?;
        Ok(channel)
    }

    async fn has_active_badge(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let mut conn = self.db.get().await?;
        let active = diesel_async::RunQueryDsl::get_result(
            diesel::select(diesel::dsl::exists(
                badges::table
                    .filter(badges::user_id.eq(user_id))
                    .filter(badges::active.eq(true))
                    .filter(badges::expires_at.gt(now)),
            )),
            &mut conn,
        )
        .await?;
        Ok(active)
    }

    async fn expire_badges(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepoError> {
        let mut conn = self.db.get().await?;
        let mut users: Vec<String> = diesel_async::RunQueryDsl::get_results(
            diesel::update(
                badges::table
                    .filter(badges::active.eq(true))
                    .filter(badges::expires_at.le(now)),
            )
            .set(badges::active.eq(false))
            .returning(badges::user_id),
            &mut conn,
        )
        .await?;
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn award_badges(&self, kind: BadgeKind, now: DateTime<Utc>) -> Result<Vec<String>, RepoError> {
        let period = AwardPeriod::containing(now);
        let sql = format!(
            "INSERT INTO badges (id, user_id, kind, period_start, awarded_at, expires_at, active) \
             SELECT 'bdg_' || replace(gen_random_uuid()::text, '-', ''), q.user_id, $1, $2, $3, $4, TRUE \
             FROM ({}) q \
             ON CONFLICT (user_id, kind, period_start) DO NOTHING \
             RETURNING user_id",
            qualifying_users_sql(kind)
        );

        let mut conn = self.db.get().await?;
        let rows: Vec<UserIdRow> = diesel_async::RunQueryDsl::load(
            diesel::sql_query(sql)
                .bind::<Text, _>(kind.as_str())
                .bind::<Date, _>(period.start_date)
                .bind::<Timestamptz, _>(now)
                .bind::<Timestamptz, _>(now + Duration::days(BADGE_VALIDITY_DAYS))
                .bind::<Timestamptz, _>(period.starts_at)
                .bind::<Timestamptz, _>(period.ends_at),
            &mut conn,
        )
        .await?;
        Ok(rows.into_iter().map(|r| r.user_id).collect())
    }

    async fn upsert_hourly_analytics(
        &self,
        cafe_id: &str,
        hour_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HourlyAnalytics, RepoError> {
        let mut conn = self.db.get().await?;
        let row = diesel_async::RunQueryDsl::get_result(
            diesel::sql_query(UPSERT_HOURLY_SQL)
                .bind::<Text, _>(cafe_id)
                .bind::<Date, _>(hour_start.date_naive())
                .bind::<Int2, _>(hour_start.hour() as i16)
                .bind::<Timestamptz, _>(hour_start)
                .bind::<Timestamptz, _>(hour_start + Duration::hours(1))
                .bind::<Timestamptz, _>(now),
            &mut conn,
        )
        .await?;
        Ok(row)
    }

    async fn hourly_analytics(&self, cafe_id: &str, date: NaiveDate) -> Result<Vec<HourlyAnalytics>, RepoError> {
        let mut conn = self.db.get().await?;
        let rows = diesel_async::RunQueryDsl::load(
            cafe_hourly_analytics::table
                .filter(cafe_hourly_analytics::cafe_id.eq(cafe_id))
                .filter(cafe_hourly_analytics::bucket_date.eq(date))
                .order(cafe_hourly_analytics::bucket_hour.asc())
                .select(HourlyAnalytics::as_select()),
            &mut conn,
        )
        .await?;
        Ok(rows)
    }

    async fn record_proactive_send(&self, send: &NewProactiveSend) -> Result<(), RepoError> {
        let mut conn = self.db.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(proactive_messages::table).values(send),
            &mut conn,
        )
        .await?;
        Ok(())
    }
}
