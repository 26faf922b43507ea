use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::badges;

/// Badges last one week past their award.
pub const BADGE_VALIDITY_DAYS: i64 = 7;

pub const EARLY_BIRD_BEFORE_HOUR: u32 = 8;
pub const NIGHT_OWL_FROM_HOUR: u32 = 22;
/// Distinct qualifying days needed for the early-bird / night-owl badges.
pub const TIME_OF_DAY_MIN_DAYS: usize = 3;
pub const SOCIAL_BUTTERFLY_MIN_MATCHES: usize = 5;
pub const FREQUENT_VISITOR_MIN_DAYS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BadgeKind {
    EarlyBird,
    NightOwl,
    SocialButterfly,
    FrequentVisitor,
}

impl BadgeKind {
    pub const ALL: [BadgeKind; 4] = [
        BadgeKind::EarlyBird,
        BadgeKind::NightOwl,
        BadgeKind::SocialButterfly,
        BadgeKind::FrequentVisitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BadgeKind::EarlyBird => "early_bird",
            BadgeKind::NightOwl => "night_owl",
            BadgeKind::SocialButterfly => "social_butterfly",
            BadgeKind::FrequentVisitor => "frequent_visitor",
        }
    }
}

/// Award period: the ISO week (Monday 00:00 UTC) containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwardPeriod {
    pub start_date: NaiveDate,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl AwardPeriod {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        let start_date = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let starts_at = start_date.and_time(chrono::NaiveTime::MIN).and_utc();
        Self {
            start_date,
            starts_at,
            ends_at: starts_at + Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, ToSchema)]
#[diesel(table_name = badges)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub period_start: NaiveDate,
    pub awarded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn award_period_starts_on_monday() {
        // 2026-03-05 is a Thursday.
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        let period = AwardPeriod::containing(now);
        assert_eq!(period.start_date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(period.ends_at, Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap());
    }
}
