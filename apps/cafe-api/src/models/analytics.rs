use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::{cafe_hourly_analytics, proactive_messages};

/// One `(cafe, date, hour)` rollup bucket.
#[derive(Debug, Clone, PartialEq, Queryable, QueryableByName, Selectable, Serialize, ToSchema)]
#[diesel(table_name = cafe_hourly_analytics)]
#[serde(rename_all = "camelCase")]
pub struct HourlyAnalytics {
    pub cafe_id: String,
    pub bucket_date: NaiveDate,
    pub bucket_hour: i16,
    pub message_count: i32,
    pub active_users: i32,
    pub pokes_sent: i32,
    pub matches: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = proactive_messages)]
pub struct NewProactiveSend {
    pub cafe_id: String,
    pub template_key: String,
    pub content: String,
    pub present_users: i32,
    pub sent_at: DateTime<Utc>,
}
