use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::messages;

pub const MESSAGE_TYPE_USER: i16 = 0;
pub const MESSAGE_TYPE_AGENT: i16 = 1;
pub const MESSAGE_TYPE_PROACTIVE: i16 = 2;

/// A room message, as persisted, cached, and broadcast.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize, ToSchema)]
#[diesel(table_name = messages)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub cafe_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub type_: i16,
    pub created_at: DateTime<Utc>,
}
