use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::dm_channels;

/// Direct-message channel opened by a poke match. `user_a < user_b`.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, ToSchema)]
#[diesel(table_name = dm_channels)]
pub struct DmChannel {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub created_at: DateTime<Utc>,
}
