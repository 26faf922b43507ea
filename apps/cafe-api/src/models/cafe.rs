use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::cafes;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, ToSchema)]
#[diesel(table_name = cafes)]
#[serde(rename_all = "camelCase")]
pub struct Cafe {
    pub id: String,
    pub name: String,
    pub proactive_enabled: bool,
    pub created_at: DateTime<Utc>,
}
