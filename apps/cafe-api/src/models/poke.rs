use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::pokes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PokeStatus {
    Pending,
    Matched,
    Declined,
    Expired,
}

impl PokeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PokeStatus::Pending => "pending",
            PokeStatus::Matched => "matched",
            PokeStatus::Declined => "declined",
            PokeStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PokeStatus::Pending),
            "matched" => Some(PokeStatus::Matched),
            "declined" => Some(PokeStatus::Declined),
            "expired" => Some(PokeStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize, ToSchema)]
#[diesel(table_name = pokes)]
pub struct Poke {
    pub id: String,
    pub cafe_id: String,
    pub from_user: String,
    pub to_user: String,
    pub shared_interest: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set by the answering transition. The reciprocal row a match inserts
    /// leaves it empty.
    pub responded_at: Option<DateTime<Utc>>,
}

impl Poke {
    pub fn status(&self) -> Option<PokeStatus> {
        PokeStatus::parse(&self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Some(PokeStatus::Pending)
    }

    /// A pending poke whose validity window has passed, swept or not.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
