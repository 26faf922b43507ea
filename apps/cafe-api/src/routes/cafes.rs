//! Public read endpoints for a cafe room.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::chat::presence::PresenceSummary;
use crate::chat::room::{DEFAULT_HISTORY_LIMIT, ROOM_LOG_CAP};
use crate::chat::topics::TopicCount;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::message::ChatMessage;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cafes/{cafe_id}/presence", get(get_presence))
        .route("/cafes/{cafe_id}/messages", get(list_messages))
        .route("/cafes/{cafe_id}/topics", get(list_topics))
}

// ---------------------------------------------------------------------------
// GET /api/v1/cafes/:cafe_id/presence
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/cafes/{cafe_id}/presence",
    tag = "Cafes",
    params(("cafe_id" = String, Path, description = "Cafe ID")),
    responses(
        (status = 200, description = "Current room counts", body = PresenceSummary),
    ),
)]
pub async fn get_presence(
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
) -> Json<PresenceSummary> {
    Json(state.chat.presence.presence_summary(&cafe_id).await)
}

// ---------------------------------------------------------------------------
// GET /api/v1/cafes/:cafe_id/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListMessagesQuery {
    /// Page size, 1 to 100. Defaults to 50.
    pub limit: Option<usize>,
    /// Number of newest messages to skip.
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListMessagesResponse {
    /// Oldest first.
    pub messages: Vec<ChatMessage>,
}

#[utoipa::path(
    get,
    path = "/api/v1/cafes/{cafe_id}/messages",
    tag = "Cafes",
    params(("cafe_id" = String, Path, description = "Cafe ID"), ListMessagesQuery),
    responses(
        (status = 200, description = "Recent messages", body = ListMessagesResponse),
        (status = 400, description = "Invalid paging", body = ApiErrorBody),
        (status = 503, description = "Store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > ROOM_LOG_CAP {
        return Err(ApiError::validation(vec![FieldError {
            field: "limit".to_string(),
            message: format!("must be between 1 and {ROOM_LOG_CAP}"),
        }]));
    }
    let messages = state
        .chat
        .room
        .history(&cafe_id, limit, query.offset.unwrap_or(0))
        .await?;
    Ok(Json(ListMessagesResponse { messages }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/cafes/:cafe_id/topics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct TopicsResponse {
    pub topics: Vec<TopicCount>,
}

#[utoipa::path(
    get,
    path = "/api/v1/cafes/{cafe_id}/topics",
    tag = "Cafes",
    params(("cafe_id" = String, Path, description = "Cafe ID")),
    responses(
        (status = 200, description = "Trending topics", body = TopicsResponse),
        (status = 503, description = "Store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn list_topics(
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
) -> Result<Json<TopicsResponse>, ApiError> {
    let topics = state.chat.room.trending(&cafe_id).await?;
    Ok(Json(TopicsResponse { topics }))
}
