//! Operator endpoints, guarded by the admin bearer token.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::middleware::AdminUser;
use crate::auth::tokens::{self, WsTicketData, WS_TICKET_TTL_SECS};
use crate::chat::moderation::{FlaggedMessage, MuteRecord};
use crate::chat::rate_limit::RateLimitStatus;
use crate::chat::service::badge_cache_key;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::analytics::HourlyAnalytics;
use crate::models::cafe::Cafe;
use crate::AppState;

/// Longest mute an operator can hand out (one week).
pub const MAX_MUTE_MINUTES: i64 = 7 * 24 * 60;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/tickets", post(create_ticket))
        .route(
            "/admin/rate-limits/{user_id}",
            get(get_rate_limits).delete(reset_rate_limits),
        )
        .route("/admin/cafes/{cafe_id}", put(upsert_cafe))
        .route(
            "/admin/cafes/{cafe_id}/mutes/{user_id}",
            put(mute_user).delete(unmute_user),
        )
        .route("/admin/cafes/{cafe_id}/flagged", get(list_flagged))
        .route("/admin/cafes/{cafe_id}/analytics", get(get_analytics))
        .route("/admin/bans/{user_id}", put(ban_user).delete(unban_user))
}

// ---------------------------------------------------------------------------
// POST /api/v1/admin/tickets
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketRequest {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketResponse {
    pub ticket: String,
    pub expires_in: u64,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/tickets",
    tag = "Admin",
    security(("bearer" = [])),
    request_body = CreateTicketRequest,
    responses(
        (status = 201, description = "Ticket minted", body = CreateTicketResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn create_ticket(
    _admin: AdminUser,
    State(state): State<AppState>,
    Json(body): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<CreateTicketResponse>), ApiError> {
    let mut errors = Vec::new();
    if body.user_id.trim().is_empty() {
        errors.push(FieldError {
            field: "userId".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if body.username.trim().is_empty() {
        errors.push(FieldError {
            field: "username".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let data = WsTicketData {
        user_id: body.user_id.trim().to_string(),
        username: body.username.trim().to_string(),
    };
    let ticket = tokens::issue_ws_ticket(state.kv.as_ref(), &data).await?;
    tracing::debug!(user_id = %data.user_id, "ws ticket issued");
    Ok((
        StatusCode::CREATED,
        Json(CreateTicketResponse {
            ticket,
            expires_in: WS_TICKET_TTL_SECS,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET/DELETE /api/v1/admin/rate-limits/:user_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/admin/rate-limits/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Current windows", body = RateLimitStatus),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 503, description = "Store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn get_rate_limits(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<RateLimitStatus>, ApiError> {
    let has_badge = state.chat.has_badge(&user_id).await?;
    let status = state.chat.limiter.status(&user_id, has_badge).await?;
    Ok(Json(status))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/rate-limits/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 204, description = "Windows cleared"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn reset_rate_limits(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.chat.limiter.reset(&user_id).await?;
    // The badge tier is re-read on the next message.
    state.kv.del(&badge_cache_key(&user_id)).await?;
    tracing::info!(%user_id, "rate limits reset by admin");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// PUT /api/v1/admin/cafes/:cafe_id
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCafeRequest {
    pub name: String,
    #[serde(default)]
    pub proactive_enabled: bool,
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/cafes/{cafe_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("cafe_id" = String, Path, description = "Cafe ID")),
    request_body = UpsertCafeRequest,
    responses(
        (status = 200, description = "Cafe stored", body = Cafe),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn upsert_cafe(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
    Json(body): Json<UpsertCafeRequest>,
) -> Result<Json<Cafe>, ApiError> {
    let name = body.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(ApiError::validation(vec![FieldError {
            field: "name".to_string(),
            message: "must be 1-100 characters".to_string(),
        }]));
    }
    let cafe = Cafe {
        id: cafe_id,
        name: name.to_string(),
        proactive_enabled: body.proactive_enabled,
        created_at: state.clock.now(),
    };
    state.repo.upsert_cafe(&cafe).await?;
    Ok(Json(cafe))
}

// ---------------------------------------------------------------------------
// PUT/DELETE /api/v1/admin/cafes/:cafe_id/mutes/:user_id
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MutePath {
    pub cafe_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MuteRequest {
    pub duration_minutes: i64,
    pub reason: Option<String>,
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/cafes/{cafe_id}/mutes/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(
        ("cafe_id" = String, Path, description = "Cafe ID"),
        ("user_id" = String, Path, description = "User ID"),
    ),
    request_body = MuteRequest,
    responses(
        (status = 200, description = "User muted", body = MuteRecord),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn mute_user(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(path): Path<MutePath>,
    Json(body): Json<MuteRequest>,
) -> Result<Json<MuteRecord>, ApiError> {
    if !(1..=MAX_MUTE_MINUTES).contains(&body.duration_minutes) {
        return Err(ApiError::validation(vec![FieldError {
            field: "durationMinutes".to_string(),
            message: format!("must be between 1 and {MAX_MUTE_MINUTES}"),
        }]));
    }
    let record = state
        .chat
        .moderator
        .record_mute(&path.cafe_id, &path.user_id, body.duration_minutes, body.reason)
        .await?;
    tracing::info!(cafe_id = %path.cafe_id, user_id = %path.user_id, until = %record.until, "user muted by admin");
    Ok(Json(record))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/cafes/{cafe_id}/mutes/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(
        ("cafe_id" = String, Path, description = "Cafe ID"),
        ("user_id" = String, Path, description = "User ID"),
    ),
    responses(
        (status = 204, description = "Mute lifted"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "User is not muted", body = ApiErrorBody),
    ),
)]
pub async fn unmute_user(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(path): Path<MutePath>,
) -> Result<StatusCode, ApiError> {
    if !state.chat.moderator.unmute(&path.cafe_id, &path.user_id).await? {
        return Err(ApiError::not_found("User is not muted"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// GET /api/v1/admin/cafes/:cafe_id/flagged
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/admin/cafes/{cafe_id}/flagged",
    tag = "Admin",
    security(("bearer" = [])),
    params(("cafe_id" = String, Path, description = "Cafe ID")),
    responses(
        (status = 200, description = "Flagged messages, newest first", body = [FlaggedMessage]),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn list_flagged(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
) -> Result<Json<Vec<FlaggedMessage>>, ApiError> {
    Ok(Json(state.chat.moderator.flagged(&cafe_id).await?))
}

// ---------------------------------------------------------------------------
// GET /api/v1/admin/cafes/:cafe_id/analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct AnalyticsQuery {
    /// UTC day, `YYYY-MM-DD`. Defaults to today.
    pub date: Option<NaiveDate>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/cafes/{cafe_id}/analytics",
    tag = "Admin",
    security(("bearer" = [])),
    params(("cafe_id" = String, Path, description = "Cafe ID"), AnalyticsQuery),
    responses(
        (status = 200, description = "Hourly buckets of the day", body = [HourlyAnalytics]),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn get_analytics(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(cafe_id): Path<String>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Vec<HourlyAnalytics>>, ApiError> {
    let date = query.date.unwrap_or_else(|| state.clock.now().date_naive());
    Ok(Json(state.repo.hourly_analytics(&cafe_id, date).await?))
}

// ---------------------------------------------------------------------------
// PUT/DELETE /api/v1/admin/bans/:user_id
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct BanRequest {
    pub reason: Option<String>,
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/bans/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    request_body = BanRequest,
    responses(
        (status = 204, description = "User banned"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn ban_user(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<BanRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .chat
        .moderator
        .ban(&user_id, body.reason.as_deref())
        .await?;
    tracing::info!(%user_id, "user banned by admin");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/bans/{user_id}",
    tag = "Admin",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 204, description = "Ban lifted"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "User is not banned", body = ApiErrorBody),
    ),
)]
pub async fn unban_user(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.chat.moderator.unban(&user_id).await? {
        return Err(ApiError::not_found("User is not banned"));
    }
    Ok(StatusCode::NO_CONTENT)
}
