use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Shared store / repository failures
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error("corrupt value at key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("record not found")]
    NotFound,
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for RepoError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        RepoError::Pool(err.to_string())
    }
}

/// Failures talking to the AI completion service.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent backend not configured")]
    NotConfigured,
    #[error("agent request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("agent returned status {0}")]
    Status(u16),
    #[error("malformed agent stream: {0}")]
    Malformed(String),
    #[error("agent did not finish within {0}s")]
    Timeout(u64),
}

// ---------------------------------------------------------------------------
// Chat outcomes reported to the connection layer
// ---------------------------------------------------------------------------

/// Why a user is not allowed to post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    Muted {
        until: DateTime<Utc>,
        reason: Option<String>,
    },
    Banned,
}

/// Structured rejection of an inbound chat command.
///
/// These never escape as generic errors: the gateway maps each variant to an
/// `error` or `rate-limit-notice` event for the sending connection only.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limited until {reset_at}")]
    RateLimited {
        action: &'static str,
        remaining: u64,
        reset_at: DateTime<Utc>,
    },
    #[error("access denied")]
    AccessDenied(DenialReason),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("duplicate message")]
    Duplicate,
    #[error("shared store unavailable")]
    StoreUnavailable(#[source] StoreError),
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::RateLimited { .. } => "RATE_LIMITED",
            ChatError::AccessDenied(DenialReason::Muted { .. }) => "MUTED",
            ChatError::AccessDenied(DenialReason::Banned) => "BANNED",
            ChatError::ValidationFailed(_) => "VALIDATION_ERROR",
            ChatError::Duplicate => "DUPLICATE_MESSAGE",
            ChatError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ChatError::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        tracing::warn!(?err, "store operation failed on chat path");
        ChatError::StoreUnavailable(err)
    }
}

impl From<AgentError> for ChatError {
    fn from(err: AgentError) -> Self {
        tracing::warn!(?err, "agent upstream failed");
        ChatError::UpstreamFailure(err.to_string())
    }
}

impl From<RepoError> for ChatError {
    fn from(err: RepoError) -> Self {
        tracing::error!(?err, "repository operation failed on chat path");
        ChatError::Internal("An internal error occurred".to_string())
    }
}

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR".to_string(),
            message: "Validation failed".to_string(),
            details: Some(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "store error");
        Self::unavailable("Shared store unavailable")
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => Self::not_found("Not found"),
            other => {
                tracing::error!(err = ?other, "repository error");
                Self::internal("An internal error occurred")
            }
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ChatError::ValidationFailed(_) | ChatError::Duplicate => StatusCode::BAD_REQUEST,
            ChatError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}
