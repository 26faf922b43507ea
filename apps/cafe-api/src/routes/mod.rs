pub mod admin;
pub mod cafes;
pub mod health;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", cafes::router().merge(admin::router()))
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Cafes
        cafes::get_presence,
        cafes::list_messages,
        cafes::list_topics,
        // Admin
        admin::create_ticket,
        admin::get_rate_limits,
        admin::reset_rate_limits,
        admin::upsert_cafe,
        admin::mute_user,
        admin::unmute_user,
        admin::list_flagged,
        admin::get_analytics,
        admin::ban_user,
        admin::unban_user,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Models
            crate::models::message::ChatMessage,
            crate::models::cafe::Cafe,
            crate::models::analytics::HourlyAnalytics,
            crate::chat::presence::PresenceSummary,
            crate::chat::topics::TopicCount,
            crate::chat::moderation::MuteRecord,
            crate::chat::moderation::FlaggedMessage,
            crate::chat::rate_limit::RateLimitStatus,
            crate::chat::rate_limit::WindowStatus,
            // Route request/response types
            health::HealthResponse,
            cafes::ListMessagesResponse,
            cafes::TopicsResponse,
            admin::CreateTicketRequest,
            admin::CreateTicketResponse,
            admin::UpsertCafeRequest,
            admin::MuteRequest,
            admin::BanRequest,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Cafes", description = "Room presence, history and topics"),
        (name = "Admin", description = "Tickets, moderation and limits"),
    )
)]
pub struct ApiDoc;
