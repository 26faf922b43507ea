use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cafe_api::chat::agent::{AgentBackend, DisabledAgentBackend, HttpAgentBackend};
use cafe_api::clock::{Clock, SystemClock};
use cafe_api::config::Config;
use cafe_api::db::kv::{KeyValueStore, MemoryStore};
use cafe_api::db::pg_repo::PgRepository;
use cafe_api::db::redis_store::RedisStore;
use cafe_api::db::repo::{MemoryRepository, Repository};
use cafe_api::gateway::fanout::spawn_relay;
use cafe_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await.expect("failed to connect to redis")),
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory store (single process only)");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let repo: Arc<dyn Repository> = match &config.database_url {
        Some(url) => {
            let db = cafe_api::db::pool::connect(url).expect("failed to create database pool");
            Arc::new(PgRepository::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory repository");
            Arc::new(MemoryRepository::new())
        }
    };

    let backend: Arc<dyn AgentBackend> = match HttpAgentBackend::from_config(&config.agent) {
        Some(backend) => Arc::new(backend),
        None => {
            tracing::info!("AGENT_API_URL not set, agent mentions disabled");
            Arc::new(DisabledAgentBackend)
        }
    };

    let jobs_enabled = config.jobs_enabled;
    let state = AppState::new(config, kv, repo, clock, backend);

    let _relay = spawn_relay(state.kv.clone(), state.broadcast.clone());
    let _jobs = if jobs_enabled {
        cafe_api::jobs::spawn_all(state.jobs(), state.clock.clone())
    } else {
        tracing::info!("background jobs disabled");
        Vec::new()
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(cafe_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "cafe-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server error");
}
