#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use chrono::{TimeZone, Utc};

use cafe_api::chat::agent::{AgentBackend, DisabledAgentBackend};
use cafe_api::chat::presence::Session;
use cafe_api::clock::ManualClock;
use cafe_api::config::Config;
use cafe_api::db::kv::MemoryStore;
use cafe_api::db::repo::MemoryRepository;
use cafe_api::AppState;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Everything a test needs to drive the app and inspect its collaborators.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub repo: Arc<MemoryRepository>,
    pub clock: ManualClock,
}

impl TestApp {
    pub fn router(&self) -> Router {
        cafe_api::routes::router().with_state(self.state.clone())
    }

    /// Join `cafe_id` as `user_id` (username equals the id) and return the
    /// presence session.
    pub async fn join(&self, user_id: &str, cafe_id: &str, in_cafe: bool) -> Session {
        self.state
            .chat
            .join_room(user_id, user_id, cafe_id, in_cafe)
            .await
            .expect("join room")
            .session
    }
}

pub fn test_config() -> Config {
    Config {
        admin_token: ADMIN_TOKEN.to_string(),
        jobs_enabled: false,
        ..Config::default()
    }
}

/// In-memory app on a manual clock set to Monday 2026-03-02 10:00 UTC.
pub fn test_app() -> TestApp {
    test_app_with(Arc::new(DisabledAgentBackend))
}

pub fn test_app_with(backend: Arc<dyn AgentBackend>) -> TestApp {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let repo = Arc::new(MemoryRepository::new());
    let state = AppState::new(
        test_config(),
        store.clone(),
        repo.clone(),
        Arc::new(clock.clone()),
        backend,
    );
    TestApp {
        state,
        store,
        repo,
        clock,
    }
}

pub fn admin_header() -> String {
    format!("Bearer {ADMIN_TOKEN}")
}
