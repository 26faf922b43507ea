pub mod auth;
pub mod chat;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod models;
pub mod routes;

use std::sync::Arc;

use chat::agent::AgentBackend;
use chat::service::ChatService;
use clock::Clock;
use config::Config;
use db::kv::KeyValueStore;
use db::repo::Repository;
use gateway::fanout::GatewayBroadcast;
use jobs::Job;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KeyValueStore>,
    pub repo: Arc<dyn Repository>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub broadcast: Arc<GatewayBroadcast>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        let chat = ChatService::assemble(kv.clone(), repo.clone(), clock.clone(), &config, backend);
        Self {
            kv,
            repo,
            clock,
            config: Arc::new(config),
            broadcast: Arc::new(GatewayBroadcast::new()),
            chat: Arc::new(chat),
        }
    }

    /// The background jobs this process runs when jobs are enabled.
    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        vec![
            Arc::new(jobs::poke_expiry::PokeExpiryJob::new(
                self.repo.clone(),
                self.chat.pokes.clone(),
            )),
            Arc::new(jobs::badges::BadgeExpiryJob::new(self.repo.clone(), self.kv.clone())),
            Arc::new(jobs::badges::BadgeAwardJob::new(self.repo.clone(), self.kv.clone())),
            Arc::new(jobs::analytics::AnalyticsJob::new(self.repo.clone())),
            Arc::new(jobs::proactive::ProactiveJob::new(
                self.repo.clone(),
                self.kv.clone(),
                self.chat.clone(),
            )),
        ]
    }
}
