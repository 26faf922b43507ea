use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Job, JobReport};
use crate::chat::pokes::PokeService;
use crate::db::repo::Repository;

/// Collects pending pokes past their validity window.
pub struct PokeExpiryJob {
    repo: Arc<dyn Repository>,
    pokes: Arc<PokeService>,
}

impl PokeExpiryJob {
    pub fn new(repo: Arc<dyn Repository>, pokes: Arc<PokeService>) -> Self {
        Self { repo, pokes }
    }
}

#[async_trait]
impl Job for PokeExpiryJob {
    fn name(&self) -> &'static str {
        "poke_expiry"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let expired = match self.repo.expire_pokes(now).await {
            Ok(expired) => expired,
            Err(err) => {
                tracing::error!(?err, "expiring pokes failed");
                return JobReport::failure();
            }
        };

        let mut report = JobReport::default();
        for poke in &expired {
            match self.pokes.on_expired(poke).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    tracing::warn!(?err, poke_id = %poke.id, "expired poke cleanup failed");
                    report.failed += 1;
                }
            }
        }
        if report.processed > 0 {
            tracing::info!(expired = report.processed, "pokes expired");
        }
        report
    }
}
