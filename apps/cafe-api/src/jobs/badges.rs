//! Weekly activity badges: daily expiry sweep and daily award pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Job, JobReport};
use crate::chat::service::badge_cache_key;
use crate::db::kv::KeyValueStore;
use crate::db::repo::Repository;
use crate::models::badge::BadgeKind;

const DAILY: Duration = Duration::from_secs(24 * 3600);

/// Drop the cached tier so the next message re-reads it.
async fn invalidate(kv: &dyn KeyValueStore, user_ids: &[String], report: &mut JobReport) {
    for user_id in user_ids {
        match kv.del(&badge_cache_key(user_id)).await {
            Ok(()) => report.processed += 1,
            Err(err) => {
                tracing::warn!(?err, %user_id, "badge cache invalidation failed");
                report.failed += 1;
            }
        }
    }
}

pub struct BadgeExpiryJob {
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KeyValueStore>,
}

impl BadgeExpiryJob {
    pub fn new(repo: Arc<dyn Repository>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { repo, kv }
    }
}

#[async_trait]
impl Job for BadgeExpiryJob {
    fn name(&self) -> &'static str {
        "badge_expiry"
    }

    fn interval(&self) -> Duration {
        DAILY
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let users = match self.repo.expire_badges(now).await {
            Ok(users) => users,
            Err(err) => {
                tracing::error!(?err, "expiring badges failed");
                return JobReport::failure();
            }
        };
        let mut report = JobReport::default();
        invalidate(self.kv.as_ref(), &users, &mut report).await;
        if !users.is_empty() {
            tracing::info!(users = users.len(), "badges expired");
        }
        report
    }
}

pub struct BadgeAwardJob {
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KeyValueStore>,
}

impl BadgeAwardJob {
    pub fn new(repo: Arc<dyn Repository>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { repo, kv }
    }
}

#[async_trait]
impl Job for BadgeAwardJob {
    fn name(&self) -> &'static str {
        "badge_award"
    }

    fn interval(&self) -> Duration {
        DAILY
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        for kind in BadgeKind::ALL {
            match self.repo.award_badges(kind, now).await {
                Ok(users) => {
                    if !users.is_empty() {
                        tracing::info!(kind = kind.as_str(), awarded = users.len(), "badges awarded");
                    }
                    invalidate(self.kv.as_ref(), &users, &mut report).await;
                }
                Err(err) => {
                    // One rule failing leaves the others to run.
                    tracing::error!(?err, kind = kind.as_str(), "badge award failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
