use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Job, JobReport};
use crate::db::repo::{hour_floor, Repository};

/// Rolls the just-elapsed hour into one analytics bucket per cafe.
pub struct AnalyticsJob {
    repo: Arc<dyn Repository>,
}

impl AnalyticsJob {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Job for AnalyticsJob {
    fn name(&self) -> &'static str {
        "hourly_analytics"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let hour_start = hour_floor(now) - chrono::Duration::hours(1);
        let cafes = match self.repo.list_cafes().await {
            Ok(cafes) => cafes,
            Err(err) => {
                tracing::error!(?err, "listing cafes failed");
                return JobReport::failure();
            }
        };

        let mut report = JobReport::default();
        for cafe in &cafes {
            match self.repo.upsert_hourly_analytics(&cafe.id, hour_start, now).await {
                Ok(bucket) => {
                    tracing::debug!(
                        cafe_id = %cafe.id,
                        hour = bucket.bucket_hour,
                        messages = bucket.message_count,
                        "analytics bucket written"
                    );
                    report.processed += 1;
                }
                Err(err) => {
                    tracing::warn!(?err, cafe_id = %cafe.id, "analytics aggregation failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
