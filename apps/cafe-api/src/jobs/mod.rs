//! Periodic background jobs.
//!
//! Each [`Job`] runs on its own tokio interval. A run never aborts the loop:
//! failures are counted in the [`JobReport`] and logged. Every job is safe to
//! run twice for the same instant.

pub mod analytics;
pub mod badges;
pub mod poke_expiry;
pub mod proactive;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;

/// Outcome of one job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    /// Items the run acted on.
    pub processed: usize,
    /// Items that were looked at and left alone.
    pub skipped: usize,
    pub failed: usize,
}

impl JobReport {
    pub fn failure() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    async fn run(&self, now: DateTime<Utc>) -> JobReport;
}

/// Spawn one interval loop per job. The first run happens one interval
/// after startup.
pub fn spawn_all(jobs: Vec<Arc<dyn Job>>, clock: Arc<dyn Clock>) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let clock = clock.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(job.interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // Skip the first immediate tick.
                interval.tick().await;
                tracing::info!(job = job.name(), every_secs = job.interval().as_secs(), "job scheduled");

                loop {
                    interval.tick().await;
                    let report = job.run(clock.now()).await;
                    if report.failed > 0 {
                        tracing::warn!(
                            job = job.name(),
                            processed = report.processed,
                            skipped = report.skipped,
                            failed = report.failed,
                            "job run finished with failures"
                        );
                    } else {
                        tracing::debug!(
                            job = job.name(),
                            processed = report.processed,
                            skipped = report.skipped,
                            "job run finished"
                        );
                    }
                }
            })
        })
        .collect()
}
