//! Time-of-day nudges posted by the cafe assistant into busy rooms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};

use super::{Job, JobReport};
use crate::chat::service::ChatService;
use crate::db::kv::KeyValueStore;
use crate::db::repo::Repository;
use crate::error::ChatError;
use crate::models::analytics::NewProactiveSend;
use crate::models::message::MESSAGE_TYPE_PROACTIVE;

pub const PROACTIVE_COOLDOWN_SECS: u64 = 10 * 60;
/// Fewer people than this in the cafe and the room stays quiet.
pub const MIN_PRESENT_USERS: u64 = 2;

fn cooldown_key(cafe_id: &str) -> String {
    format!("proactive:cooldown:{cafe_id}")
}

struct Template {
    key: &'static str,
    text: &'static str,
}

const MORNING: &[Template] = &[
    Template {
        key: "morning_hello",
        text: "Good morning! {count} of you are here already. What is everyone drinking?",
    },
    Template {
        key: "morning_plans",
        text: "Morning crowd of {count}! Anyone working on something fun today?",
    },
];

const AFTERNOON: &[Template] = &[
    Template {
        key: "afternoon_break",
        text: "Afternoon break time. {count} people in the cafe, say hi to someone new!",
    },
    Template {
        key: "afternoon_recs",
        text: "{count} of you here this afternoon. Got a book or playlist to recommend?",
    },
];

const EVENING: &[Template] = &[Template {
    key: "evening_wind_down",
    text: "Evening, all {count} of you. How did the day go?",
}];

const NIGHT: &[Template] = &[Template {
    key: "night_owls",
    text: "Night owls unite! {count} of you still here. What keeps you up?",
}];

/// Template for the UTC hour of `now`, rotating within the slot by minute.
fn pick_template(now: DateTime<Utc>) -> &'static Template {
    let slot = match now.hour() {
        5..=10 => MORNING,
        11..=16 => AFTERNOON,
        17..=21 => EVENING,
        _ => NIGHT,
    };
    &slot[now.minute() as usize % slot.len()]
}

pub struct ProactiveJob {
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KeyValueStore>,
    chat: Arc<ChatService>,
}

impl ProactiveJob {
    pub fn new(repo: Arc<dyn Repository>, kv: Arc<dyn KeyValueStore>, chat: Arc<ChatService>) -> Self {
        Self { repo, kv, chat }
    }

    async fn nudge(&self, cafe_id: &str, now: DateTime<Utc>) -> Result<bool, ChatError> {
        let present = self.chat.presence.presence_summary(cafe_id).await.in_cafe;
        if present < MIN_PRESENT_USERS {
            return Ok(false);
        }
        let cooldown = cooldown_key(cafe_id);
        let claim = now.timestamp().to_string();
        let claimed = self
            .kv
            .set_nx_ex(&cooldown, &claim, PROACTIVE_COOLDOWN_SECS)
            .await?;
        if !claimed {
            return Ok(false);
        }

        let template = pick_template(now);
        let content = template.text.replace("{count}", &present.to_string());
        if let Err(err) = self
            .chat
            .post_as_agent(cafe_id, content.clone(), MESSAGE_TYPE_PROACTIVE)
            .await
        {
            // Nothing reached the room, so the next run may try again.
            if let Err(release) = self.kv.del_if_eq(&cooldown, &claim).await {
                tracing::warn!(?release, %cafe_id, "proactive cooldown not released");
            }
            return Err(err);
        }

        let send = NewProactiveSend {
            cafe_id: cafe_id.to_string(),
            template_key: template.key.to_string(),
            content,
            present_users: present as i32,
            sent_at: now,
        };
        if let Err(err) = self.repo.record_proactive_send(&send).await {
            // The message is out; only the log row is missing.
            tracing::warn!(?err, %cafe_id, "proactive send not recorded");
        }
        tracing::info!(%cafe_id, template = template.key, present, "proactive message sent");
        Ok(true)
    }
}

#[async_trait]
impl Job for ProactiveJob {
    fn name(&self) -> &'static str {
        "proactive_messages"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(2 * 60)
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let cafes = match self.repo.list_cafes().await {
            Ok(cafes) => cafes,
            Err(err) => {
                tracing::error!(?err, "listing cafes failed");
                return JobReport::failure();
            }
        };

        let mut report = JobReport::default();
        for cafe in cafes.iter().filter(|c| c.proactive_enabled) {
            match self.nudge(&cafe.id, now).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(?err, cafe_id = %cafe.id, "proactive message failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
