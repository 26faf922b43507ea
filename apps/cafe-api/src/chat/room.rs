//! Room delivery and the bounded recent-message log.

use std::collections::HashSet;
use std::sync::Arc;

use crate::chat::topics::{TopicCount, TopicTracker, TOP_K};
use crate::db::kv::KeyValueStore;
use crate::db::repo::Repository;
use crate::error::{ChatError, StoreError};
use crate::gateway::events::ServerEvent;
use crate::gateway::fanout::EventBus;
use crate::models::message::ChatMessage;

pub const ROOM_LOG_CAP: usize = 100;
pub const ROOM_LOG_TTL_SECS: u64 = 3600;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

fn log_key(cafe_id: &str) -> String {
    format!("room:{cafe_id}:log")
}

pub struct RoomService {
    kv: Arc<dyn KeyValueStore>,
    repo: Arc<dyn Repository>,
    bus: EventBus,
    topics: TopicTracker,
}

impl RoomService {
    pub fn new(kv: Arc<dyn KeyValueStore>, repo: Arc<dyn Repository>, bus: EventBus) -> Self {
        Self {
            topics: TopicTracker::new(kv.clone()),
            kv,
            repo,
            bus,
        }
    }

    /// Persist, cache, broadcast, and feed topic extraction.
    pub async fn publish(&self, message: &ChatMessage) -> Result<(), ChatError> {
        self.repo.insert_message(message).await?;

        let key = log_key(&message.cafe_id);
        let json = serde_json::to_string(message).map_err(|e| ChatError::Internal(e.to_string()))?;
        self.kv.lpush_trim(&key, &json, ROOM_LOG_CAP).await?;
        self.kv.expire(&key, ROOM_LOG_TTL_SECS).await?;

        self.bus
            .to_room(
                &message.cafe_id,
                &ServerEvent::MessageNew {
                    message: message.clone(),
                },
            )
            .await?;

        // Trending topics are advisory; a failure here never fails the send.
        match self.topics.record(&message.cafe_id, &message.content).await {
            Ok(Some(topics)) => {
                let event = ServerEvent::TopicsUpdate {
                    cafe_id: message.cafe_id.clone(),
                    topics,
                };
                if let Err(err) = self.bus.to_room(&message.cafe_id, &event).await {
                    tracing::warn!(?err, cafe_id = %message.cafe_id, "topics update not delivered");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(?err, cafe_id = %message.cafe_id, "topic extraction failed"),
        }

        tracing::debug!(message_id = message.id, cafe_id = %message.cafe_id, "message published");
        Ok(())
    }

    /// Up to `limit` messages skipping the `offset` newest, oldest first.
    /// An expired log is rebuilt from the repository.
    pub async fn history(
        &self,
        cafe_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let key = log_key(cafe_id);
        let mut raw = self.kv.lrange(&key, 0, -1).await?;
        if raw.is_empty() {
            raw = self.rebuild(cafe_id).await?;
        }

        let mut seen = HashSet::new();
        let newest_first: Vec<ChatMessage> = raw
            .iter()
            .filter_map(|entry| serde_json::from_str::<ChatMessage>(entry).ok())
            .filter(|m| seen.insert(m.id))
            .collect();

        let mut page: Vec<ChatMessage> = newest_first
            .into_iter()
            .skip(offset)
            .take(limit.min(ROOM_LOG_CAP))
            .collect();
        page.reverse();
        Ok(page)
    }

    pub async fn trending(&self, cafe_id: &str) -> Result<Vec<TopicCount>, StoreError> {
        self.topics.top(cafe_id, TOP_K).await
    }

    async fn rebuild(&self, cafe_id: &str) -> Result<Vec<String>, ChatError> {
        let recent = self.repo.recent_messages(cafe_id, ROOM_LOG_CAP as i64).await?;
        if recent.is_empty() {
            return Ok(Vec::new());
        }
        let entries = recent
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ChatError::Internal(e.to_string()))?;

        let key = log_key(cafe_id);
        self.kv.rpush(&key, &entries).await?;
        self.kv.expire(&key, ROOM_LOG_TTL_SECS).await?;
        tracing::info!(%cafe_id, entries = entries.len(), "room log rebuilt from repository");
        Ok(entries)
    }
}
