//! Trending-topic extraction per cafe.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

pub const TOPIC_TTL_SECS: u64 = 3600;
/// Frequency set is trimmed to this many entries.
pub const TOPIC_SET_CAP: usize = 200;
/// A `topics-update` goes out after every this many processed messages.
pub const TOPICS_EMIT_EVERY: i64 = 10;
pub const TOP_K: usize = 10;
/// Tokens of this many characters or fewer are ignored.
pub const MAX_IGNORED_TOKEN_LEN: usize = 4;

fn counts_key(cafe_id: &str) -> String {
    format!("topics:{cafe_id}:counts")
}

fn first_seen_key(cafe_id: &str) -> String {
    format!("topics:{cafe_id}:first_seen")
}

fn seq_key(cafe_id: &str) -> String {
    format!("topics:{cafe_id}:seq")
}

fn processed_key(cafe_id: &str) -> String {
    format!("topics:{cafe_id}:processed")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TopicCount {
    pub topic: String,
    pub count: u64,
}

fn is_url_like(word: &str) -> bool {
    let lower = word
        .trim_matches(|c: char| matches!(c, ',' | '.' | '!' | '?' | ';' | ':' | '(' | ')' | '"'))
        .to_ascii_lowercase();
    if lower.contains("://") || lower.starts_with("www.") || lower.starts_with("mailto:") {
        return true;
    }
    // bare domains such as `example.com/path`
    let host = lower.split('/').next().unwrap_or_default();
    let mut labels = host.split('.');
    let has_dot = host.contains('.') && !host.ends_with('.');
    has_dot
        && labels.all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        && host
            .rsplit('.')
            .next()
            .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
}

/// Lowercased topic candidates in order of appearance.
pub fn extract_tokens(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .filter(|word| !is_url_like(word))
        .flat_map(|word| word.split(|c: char| !(c.is_alphanumeric() || c == '\'')))
        .map(|token| token.trim_matches('\'').to_lowercase())
        .filter(|token| token.chars().count() > MAX_IGNORED_TOKEN_LEN)
        .collect()
}

pub struct TopicTracker {
    kv: Arc<dyn KeyValueStore>,
}

impl TopicTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Count the topics in one message. Every [`TOPICS_EMIT_EVERY`]th call for
    /// a cafe returns the current top list so the caller can broadcast it.
    pub async fn record(
        &self,
        cafe_id: &str,
        content: &str,
    ) -> Result<Option<Vec<TopicCount>>, StoreError> {
        let counts = counts_key(cafe_id);
        let first_seen = first_seen_key(cafe_id);

        let tokens = extract_tokens(content);
        for token in &tokens {
            self.kv.zincr_by(&counts, token, 1.0).await?;
            let seq = self.kv.incr_by(&seq_key(cafe_id), 1).await?;
            self.kv
                .hset_nx(&first_seen, token, &seq.to_string())
                .await?;
        }
        if !tokens.is_empty() {
            self.evict_overflow(cafe_id, TOPIC_SET_CAP + tokens.len())
                .await?;
            for key in [&counts, &first_seen, &seq_key(cafe_id)] {
                self.kv.expire(key, TOPIC_TTL_SECS).await?;
            }
        }

        let processed = self.kv.incr_by(&processed_key(cafe_id), 1).await?;
        self.kv
            .expire(&processed_key(cafe_id), TOPIC_TTL_SECS)
            .await?;
        if processed % TOPICS_EMIT_EVERY == 0 {
            return Ok(Some(self.top(cafe_id, TOP_K).await?));
        }
        Ok(None)
    }

    /// Most frequent topics, ties broken by first appearance.
    pub async fn top(&self, cafe_id: &str, k: usize) -> Result<Vec<TopicCount>, StoreError> {
        let mut ranked = self.ranked(cafe_id, TOPIC_SET_CAP).await?;
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Up to `fetch` topics in trending order.
    async fn ranked(&self, cafe_id: &str, fetch: usize) -> Result<Vec<TopicCount>, StoreError> {
        let scored = self
            .kv
            .zrange_desc(&counts_key(cafe_id), 0, fetch.saturating_sub(1))
            .await?;
        let first_seen = self.kv.hgetall(&first_seen_key(cafe_id)).await?;

        let mut ranked: Vec<(TopicCount, i64)> = scored
            .into_iter()
            .map(|(topic, score)| {
                let seen = first_seen
                    .get(&topic)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(i64::MAX);
                (
                    TopicCount {
                        topic,
                        count: score.max(0.0) as u64,
                    },
                    seen,
                )
            })
            .collect();
        ranked.sort_by(|(a, a_seen), (b, b_seen)| b.count.cmp(&a.count).then(a_seen.cmp(b_seen)));
        Ok(ranked.into_iter().map(|(t, _)| t).collect())
    }

    /// Drop every topic ranked past [`TOPIC_SET_CAP`] from the counts and from
    /// the first-seen hash, using the same order as [`TopicTracker::top`].
    async fn evict_overflow(&self, cafe_id: &str, fetch: usize) -> Result<(), StoreError> {
        let ranked = self.ranked(cafe_id, fetch).await?;
        if ranked.len() <= TOPIC_SET_CAP {
            return Ok(());
        }
        let counts = counts_key(cafe_id);
        let first_seen = first_seen_key(cafe_id);
        for evicted in &ranked[TOPIC_SET_CAP..] {
            self.kv.zrem(&counts, &evicted.topic).await?;
            self.kv.hdel(&first_seen, &evicted.topic).await?;
        }
        Ok(())
    }

    pub async fn count(&self, cafe_id: &str, topic: &str) -> Result<u64, StoreError> {
        let top = self.top(cafe_id, TOPIC_SET_CAP).await?;
        Ok(top
            .into_iter()
            .find(|t| t.topic == topic)
            .map(|t| t.count)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;

    fn tracker() -> TopicTracker {
        tracker_with_store().0
    }

    fn tracker_with_store() -> (TopicTracker, Arc<MemoryStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let kv = Arc::new(MemoryStore::new(Arc::new(clock)));
        (TopicTracker::new(kv.clone()), kv)
    }

    #[test]
    fn short_and_url_tokens_are_dropped() {
        let tokens = extract_tokens(
            "Best latte here! see https://cafe.example/menu or www.beans.io and beans.coffee, Espresso's great",
        );
        assert_eq!(tokens, vec!["latte", "espresso's", "great"]);
    }

    #[test]
    fn tokens_are_lowercased_and_split_on_punctuation() {
        assert_eq!(extract_tokens("CROISSANT/muffin...SCONES"), vec!["croissant", "muffin", "scones"]);
        assert!(extract_tokens("the cat sat on a mat").is_empty());
    }

    #[tokio::test]
    async fn counts_strictly_increase_per_occurrence() {
        let t = tracker();
        let mut last = 0;
        for _ in 0..4 {
            t.record("c1", "anyone tried the matcha").await.unwrap();
            let now = t.count("c1", "matcha").await.unwrap();
            assert!(now > last);
            last = now;
        }
        assert_eq!(t.count("c1", "anyone").await.unwrap(), 4);
        assert_eq!(t.count("c1", "the").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn every_tenth_message_emits_ranked_topics() {
        let t = tracker();
        for i in 1..=9 {
            let content = if i % 3 == 0 { "pastry" } else { "coffee pastry" };
            assert!(t.record("c1", content).await.unwrap().is_none());
        }
        let topics = t.record("c1", "jazzy music").await.unwrap().unwrap();
        assert_eq!(topics[0], TopicCount { topic: "pastry".into(), count: 9 });
        assert_eq!(topics[1], TopicCount { topic: "coffee".into(), count: 6 });
        // equal counts fall back to first-seen order
        assert_eq!(topics[2].topic, "jazzy");
        assert_eq!(topics[3].topic, "music");
    }

    #[tokio::test]
    async fn overflow_evicts_from_counts_and_first_seen() {
        let (t, kv) = tracker_with_store();
        for i in 0..TOPIC_SET_CAP + 50 {
            t.record("c1", &format!("topic{i:03}")).await.unwrap();
        }
        let first_seen = kv.hgetall(&first_seen_key("c1")).await.unwrap();
        assert_eq!(first_seen.len(), TOPIC_SET_CAP);
        let counts = kv.zrange_desc(&counts_key("c1"), 0, 1000).await.unwrap();
        assert_eq!(counts.len(), TOPIC_SET_CAP);
    }

    #[tokio::test]
    async fn equal_counts_evict_the_latest_seen() {
        let (t, kv) = tracker_with_store();
        for i in 0..TOPIC_SET_CAP + 1 {
            t.record("c1", &format!("topic{i:03}")).await.unwrap();
        }
        assert_eq!(t.count("c1", "topic000").await.unwrap(), 1);
        assert_eq!(t.count("c1", "topic199").await.unwrap(), 1);
        assert_eq!(t.count("c1", "topic200").await.unwrap(), 0);
        let first_seen = kv.hgetall(&first_seen_key("c1")).await.unwrap();
        assert!(first_seen.contains_key("topic000"));
        assert!(!first_seen.contains_key("topic200"));

        // a repeated topic outranks the single mentions and pushes out the newest
        t.record("c1", "topic150 topic150").await.unwrap();
        t.record("c1", "latecomer").await.unwrap();
        assert_eq!(t.count("c1", "topic150").await.unwrap(), 3);
        assert_eq!(t.count("c1", "latecomer").await.unwrap(), 0);
        assert_eq!(t.count("c1", "topic199").await.unwrap(), 1);
    }
}
