//! Shared key-value store abstraction.
//!
//! Presence, rate-limit windows, mutes, room caches, and poke slots all live
//! behind [`KeyValueStore`]. Production runs against Redis
//! ([`super::redis_store::RedisStore`]); tests and single-process dev runs use
//! [`MemoryStore`], which honours TTLs against an injected [`Clock`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::StoreError;

/// Result of an atomic fixed-window hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    pub allowed: bool,
    /// Count stored after this hit (unchanged when denied).
    pub count: u64,
    /// Epoch milliseconds at which the window ends.
    pub reset_at_ms: i64,
}

/// Extra lifetime given to window keys past their reset instant, so a check
/// landing exactly on `reset_at` still sees the old window.
pub const WINDOW_KEY_GRACE_MS: i64 = 1_000;

/// Abstraction over the shared store used for coordination across processes.
///
/// Every method is a potential suspension point. Multi-step operations that
/// must not interleave with other processes (`window_hit`,
/// `compare_and_swap`, `get_set_ex`, `set_nx_ex`) are single atomic calls.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    /// Set only if absent. Returns `true` when this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError>;
    /// Atomically replace the value and return the previous one.
    async fn get_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<Option<String>, StoreError>;
    /// Replace `key` with `new` only if its current value equals `expected`
    /// (`None` means "key must be absent").
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Delete `key` only if it holds `expected`. Returns `true` when deleted.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Fixed-window counter: a window whose `reset_at` lies in the past is
    /// replaced by a fresh one with count 1; otherwise the count is bumped
    /// only while it is below `limit`.
    async fn window_hit(
        &self,
        key: &str,
        limit: u64,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<WindowHit, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn scard(&self, key: &str) -> Result<u64, StoreError>;

    /// Push to the head of a list and trim it to `max_len` entries.
    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;
    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError>;
    /// Inclusive range, negative indices count from the tail.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, StoreError>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;
    /// Highest-scored members first.
    async fn zrange_desc(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// Subscribe to every channel matching a `prefix*` pattern.
    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, (String, String)>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests / single process)
// ---------------------------------------------------------------------------

const PUBSUB_CAPACITY: usize = 4096;

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<(String, String)>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            clock,
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining TTL in whole seconds, if the key exists and has one.
    pub fn ttl_secs(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        let data = self.data.lock();
        let entry = data.get(key).filter(|e| !e.is_expired(now))?;
        entry.expires_at_ms.map(|at| (at - now) / 1000)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Run `f` with the map after evicting `key` if it has expired.
    fn with_key<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        f(&mut data, now)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

fn entry_of<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
    init: fn() -> Value,
) -> &'a mut Entry {
    data.entry(key.to_string())
        .or_insert_with(|| Entry::new(init()))
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn list_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn sorted_desc(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut all: Vec<(String, f64)> = members.iter().map(|(m, s)| (m.clone(), *s)).collect();
    all.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    all
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.with_key(key, |data, now| {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at_ms: Some(now + ttl_secs as i64 * 1000),
                },
            );
            Ok(())
        })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        self.with_key(key, |data, now| {
            if data.contains_key(key) {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at_ms: Some(now + ttl_secs as i64 * 1000),
                },
            );
            Ok(true)
        })
    }

    async fn get_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<Option<String>, StoreError> {
        self.with_key(key, |data, now| {
            let previous = match data.get(key) {
                None => None,
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.clone()),
                Some(_) => return Err(wrong_type(key)),
            };
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at_ms: Some(now + ttl_secs as i64 * 1000),
                },
            );
            Ok(previous)
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        self.with_key(key, |data, now| {
            let current = match data.get(key) {
                None => None,
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.as_str()),
                Some(_) => return Err(wrong_type(key)),
            };
            if current != expected {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(new.to_string()),
                    expires_at_ms: Some(now + ttl_secs as i64 * 1000),
                },
            );
            Ok(true)
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.with_key(key, |data, _| {
            data.remove(key);
            Ok(())
        })
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            Some(Entry {
                value: Value::Str(current),
                ..
            }) if current == expected => {
                data.remove(key);
                Ok(true)
            }
            Some(Entry {
                value: Value::Str(_),
                ..
            })
            | None => Ok(false),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        self.with_key(key, |data, now| match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = Some(now + ttl_secs as i64 * 1000);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_key(key, |data, _| {
            let entry = entry_of(data, key, || Value::Str("0".to_string()));
            match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| wrong_type(key))?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn window_hit(
        &self,
        key: &str,
        limit: u64,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<WindowHit, StoreError> {
        self.with_key(key, |data, _| {
            let existing = match data.get(key) {
                None => None,
                Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) => {
                    let count = h.get("count").and_then(|v| v.parse::<u64>().ok());
                    let reset_at = h.get("reset_at").and_then(|v| v.parse::<i64>().ok());
                    count.zip(reset_at)
                }
                Some(_) => return Err(wrong_type(key)),
            };

            let (count, reset_at_ms, allowed) = match existing {
                Some((count, reset_at)) if now_ms <= reset_at => {
                    if count >= limit {
                        return Ok(WindowHit {
                            allowed: false,
                            count,
                            reset_at_ms: reset_at,
                        });
                    }
                    (count + 1, reset_at, true)
                }
                _ => (1, now_ms + window_ms, true),
            };

            let mut fields = HashMap::new();
            fields.insert("count".to_string(), count.to_string());
            fields.insert("reset_at".to_string(), reset_at_ms.to_string());
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(fields),
                    expires_at_ms: Some(reset_at_ms + WINDOW_KEY_GRACE_MS),
                },
            );
            Ok(WindowHit {
                allowed,
                count,
                reset_at_ms,
            })
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::Hash(HashMap::new())).value {
                Value::Hash(h) => {
                    h.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::Hash(HashMap::new())).value {
                Value::Hash(h) => {
                    if h.contains_key(field) {
                        return Ok(false);
                    }
                    h.insert(field.to_string(), value.to_string());
                    Ok(true)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| {
            let (removed, now_empty) = match data.get_mut(key) {
                None => return Ok(false),
                Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) => (h.remove(field).is_some(), h.is_empty()),
                Some(_) => return Err(wrong_type(key)),
            };
            if now_empty {
                data.remove(key);
            }
            Ok(removed)
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::Set(HashSet::new())).value {
                Value::Set(s) => Ok(s.insert(member.to_string())),
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| match data.get_mut(key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.remove(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::List(VecDeque::new())).value {
                Value::List(l) => {
                    l.push_front(value.to_string());
                    l.truncate(max_len);
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::List(VecDeque::new())).value {
                Value::List(l) => {
                    l.extend(values.iter().cloned());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(match list_bounds(l.len(), start, stop) {
                Some((from, to)) => l.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::ZSet(HashMap::new())).value {
                Value::ZSet(z) => {
                    z.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_key(key, |data, _| match data.get_mut(key) {
            None => Ok(false),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.remove(member).is_some()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, StoreError> {
        self.with_key(key, |data, _| {
            match &mut entry_of(data, key, || Value::ZSet(HashMap::new())).value {
                Value::ZSet(z) => {
                    let score = z.entry(member.to_string()).or_insert(0.0);
                    *score += by;
                    Ok(*score)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.values().filter(|s| **s >= min && **s <= max).count() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.with_key(key, |data, _| match data.get_mut(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => {
                let before = z.len();
                z.retain(|_, s| *s < min || *s > max);
                Ok((before - z.len()) as u64)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrange_desc(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.with_key(key, |data, _| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(sorted_desc(z)
                .into_iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let now = self.clock.now_ms();
        let data = self.data.lock();
        Ok(data
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        // No subscribers is fine.
        let _ = self.events.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, (String, String)>, StoreError> {
        self.check()?;
        let pattern = pattern.to_string();
        let rx = self.events.subscribe();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((channel, payload)) => {
                            if pattern_matches(&pattern, &channel) {
                                return Some(((channel, payload), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "memory pubsub subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
