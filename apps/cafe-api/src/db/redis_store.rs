//! Redis-backed [`KeyValueStore`].
//!
//! Conditional updates run as Lua scripts so each one is a single atomic
//! command on the server, whichever process issues it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::kv::{KeyValueStore, WindowHit, WINDOW_KEY_GRACE_MS};
use crate::error::StoreError;

const WINDOW_HIT_LUA: &str = r#"
local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
local reset_at = tonumber(redis.call('HGET', KEYS[1], 'reset_at'))
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local grace = tonumber(ARGV[4])
if count == nil or reset_at == nil or now > reset_at then
  reset_at = now + window
  redis.call('HSET', KEYS[1], 'count', 1, 'reset_at', reset_at)
  redis.call('PEXPIRE', KEYS[1], window + grace)
  return {1, 1, reset_at}
end
if count >= limit then
  return {0, count, reset_at}
end
count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {1, count, reset_at}
"#;

const COMPARE_AND_SWAP_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == 'absent' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
return 1
"#;

const GET_SET_LUA: &str = r#"
local previous = redis.call('GET', KEYS[1])
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return previous
"#;

const DEL_IF_EQ_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: u64 = 200;

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    window_hit: Script,
    compare_and_swap: Script,
    get_set: Script,
    del_if_eq: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("redis connection manager ready");
        Ok(Self {
            client,
            conn,
            window_hit: Script::new(WINDOW_HIT_LUA),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_LUA),
            get_set: Script::new(GET_SET_LUA),
            del_if_eq: Script::new(DEL_IF_EQ_LUA),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Score bound as Redis spells it.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn get_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<Option<String>, StoreError> {
        let previous: Option<String> = self
            .get_set
            .key(key)
            .arg(value)
            .arg(ttl_secs)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(previous)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mode = if expected.is_some() { "match" } else { "absent" };
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(mode)
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl_secs)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(swapped == 1)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed == 1)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let set: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(set == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn window_hit(
        &self,
        key: &str,
        limit: u64,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<WindowHit, StoreError> {
        let (allowed, count, reset_at_ms): (i64, u64, i64) = self
            .window_hit
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(now_ms)
            .arg(WINDOW_KEY_GRACE_MS)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(WindowHit {
            allowed: allowed == 1,
            count,
            reset_at_ms,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let set: i64 = redis::cmd("HSETNX")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(set == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let all: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut self.conn()).await?;
        Ok(all)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let found: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(found == 1)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut self.conn()).await?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let count: u64 = redis::cmd("SCARD").arg(key).query_async(&mut self.conn()).await?;
        Ok(count)
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(max_len as i64 - 1)
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await?;
        Ok(items)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, StoreError> {
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(key)
            .arg(by)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(score)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut self.conn())
            .await?;
        Ok(count)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn zrange_desc(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let members: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, (String, String)>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some((channel, payload)),
                Err(err) => {
                    tracing::warn!(?err, %channel, "dropping undecodable pubsub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
