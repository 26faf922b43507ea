//! Agent mentions: rate limiting, answer cache, and the upstream stream.
//!
//! Answers are cached per `(cafe, fingerprint(question))`. On a miss, a
//! short-lived lock per fingerprint makes sure only one caller hits the
//! upstream service; everyone else polls the cache. A failed call releases
//! the lock and caches nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::rate_limit::RateLimiter;
use super::sha256_hex;
use crate::config::AgentConfig;
use crate::db::kv::KeyValueStore;
use crate::error::{AgentError, ChatError};
use crate::gateway::events::ServerEvent;

pub const AGENT_CACHE_TTL_SECS: u64 = 3600;
pub const AGENT_LOCK_TTL_SECS: u64 = 60;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LOCK_WAIT: Duration = Duration::from_secs(30);
/// Upstream calls are cut off before the lock can lapse under them.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(AGENT_LOCK_TTL_SECS - 15);

/// Events for the asking connection only.
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

/// Case, whitespace, and trailing punctuation do not change the fingerprint.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['?', '!', '.'])
        .to_string()
}

pub fn fingerprint(question: &str) -> String {
    sha256_hex(&normalize_question(question))
}

fn cache_key(cafe_id: &str, fingerprint: &str) -> String {
    format!("agent:cache:{cafe_id}:{fingerprint}")
}

fn lock_key(cafe_id: &str, fingerprint: &str) -> String {
    format!("agent:lock:{cafe_id}:{fingerprint}")
}

#[derive(Debug, Clone)]
pub struct AgentPrompt {
    pub cafe_id: String,
    pub persona: String,
    pub question: String,
}

/// Streaming completion service.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn stream(
        &self,
        prompt: &AgentPrompt,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError>;
}

/// OpenAI-compatible chat completions endpoint with `stream: true`.
pub struct HttpAgentBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAgentBackend {
    /// `None` when no endpoint is configured.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let url = config.api_url.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
}

#[derive(Deserialize, Default)]
struct CompletionDelta {
    content: Option<String>,
}

fn parse_delta(data: &str) -> Result<Option<String>, AgentError> {
    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| AgentError::Malformed(e.to_string()))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn stream(
        &self,
        prompt: &AgentPrompt,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": [
                { "role": "system", "content": prompt.persona },
                { "role": "user", "content": prompt.question },
            ],
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Status(response.status().as_u16()));
        }

        let chunks = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) => parse_delta(&event.data).transpose(),
                    Err(e) => Some(Err(AgentError::Malformed(e.to_string()))),
                }
            });
        Ok(chunks.boxed())
    }
}

/// Backend used when no endpoint is configured.
pub struct DisabledAgentBackend;

#[async_trait]
impl AgentBackend for DisabledAgentBackend {
    async fn stream(
        &self,
        _prompt: &AgentPrompt,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
        Err(AgentError::NotConfigured)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAnswer {
    pub content: String,
    pub cached: bool,
}

pub struct AgentService {
    kv: Arc<dyn KeyValueStore>,
    limiter: Arc<RateLimiter>,
    backend: Arc<dyn AgentBackend>,
    agent_username: String,
    lock_wait: Duration,
    upstream_timeout: Duration,
}

impl AgentService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        limiter: Arc<RateLimiter>,
        backend: Arc<dyn AgentBackend>,
        agent_username: String,
    ) -> Self {
        Self {
            kv,
            limiter,
            backend,
            agent_username,
            lock_wait: LOCK_WAIT,
            upstream_timeout: UPSTREAM_TIMEOUT,
        }
    }

    pub fn agent_username(&self) -> &str {
        &self.agent_username
    }

    /// Rate-limit, then answer from cache or upstream, streaming
    /// `agent-response-*` events into `sink`.
    pub async fn ask(
        &self,
        cafe_id: &str,
        user_id: &str,
        session_id: &str,
        query_id: &str,
        question: &str,
        sink: &EventSink,
    ) -> Result<AgentAnswer, ChatError> {
        let decision = self.limiter.check_agent(user_id, session_id).await?;
        if !decision.allowed {
            return Err(ChatError::RateLimited {
                action: "agent",
                remaining: 0,
                reset_at: decision.reset_at,
            });
        }

        let _ = sink.send(ServerEvent::AgentResponseStart {
            query_id: query_id.to_string(),
            cafe_id: cafe_id.to_string(),
        });
        let answer = self.resolve(cafe_id, query_id, question, sink).await?;
        let _ = sink.send(ServerEvent::AgentResponseComplete {
            query_id: query_id.to_string(),
            content: answer.content.clone(),
            cached: answer.cached,
        });
        tracing::info!(%cafe_id, %query_id, cached = answer.cached, "agent query answered");
        Ok(answer)
    }

    async fn resolve(
        &self,
        cafe_id: &str,
        query_id: &str,
        question: &str,
        sink: &EventSink,
    ) -> Result<AgentAnswer, ChatError> {
        let fp = fingerprint(question);
        let cache = cache_key(cafe_id, &fp);
        let lock = lock_key(cafe_id, &fp);
        let deadline = Instant::now() + self.lock_wait;

        loop {
            if let Some(content) = self.kv.get(&cache).await? {
                let _ = sink.send(ServerEvent::AgentResponseChunk {
                    query_id: query_id.to_string(),
                    chunk: content.clone(),
                });
                return Ok(AgentAnswer {
                    content,
                    cached: true,
                });
            }

            if self.kv.set_nx_ex(&lock, query_id, AGENT_LOCK_TTL_SECS).await? {
                let upstream = self.call_upstream(cafe_id, query_id, question, sink);
                let result = match tokio::time::timeout(self.upstream_timeout, upstream).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(self.upstream_timeout.as_secs())),
                };
                return match result {
                    Ok(content) => {
                        self.kv.set_ex(&cache, &content, AGENT_CACHE_TTL_SECS).await?;
                        self.release_lock(&lock, query_id).await;
                        Ok(AgentAnswer {
                            content,
                            cached: false,
                        })
                    }
                    Err(err) => {
                        self.release_lock(&lock, query_id).await;
                        Err(err.into())
                    }
                };
            }

            if Instant::now() >= deadline {
                return Err(ChatError::UpstreamFailure(
                    "Timed out waiting for the assistant".into(),
                ));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Drop the lock only while it is still ours; a lapsed lock may already
    /// belong to another caller.
    async fn release_lock(&self, lock: &str, query_id: &str) {
        match self.kv.del_if_eq(lock, query_id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%lock, "agent lock already lapsed"),
            Err(err) => tracing::warn!(?err, %lock, "agent lock not released, will lapse"),
        }
    }

    async fn call_upstream(
        &self,
        cafe_id: &str,
        query_id: &str,
        question: &str,
        sink: &EventSink,
    ) -> Result<String, AgentError> {
        let prompt = AgentPrompt {
            cafe_id: cafe_id.to_string(),
            persona: format!(
                "You are {}, the friendly assistant of this cafe. Answer briefly.",
                self.agent_username
            ),
            question: question.trim().to_string(),
        };

        let mut stream = self.backend.stream(&prompt).await?;
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            content.push_str(&chunk);
            let _ = sink.send(ServerEvent::AgentResponseChunk {
                query_id: query_id.to_string(),
                chunk,
            });
        }

        if content.trim().is_empty() {
            return Err(AgentError::Malformed("empty response".into()));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitConfig;
    use crate::db::kv::MemoryStore;

    struct ScriptedBackend {
        calls: AtomicUsize,
        chunks: Vec<&'static str>,
        fail: bool,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                chunks,
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn stream(
            &self,
            _prompt: &AgentPrompt,
        ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AgentError::Status(502));
            }
            let items: Vec<Result<String, AgentError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(futures_util::stream::iter(items).boxed())
        }
    }

    fn service(backend: Arc<ScriptedBackend>) -> (AgentService, Arc<MemoryStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let kv = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            Arc::new(clock),
            RateLimitConfig::default(),
        ));
        (
            AgentService::new(kv.clone(), limiter, backend, "barista".into()),
            kv,
        )
    }

    #[test]
    fn fingerprint_ignores_case_spacing_and_trailing_punctuation() {
        assert_eq!(fingerprint("What's  the WiFi password?"), fingerprint("what's the wifi password"));
        assert_ne!(fingerprint("wifi password"), fingerprint("oat milk"));
    }

    #[tokio::test]
    async fn answer_streams_then_serves_from_cache() {
        let backend = Arc::new(ScriptedBackend::new(vec!["We open ", "at 7."]));
        let (agent, _) = service(backend.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = agent.resolve("c1", "q1", "When do you open?", &tx).await.unwrap();
        assert_eq!(first, AgentAnswer { content: "We open at 7.".into(), cached: false });

        let second = agent.resolve("c1", "q2", "when do you open", &tx).await.unwrap();
        assert!(second.cached);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let mut chunks = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::AgentResponseChunk { .. }) {
                chunks += 1;
            }
        }
        assert_eq!(chunks, 3);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_upstream_call() {
        let mut backend = ScriptedBackend::new(vec!["Oat milk is available."]);
        backend.delay = Duration::from_millis(300);
        let backend = Arc::new(backend);
        let (agent, _) = service(backend.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let (a, b) = tokio::join!(
            agent.resolve("c1", "q1", "do you have oat milk", &tx),
            agent.resolve("c1", "q2", "Do you have oat milk?", &tx)
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().content, b.unwrap().content);
    }

    #[tokio::test]
    async fn failure_is_not_cached_and_releases_lock() {
        let mut backend = ScriptedBackend::new(vec![]);
        backend.fail = true;
        let backend = Arc::new(backend);
        let (agent, kv) = service(backend.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = agent.resolve("c1", "q1", "menu?", &tx).await.unwrap_err();
        assert!(matches!(err, ChatError::UpstreamFailure(_)));
        let fp = fingerprint("menu?");
        assert!(kv.get(&cache_key("c1", &fp)).await.unwrap().is_none());
        assert!(kv.get(&lock_key("c1", &fp)).await.unwrap().is_none());

        agent.resolve("c1", "q2", "menu?", &tx).await.unwrap_err();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_leaves_a_lock_taken_over_by_another_caller() {
        let mut backend = ScriptedBackend::new(vec!["Cash or card."]);
        backend.delay = Duration::from_millis(300);
        let (agent, kv) = service(Arc::new(backend));
        let (tx, _rx) = mpsc::unbounded_channel();
        let lock = lock_key("c1", &fingerprint("do you take cards"));

        let takeover = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            // The first holder's lock lapses and a second caller claims it.
            kv.del(&lock).await.unwrap();
            assert!(kv.set_nx_ex(&lock, "q2", AGENT_LOCK_TTL_SECS).await.unwrap());
        };
        let (answer, ()) = tokio::join!(agent.resolve("c1", "q1", "do you take cards", &tx), takeover);

        assert_eq!(answer.unwrap().content, "Cash or card.");
        assert_eq!(kv.get(&lock).await.unwrap().as_deref(), Some("q2"));
    }

    #[tokio::test]
    async fn slow_upstream_times_out_and_frees_the_lock() {
        let mut backend = ScriptedBackend::new(vec!["Too late."]);
        backend.delay = Duration::from_millis(500);
        let (mut agent, kv) = service(Arc::new(backend));
        agent.upstream_timeout = Duration::from_millis(50);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = agent.resolve("c1", "q1", "is it raining", &tx).await.unwrap_err();
        assert!(matches!(err, ChatError::UpstreamFailure(_)));
        let fp = fingerprint("is it raining");
        assert!(kv.get(&lock_key("c1", &fp)).await.unwrap().is_none());
        assert!(kv.get(&cache_key("c1", &fp)).await.unwrap().is_none());
    }

    #[test]
    fn upstream_timeout_is_shorter_than_the_lock() {
        assert!(UPSTREAM_TIMEOUT < Duration::from_secs(AGENT_LOCK_TTL_SECS));
    }

    #[tokio::test]
    async fn empty_upstream_answer_is_a_failure() {
        let backend = Arc::new(ScriptedBackend::new(vec!["", "  "]));
        let (agent, _) = service(backend);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            agent.resolve("c1", "q1", "hello", &tx).await,
            Err(ChatError::UpstreamFailure(_))
        ));
    }

    #[tokio::test]
    async fn ask_is_gated_by_the_global_cooldown() {
        let backend = Arc::new(ScriptedBackend::new(vec!["Hi!"]));
        let (agent, _) = service(backend);
        let (tx, _rx) = mpsc::unbounded_channel();

        agent.ask("c1", "u1", "s1", "q1", "hello", &tx).await.unwrap();
        let err = agent.ask("c1", "u2", "s2", "q2", "hello", &tx).await.unwrap_err();
        assert!(matches!(err, ChatError::RateLimited { action: "agent", .. }));
    }

    #[test]
    fn sse_delta_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(data).unwrap().as_deref(), Some("Hel"));
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{}}]}"#).unwrap(), None);
        assert!(parse_delta("not json").is_err());
    }
}
