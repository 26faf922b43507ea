//! Cross-process event fan-out.
//!
//! Producers never write to sockets directly. They publish serialized
//! [`ServerEvent`]s on the shared store's pub/sub (`room:{cafe_id}` or
//! `user:{user_id}`). Every process runs one relay task that subscribes to
//! both patterns and re-dispatches into a local `tokio::sync::broadcast`
//! channel; each connected session subscribes to that channel and filters by
//! its room and user.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::events::ServerEvent;
use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

const ROOM_CHANNEL_PREFIX: &str = "room:";
const USER_CHANNEL_PREFIX: &str = "user:";
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Who an event is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Room(String),
    User(String),
}

impl Audience {
    pub fn channel(&self) -> String {
        match self {
            Audience::Room(cafe_id) => format!("{ROOM_CHANNEL_PREFIX}{cafe_id}"),
            Audience::User(user_id) => format!("{USER_CHANNEL_PREFIX}{user_id}"),
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        if let Some(cafe_id) = channel.strip_prefix(ROOM_CHANNEL_PREFIX) {
            return Some(Audience::Room(cafe_id.to_string()));
        }
        channel
            .strip_prefix(USER_CHANNEL_PREFIX)
            .map(|user_id| Audience::User(user_id.to_string()))
    }
}

/// A serialized event on its way to local sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub audience: Audience,
    /// JSON text of a [`ServerEvent`], forwarded to sockets as-is.
    pub json: String,
}

/// The process-local broadcast hub, held in AppState.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Each gateway session calls this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, payload: BroadcastPayload) {
        // send() errs when nobody is subscribed.
        let _ = self.sender.send(Arc::new(payload));
    }
}

/// Publishes events through the shared store so every process sees them.
#[derive(Clone)]
pub struct EventBus {
    kv: Arc<dyn KeyValueStore>,
}

impl EventBus {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn publish(&self, audience: &Audience, event: &ServerEvent) -> Result<(), StoreError> {
        let json = serde_json::to_string(event).map_err(|e| StoreError::Corrupt {
            key: audience.channel(),
            reason: e.to_string(),
        })?;
        self.kv.publish(&audience.channel(), &json).await
    }

    pub async fn to_room(&self, cafe_id: &str, event: &ServerEvent) -> Result<(), StoreError> {
        self.publish(&Audience::Room(cafe_id.to_string()), event).await
    }

    pub async fn to_user(&self, user_id: &str, event: &ServerEvent) -> Result<(), StoreError> {
        self.publish(&Audience::User(user_id.to_string()), event).await
    }
}

/// Spawn the relay from store pub/sub into the local broadcast hub. The
/// subscription is re-established whenever it drops.
pub fn spawn_relay(kv: Arc<dyn KeyValueStore>, broadcast: Arc<GatewayBroadcast>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match relay_once(kv.as_ref(), &broadcast).await {
                Ok(()) => tracing::warn!("pubsub relay stream ended, resubscribing"),
                Err(err) => tracing::error!(?err, "pubsub relay failed to subscribe"),
            }
            tokio::time::sleep(RELAY_RETRY_DELAY).await;
        }
    })
}

/// Subscribe once and forward until the stream ends.
pub async fn relay_once(kv: &dyn KeyValueStore, broadcast: &GatewayBroadcast) -> Result<(), StoreError> {
    let rooms = kv.psubscribe(&format!("{ROOM_CHANNEL_PREFIX}*")).await?;
    let users = kv.psubscribe(&format!("{USER_CHANNEL_PREFIX}*")).await?;
    tracing::info!("pubsub relay subscribed");

    let mut merged = stream::select(rooms, users);
    while let Some((channel, json)) = merged.next().await {
        match Audience::from_channel(&channel) {
            Some(audience) => broadcast.dispatch(BroadcastPayload { audience, json }),
            None => tracing::debug!(%channel, "ignoring message on unknown channel"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;

    #[test]
    fn channels_round_trip_to_audiences() {
        let room = Audience::Room("cafe_1".into());
        assert_eq!(Audience::from_channel(&room.channel()), Some(room));
        assert_eq!(Audience::from_channel("other:x"), None);
    }

    #[tokio::test]
    async fn relay_forwards_published_events() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(Arc::new(clock)));
        let hub = Arc::new(GatewayBroadcast::new());
        let mut rx = hub.subscribe();
        let relay = spawn_relay(kv.clone(), hub.clone());
        // let the relay subscribe before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;

        EventBus::new(kv)
            .to_user("u1", &ServerEvent::HeartbeatAck)
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.audience, Audience::User("u1".into()));
        assert_eq!(payload.json, r#"{"type":"heartbeat-ack"}"#);
        relay.abort();
    }
}
