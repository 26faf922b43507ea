//! Opaque tokens and single-use WebSocket tickets.

use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

// ---------------------------------------------------------------------------
// WebSocket tickets: 30-second TTL, single use
// ---------------------------------------------------------------------------

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

/// Marker left behind by a consumed ticket until its key lapses.
const CONSUMED: &str = "consumed";

/// Identity a ticket vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsTicketData {
    pub user_id: String,
    pub username: String,
}

fn ticket_key(ticket: &str) -> String {
    format!("cafe:wst:{ticket}")
}

/// Mint and store a ticket for `data`.
pub async fn issue_ws_ticket(
    kv: &dyn KeyValueStore,
    data: &WsTicketData,
) -> Result<String, StoreError> {
    let ticket = generate_opaque_token("wst", 32);
    let key = ticket_key(&ticket);
    let value = serde_json::to_string(data).map_err(|e| StoreError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    kv.set_ex(&key, &value, WS_TICKET_TTL_SECS).await?;
    Ok(ticket)
}

/// Redeem a ticket. The swap to the consumed marker is atomic, so two
/// connections racing on the same ticket see it succeed at most once.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<WsTicketData>, StoreError> {
    let key = ticket_key(ticket);
    match kv.get_set_ex(&key, CONSUMED, WS_TICKET_TTL_SECS).await? {
        Some(value) if value != CONSUMED => {
            let data = serde_json::from_str(&value).map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
            Ok(Some(data))
        }
        Some(_) => Ok(None),
        None => {
            // Nothing was there; do not leave the marker lying around.
            kv.del(&key).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::kv::MemoryStore;

    fn ticket_data() -> WsTicketData {
        WsTicketData {
            user_id: "usr_1".into(),
            username: "ana".into(),
        }
    }

    #[tokio::test]
    async fn ticket_is_single_use() {
        let kv = MemoryStore::new(Arc::new(ManualClock::new(Utc::now())));
        let ticket = issue_ws_ticket(&kv, &ticket_data()).await.unwrap();
        assert!(ticket.starts_with("wst_"));

        let first = consume_ws_ticket(&kv, &ticket).await.unwrap();
        assert_eq!(first, Some(ticket_data()));
        assert_eq!(consume_ws_ticket(&kv, &ticket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ticket_lapses() {
        let clock = ManualClock::new(Utc::now());
        let kv = MemoryStore::new(Arc::new(clock.clone()));
        let ticket = issue_ws_ticket(&kv, &ticket_data()).await.unwrap();
        clock.advance(Duration::seconds(31));
        assert_eq!(consume_ws_ticket(&kv, &ticket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_ticket_is_rejected() {
        let kv = MemoryStore::new(Arc::new(ManualClock::new(Utc::now())));
        assert_eq!(consume_ws_ticket(&kv, "wst_nope").await.unwrap(), None);
        assert_eq!(kv.get(&ticket_key("wst_nope")).await.unwrap(), None);
    }
}
