use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2026-01-01T00:00:00Z in milliseconds since Unix epoch.
const CAFE_EPOCH_MS: u64 = 1_767_225_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit time-ordered message id generator.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits), ms since the cafe epoch
/// - Bits 21–12: Worker ID (10 bits), one per server process
/// - Bits 11–0:  Sequence (12 bits), per-ms counter
///
/// Ids from one process are strictly increasing, which keeps per-session
/// message order stable when history is rebuilt from storage.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & ((1 << WORKER_BITS) - 1),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // A clock that steps backwards keeps issuing from the last seen ms.
        let mut now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now_ms <= state.last_ms {
                    now_ms = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms.saturating_sub(CAFE_EPOCH_MS);
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        id as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(CAFE_EPOCH_MS)
}

/// Extract the creation timestamp (ms since Unix epoch) from a message id.
pub fn snowflake_timestamp_ms(id: i64) -> u64 {
    let ts = (id as u64) >> (WORKER_BITS + SEQUENCE_BITS);
    ts + CAFE_EPOCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let gen = SnowflakeGenerator::new(3);
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(ids.insert(id), "duplicate id: {id}");
        }
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let gen = SnowflakeGenerator::new(0);
        let mut prev = 0i64;
        for _ in 0..1_000 {
            let id = gen.generate();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            prev = id;
        }
    }

    #[test]
    fn timestamp_is_recoverable() {
        let gen = SnowflakeGenerator::new(1);
        let before = current_ms();
        let id = gen.generate();
        let after = current_ms();

        let extracted = snowflake_timestamp_ms(id);
        assert!(extracted >= before && extracted <= after);
    }

    #[test]
    fn oversized_worker_id_is_masked() {
        let gen = SnowflakeGenerator::new(u16::MAX);
        assert!(gen.generate() > 0);
    }
}
