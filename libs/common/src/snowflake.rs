use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::uid::Uid;

/// Custom epoch: 2024-01-01T00:00:00Z in milliseconds since Unix epoch.
const PALAVER_EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1; // 4095

struct State {
    last_ms: u64,
    sequence: u64,
}

/// Snowflake-style 64-bit user-id generator.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits) — ms since the Palaver epoch
/// - Bits 21–12: Worker ID (10 bits) — cluster node ordinal
/// - Bits 11–0:  Sequence (12 bits) — per-ms counter, max 4096/ms
///
/// Ids are always non-zero: the timestamp component is non-zero for any
/// clock past the epoch, so the generated value can never collide with
/// the reserved zero `Uid`.
pub struct UidGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl UidGenerator {
    pub fn new(worker_id: u16) -> Self {
        assert!(
            (worker_id as u64) < (1 << WORKER_BITS),
            "worker_id must fit in {WORKER_BITS} bits"
        );
        Self {
            worker_id: worker_id as u64,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> Uid {
        let mut state = self.state.lock().unwrap();

        let mut now_ms = current_ms();

        if now_ms < state.last_ms {
            panic!(
                "Clock moved backwards: last_ms={}, now_ms={}",
                state.last_ms, now_ms
            );
        }

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond — spin-wait.
                while now_ms == state.last_ms {
                    now_ms = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms - PALAVER_EPOCH_MS;
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        Uid(id)
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let gen = UidGenerator::new(0);
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(ids.insert(id), "duplicate uid: {id}");
        }
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let gen = UidGenerator::new(0);
        let mut prev = Uid(0);
        for _ in 0..1_000 {
            let id = gen.generate();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            prev = id;
        }
    }

    #[test]
    fn ids_are_never_zero() {
        let gen = UidGenerator::new(1);
        for _ in 0..100 {
            assert!(!gen.generate().is_zero());
        }
    }
}
