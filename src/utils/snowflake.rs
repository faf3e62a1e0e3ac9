//! Snowflake-style id generation.
//!
//! Layout (most significant first): 1 unused sign bit, 41 bits of
//! milliseconds since [`EPOCH_MS`], 10 bits of worker id, 12 bits of
//! per-millisecond sequence. Ids from one generator are strictly increasing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Custom epoch: 2024-01-01T00:00:00Z.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Lock-free snowflake id generator.
#[derive(Debug)]
pub struct SnowflakeId {
    worker_id: u64,
    /// Packed `(timestamp << SEQUENCE_BITS) | sequence` of the last issued id.
    last: AtomicU64,
}

impl SnowflakeId {
    /// Create a generator for the given worker id (masked to 10 bits).
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id & MAX_WORKER_ID),
            last: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id as u16
    }

    /// Issue the next id.
    pub fn next_id(&self) -> i64 {
        loop {
            let now = current_millis();
            let last = self.last.load(Ordering::Acquire);
            let last_ts = last >> SEQUENCE_BITS;

            // Clock going backwards or sequence exhaustion: borrow from the
            // last timestamp so ids keep increasing.
            let next = if now > last_ts {
                now << SEQUENCE_BITS
            } else {
                last + 1
            };

            if self
                .last
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let ts = next >> SEQUENCE_BITS;
                let seq = next & SEQUENCE_MASK;
                return ((ts << (WORKER_BITS + SEQUENCE_BITS))
                    | (self.worker_id << SEQUENCE_BITS)
                    | seq) as i64;
            }
        }
    }
}

impl Default for SnowflakeId {
    fn default() -> Self {
        Self::new(0)
    }
}

fn current_millis() -> u64 {
    let now = chrono::Utc::now().timestamp_millis() as u64;
    now.saturating_sub(EPOCH_MS)
}
