//! Adaptive chunk sizing.
//!
//! The sender has no out-of-band view of link speed, so the chunk size is
//! tuned from observed round trips: a full-sized chunk acked quickly means
//! the link can take more, a slow ack means back off to the floor. The size
//! never leaves the `[1 KiB, negotiated max]` range.

use std::time::Duration;

/// Starting (and floor) chunk size.
pub const BASE_CHUNK_SIZE: u64 = 1024;

const FAST_CHUNK: Duration = Duration::from_millis(500);
const SLOW_CHUNK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ChunkSizer {
    size: u64,
    max: u64,
}

impl ChunkSizer {
    pub fn new(max_buf_size: u64) -> Self {
        ChunkSizer {
            size: BASE_CHUNK_SIZE.min(max_buf_size.max(BASE_CHUNK_SIZE)),
            max: max_buf_size.max(BASE_CHUNK_SIZE),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Feed back one acked chunk: its actual length and round-trip time.
    /// Grows only after a full-size fast chunk, shrinks only after a slow
    /// one.
    pub fn record(&mut self, sent: u64, elapsed: Duration) {
        if sent == self.size && elapsed < FAST_CHUNK && self.size < self.max {
            self.size = (self.size * 2).min(self.max);
        } else if elapsed >= SLOW_CHUNK && self.size > BASE_CHUNK_SIZE {
            self.size = BASE_CHUNK_SIZE;
        }
    }
}
