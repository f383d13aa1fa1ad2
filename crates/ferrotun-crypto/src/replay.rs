//! Sliding window for transport counter replay protection.
//!
//! Tracks the highest counter accepted on a keypair plus a ring of bitmap
//! blocks covering the counters just below it.
//!
//! # Design
//!
//! - Ring of 32 × 64-bit blocks; usable window is 31 blocks (1984 counters)
//!   because the block holding the newest counter is only partially valid
//! - Counters older than `highest - WINDOW_SIZE` are rejected
//! - Counters already marked within the window are rejected
//! - Counters at or above the reject-after limit are rejected
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe. The keypair wraps it in a Mutex.

const BLOCK_BITS: u64 = 64;
const RING_BLOCKS: usize = 32;

/// Sliding replay window.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest counter accepted so far
    highest: u64,
    ring: [u64; RING_BLOCKS],
    /// Counters at or beyond this are never accepted
    limit: u64,
}

impl ReplayWindow {
    /// Number of counters behind the highest that can still be accepted.
    pub const WINDOW_SIZE: u64 = (RING_BLOCKS as u64 - 1) * BLOCK_BITS;

    pub fn new(limit: u64) -> Self {
        Self {
            highest: 0,
            ring: [0; RING_BLOCKS],
            limit,
        }
    }

    /// Check whether `counter` would be accepted, without recording it.
    pub fn check(&self, counter: u64) -> bool {
        if counter >= self.limit {
            return false;
        }
        if counter > self.highest {
            return true;
        }
        if self.highest - counter > Self::WINDOW_SIZE {
            return false;
        }
        let (block, mask) = Self::position(counter);
        self.ring[block] & mask == 0
    }

    /// Check and record: returns true if fresh, false if replayed or too old.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if counter >= self.limit {
            return false;
        }

        if counter > self.highest {
            // Clear the blocks the window slides over
            let current = self.highest / BLOCK_BITS;
            let target = counter / BLOCK_BITS;
            let advance = (target - current).min(RING_BLOCKS as u64);
            for i in 1..=advance {
                self.ring[((current + i) % RING_BLOCKS as u64) as usize] = 0;
            }
            self.highest = counter;
        } else if self.highest - counter > Self::WINDOW_SIZE {
            return false;
        }

        let (block, mask) = Self::position(counter);
        let seen = self.ring[block] & mask != 0;
        self.ring[block] |= mask;
        !seen
    }

    fn position(counter: u64) -> (usize, u64) {
        let block = ((counter / BLOCK_BITS) % RING_BLOCKS as u64) as usize;
        (block, 1u64 << (counter % BLOCK_BITS))
    }
}
