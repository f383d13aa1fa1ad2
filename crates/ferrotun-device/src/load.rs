//! Handshake pressure tracking.
//!
//! Counts handshake messages arriving in a fixed window. Once the count
//! reaches the threshold the device stays under load for one more window
//! after the burst, so a flood that pauses briefly is still challenged.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

/// Length of the counting window and of the hold-over once tripped.
pub const UNDER_LOAD_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct LoadEntry {
    count: usize,
    window_start: Option<Instant>,
    under_load_until: Option<Instant>,
}

#[derive(Debug)]
pub struct HandshakeLoad {
    threshold: usize,
    window: Duration,
    entry: Mutex<LoadEntry>,
}

impl HandshakeLoad {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            window: UNDER_LOAD_WINDOW,
            entry: Mutex::new(LoadEntry::default()),
        }
    }

    /// Count one handshake message received at `now` and report whether
    /// the device is under load.
    pub fn record(&self, now: Instant) -> bool {
        let mut entry = lock(&self.entry);

        let expired = entry
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) >= self.window);
        if expired {
            entry.count = 0;
            entry.window_start = Some(now);
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count >= self.threshold {
            entry.under_load_until = Some(now + self.window);
        }
        entry.under_load_until.is_some_and(|until| now < until)
    }

    /// Under load at `now`, without counting a message.
    pub fn is_under_load(&self, now: Instant) -> bool {
        lock(&self.entry)
            .under_load_until
            .is_some_and(|until| now < until)
    }
}
