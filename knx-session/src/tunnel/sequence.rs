//! Connection-wide tunneling sequence counter

use std::sync::atomic::{AtomicU8, Ordering};

/// Sequence number stamped on every outbound TUNNELING_REQUEST
///
/// Wraps from 255 to 0. Shared by all senders on one channel.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next value
    pub fn next(&self) -> u8 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Value the next call to [`next`](Self::next) returns
    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::SeqCst)
    }

    /// Restart at 0, done for every new channel
    pub fn reset(&self) {
        self.next.store(0, Ordering::SeqCst);
    }
}
