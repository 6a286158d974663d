//! Lamport clock for causal ordering of replies.
//!
//! One clock is shared by every session of a server instance. All three
//! operations are single atomic read-modify-writes, so they linearize with
//! respect to each other no matter how many sessions call them.

use std::sync::atomic::{AtomicU64, Ordering};

/// A Lamport logical clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at `time`.
    pub fn starting_at(time: u64) -> Self {
        Self {
            time: AtomicU64::new(time),
        }
    }

    /// Record a local event. Returns the new time.
    pub fn tick(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold in a timestamp received from a peer: `time = max(time, remote) + 1`.
    ///
    /// The returned value is strictly greater than both the previous local
    /// time and `remote`.
    pub fn observe(&self, remote: u64) -> u64 {
        let mut current = self.time.load(Ordering::SeqCst);
        loop {
            let next = current.max(remote) + 1;
            match self
                .time
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current time, without advancing the clock.
    pub fn read(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}
