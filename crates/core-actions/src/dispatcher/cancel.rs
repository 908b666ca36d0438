//! Cooperative cancellation flag, polled between subsequences.
//!
//! Cancelling mid-chord is never observed: the flag is only consulted at
//! subsequence boundaries, so a chord's press/update/sleep/release always
//! completes atomically once started.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the flag in one step, so a cancellation only ever
    /// aborts the sequence that was in flight when it was raised.
    pub fn take_and_reset(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
