//! Cooperative cancellation token.
//!
//! A single token is threaded through every long-running operation: the
//! streaming splitter polls it between blocks, the directory processor polls
//! it before starting new work.  Cancellation is level-triggered and sticky;
//! there is no reset.  Timeouts are layered on top by the caller (cancel from
//! a timer thread).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation flag shared across tasks.
///
/// Clones observe the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  In-flight per-block operations finish their
    /// current buffer and then abort with a `Cancelled` error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
