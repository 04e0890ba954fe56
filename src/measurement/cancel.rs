//! Cooperative cancellation for a running measurement.
//!
//! A `CancelToken` is a lock-free flag shared between the invoking context and
//! the worker. The sweep polls it once per sweep point, at the start of the
//! point, before touching any hardware. A cancel request that arrives while a
//! point is settling or talking to an instrument takes effect at the next
//! checkpoint, so cancellation latency is bounded by one point duration.
//!
//! Tokens are single-use: a fresh token is created for every check/measure
//! attempt and dropped once the attempt reaches a terminal outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Only ever moves the flag from `false` to `true`.
    ///
    /// Returns `true` if this call set the flag, `false` if it was already set.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
