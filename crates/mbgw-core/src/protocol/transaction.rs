//! Per-device transaction counter for outgoing Modbus-TCP frames.
//!
//! # What is a transaction id? (for beginners)
//!
//! Every Modbus-TCP request carries a 16-bit *transaction id* in its header and
//! the device copies it into the reply.  A client that pipelines several
//! requests uses the id to pair replies with requests.
//!
//! The gateway never pipelines: at most one request per device is in flight,
//! so replies are paired with requests by order alone.  The id is still
//! written into every frame, and the session can optionally compare the echoed
//! value against the one it sent.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU16`, so `next()` can be called through a shared
//! reference.  In practice only the device's dispatch task calls it, but stats
//! readers may call [`TransactionCounter::current`] from other tasks.

use std::sync::atomic::{AtomicU16, Ordering};

/// A monotonically increasing 16-bit transaction counter.
///
/// The counter starts at 0 and [`next`](Self::next) returns the value *after*
/// incrementing, so the first frame sent to a device carries id 1.  It wraps
/// from `u16::MAX` back to 0 without panicking.
///
/// # Examples
///
/// ```rust
/// use mbgw_core::protocol::TransactionCounter;
///
/// let counter = TransactionCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct TransactionCounter {
    inner: AtomicU16,
}

impl TransactionCounter {
    /// Creates a new counter; the first id handed out is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU16::new(0),
        }
    }

    /// Increments the counter and returns the new value.
    ///
    /// `fetch_add` wraps on overflow, so `u16::MAX + 1` becomes 0.
    pub fn next(&self) -> u16 {
        self.inner.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Returns the id of the most recently sent frame (0 if none yet).
    pub fn current(&self) -> u16 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self::new()
    }
}
