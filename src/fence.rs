//! Provides `Fence`, the async lock that serializes writers of a ring.
//!
//! A writer may hold the fence across a backpressure wait, so waiting writers
//! must not spin. Instead of yielding in a loop, a waiter parks on a `Notify`
//! and the releasing guard hands the turn to exactly one of them.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// An RAII guard that signifies a `Fence` has been locked.
///
/// Dropping it releases the fence and wakes one waiting writer, including
/// when the owning future is cancelled mid-wait.
#[derive(Debug)]
pub(crate) struct Guard<'a>(&'a Fence);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.0.flag.store(false, Ordering::Release);
        self.0.released.notify_one();
    }
}

#[derive(Debug, Default)]
pub(crate) struct Fence {
    flag: CachePadded<AtomicBool>,
    released: Notify,
}

impl Fence {
    /// Attempts to acquire the lock immediately.
    #[inline]
    pub(crate) fn try_acquire(&self) -> Option<Guard<'_>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| Guard(self))
    }

    /// Waits until the lock is free and takes it.
    pub(crate) async fn acquire(&self) -> Guard<'_> {
        loop {
            // Registered before the attempt so a release in between is not missed.
            let released = self.released.notified();

            if let Some(guard) = self.try_acquire() {
                return guard;
            }

            released.await;
        }
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
