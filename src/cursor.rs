//! Reader positions into the ring and the fixed pool they are claimed from.
//!
//! A `Cursor` is a cache-padded atomic index in `[0, capacity)`, or
//! [`UNALLOCATED`] while its pool slot is free. Only the task holding a
//! [`CursorHandle`] moves the position; the writer just reads it to decide
//! whether the next slot can be overwritten, and parks on
//! [`CursorPool::moved`] when it cannot.

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Position value of a pool slot that nobody holds.
pub(crate) const UNALLOCATED: usize = usize::MAX;

/// Position value of a claimed slot not yet placed on the ring. Never a valid index.
pub(crate) const RESERVED: usize = usize::MAX - 1;

#[derive(Debug)]
pub(crate) struct Cursor {
    value: CachePadded<AtomicUsize>,
    mask: usize,
}

impl Cursor {
    pub(crate) fn new(position: usize, mask: usize) -> Self {
        Self {
            value: CachePadded::new(AtomicUsize::new(position)),
            mask,
        }
    }

    pub(crate) fn unallocated(mask: usize) -> Self {
        Self::new(UNALLOCATED, mask)
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        self.position() != UNALLOCATED
    }

    /// The index this cursor would move to next, without moving it.
    #[inline]
    pub(crate) fn peek_next(&self) -> usize {
        self.position().wrapping_add(1) & self.mask
    }

    /// Moves forward one slot, wrapping at the ring capacity, and returns the new position.
    #[inline]
    pub(crate) fn advance(&self) -> usize {
        let mask = self.mask;
        let previous = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pos| {
                Some(pos.wrapping_add(1) & mask)
            })
            .unwrap_or_else(|pos| pos);
        previous.wrapping_add(1) & mask
    }

    #[inline]
    fn try_claim(&self, position: usize) -> bool {
        self.value
            .compare_exchange(UNALLOCATED, position, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.value.store(UNALLOCATED, Ordering::Release);
    }
}

/// Fixed array of cursor slots shared by every reader of one ring.
#[derive(Debug)]
pub(crate) struct CursorPool {
    slots: Box<[Cursor]>,
    moved: Notify,
}

impl CursorPool {
    pub(crate) fn new(size: usize, mask: usize) -> Self {
        let slots = (0..size)
            .map(|_| Cursor::unallocated(mask))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            moved: Notify::new(),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    /// Makes one pass over the pool, claiming the first free slot.
    ///
    /// The claimed cursor sits at [`RESERVED`], which blocks no write, until
    /// [`CursorHandle::place`] puts it on the ring.
    pub(crate) fn try_reserve(self: &Arc<Self>) -> Option<CursorHandle> {
        self.slots
            .iter()
            .position(|slot| slot.try_claim(RESERVED))
            .map(|index| CursorHandle {
                pool: Arc::clone(self),
                index,
            })
    }

    /// Claims a slot, rescanning with backoff until one frees up.
    ///
    /// Must not be called with the ring locked: the slot being waited for is
    /// freed by a reader that needs that lock to make progress. There is no
    /// fairness between concurrent callers; whoever wins the compare-and-swap
    /// on a freed slot gets it.
    pub(crate) fn reserve(self: &Arc<Self>) -> CursorHandle {
        let backoff = Backoff::new();
        loop {
            if let Some(handle) = self.try_reserve() {
                return handle;
            }
            backoff.snooze();
        }
    }

    /// Whether any live cursor currently sits at `position`.
    #[inline]
    pub(crate) fn occupied(&self, position: usize) -> bool {
        self.slots.iter().any(|slot| slot.position() == position)
    }

    pub(crate) fn allocated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_allocated()).count()
    }

    /// Resolves after some held cursor advances or is released.
    ///
    /// Wakes one waiter per movement; the ring has at most one writer parked here.
    pub(crate) fn moved(&self) -> Notified<'_> {
        self.moved.notified()
    }
}

/// Exclusive claim on one pool slot. Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct CursorHandle {
    pool: Arc<CursorPool>,
    index: usize,
}

impl CursorHandle {
    #[inline]
    fn cursor(&self) -> &Cursor {
        &self.pool.slots[self.index]
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.cursor().position()
    }

    /// Puts a reserved cursor at `position`. Callers hold the ring lock so `W` cannot move meanwhile.
    #[inline]
    pub(crate) fn place(&self, position: usize) {
        debug_assert_eq!(self.position(), RESERVED);
        debug_assert!(position < RESERVED);
        self.cursor().value.store(position, Ordering::Release);
    }

    #[inline]
    pub(crate) fn advance(&self) -> usize {
        let position = self.cursor().advance();
        self.pool.moved.notify_one();
        position
    }
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        self.cursor().release();
        self.pool.moved.notify_one();
    }
}
