//! Defines `RingBuffer`, the backpressured broadcast store under every broker.
//!
//! The ring is a fixed, power-of-two array of slots with a single write
//! position `W` and any number of reader cursors drawn from a `CursorPool`.
//! Every reader sees every value written after its cursor was placed, in
//! order, exactly once: the writer refuses to advance onto a slot that a live
//! cursor has yet to consume and waits for that reader instead.
//!
//! Synchronization follows two rules:
//!
//! 1.  **Short locks.** Slots and `W` live behind a `parking_lot::RwLock`.
//!     Writers take it exclusively, readers and snapshots take it shared, and
//!     nobody holds it across an `.await`. Values leave the ring as clones.
//! 2.  **Async waits.** A writer blocked by a lagging reader parks on the
//!     cursor pool's `moved` signal; a reader that has caught up parks on
//!     `readable`. Every write wakes all readers. Every cursor advance or
//!     release wakes the waiting writer, whether the reader stopped cleanly,
//!     was dropped unrun or panicked. Writers are serialized across their
//!     waits by a `Fence`, so at most one of them is ever parked.

use crate::cursor::{Cursor, CursorHandle, CursorPool};
use crate::fence::Fence;
use crate::sink::Sink;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug)]
struct Slots<E> {
    data: Box<[Option<E>]>,
    write: Cursor,
}

impl<E> Slots<E> {
    #[inline]
    fn mask(&self) -> usize {
        self.data.len() - 1
    }

    /// Stores at `W`, retires the slot after it and moves `W` forward.
    ///
    /// The retired slot is the oldest value, which no reader can still need
    /// once the caller has checked that no cursor sits on it.
    fn push(&mut self, value: E) {
        let write = self.write.position();
        let retired = self.write.peek_next();
        self.data[write] = Some(value);
        self.data[retired] = None;
        self.write.advance();
    }

    /// All stored values, oldest first, starting the scan at `W`.
    fn chronological(&self) -> Vec<E>
    where
        E: Clone,
    {
        let start = self.write.position();
        let mask = self.mask();
        (0..self.data.len())
            .filter_map(|offset| self.data[(start + offset) & mask].clone())
            .collect()
    }
}

/// Fixed-capacity broadcast ring with one writer at a time and many readers.
#[derive(Debug)]
pub struct RingBuffer<E> {
    slots: RwLock<Slots<E>>,
    cursors: Arc<CursorPool>,
    fence: Fence,
    readable: Notify,
}

impl<E> RingBuffer<E> {
    /// Creates a ring holding at least `min_capacity` slots for up to `max_readers` followers.
    ///
    /// The capacity is rounded up to the next power of two. One cursor beyond
    /// `max_readers` is kept in reserve so snapshots never wait behind followers.
    ///
    /// # Panics
    ///
    /// Panics if `min_capacity` is less than 2, if it has no representable
    /// power of two, or if `max_readers` is 0.
    pub fn new(min_capacity: usize, max_readers: usize) -> Self {
        assert!(min_capacity >= 2, "capacity must be at least 2");
        assert!(max_readers >= 1, "at least one reader must be allowed");
        let capacity = min_capacity
            .checked_next_power_of_two()
            .expect("capacity overflows usize");
        let mask = capacity - 1;

        let data = (0..capacity)
            .map(|_| None)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots: RwLock::new(Slots {
                data,
                write: Cursor::new(0, mask),
            }),
            cursors: Arc::new(CursorPool::new(max_readers + 1, mask)),
            fence: Fence::default(),
            readable: Notify::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.read().data.len()
    }

    #[inline]
    pub fn max_readers(&self) -> usize {
        // One pool slot is the snapshot reserve.
        self.cursors.size() - 1
    }

    /// Number of cursors currently placed, snapshots included.
    pub fn readers(&self) -> usize {
        self.cursors.allocated()
    }

    /// Writes one value, waiting while the next slot is still owed to a reader.
    pub async fn write(&self, value: E) {
        let _guard = self.fence.acquire().await;
        self.write_fenced(value).await;
    }

    /// Writes every value in order without letting another writer interleave.
    pub async fn write_batch<I>(&self, values: I)
    where
        I: IntoIterator<Item = E>,
        I::IntoIter: Send,
    {
        let _guard = self.fence.acquire().await;
        for value in values {
            self.write_fenced(value).await;
        }
    }

    /// Writes `value` unless `gate` fails once the fence is held.
    ///
    /// The gate runs after every earlier writer has finished, so a write it
    /// admits lands before any write that a later gate check would refuse.
    /// Returns whether the value was written.
    pub async fn write_if<G>(&self, gate: G, value: E) -> bool
    where
        G: FnOnce() -> bool,
    {
        let _guard = self.fence.acquire().await;
        if !gate() {
            return false;
        }
        self.write_fenced(value).await;
        true
    }

    /// Batch form of [`write_if`](Self::write_if): the gate is checked once for the whole batch.
    pub async fn write_batch_if<G, I>(&self, gate: G, values: I) -> bool
    where
        G: FnOnce() -> bool,
        I: IntoIterator<Item = E>,
        I::IntoIter: Send,
    {
        let _guard = self.fence.acquire().await;
        if !gate() {
            return false;
        }
        for value in values {
            self.write_fenced(value).await;
        }
        true
    }

    /// Caller must hold the fence.
    async fn write_fenced(&self, value: E) {
        loop {
            let moved = self.cursors.moved();

            {
                let mut slots = self.slots.write();
                if !self.cursors.occupied(slots.write.peek_next()) {
                    slots.push(value);
                    drop(slots);
                    self.readable.notify_waiters();
                    return;
                }
            }

            trace!("ring write waiting for a lagging reader");
            moved.await;
        }
    }

    /// Copies everything currently stored, oldest first. Never waits for new values.
    pub fn snapshot(&self) -> Vec<E>
    where
        E: Clone,
    {
        let cursor = self.cursors.reserve();
        let slots = self.slots.read();
        cursor.place(slots.write.position());
        let values = slots.chronological();
        drop(slots);
        drop(cursor);
        values
    }

    /// Places a new cursor at `W` and binds it to `sink` without starting it.
    ///
    /// The cursor is live from the moment this returns, so every value written
    /// afterwards is owed to `sink` even if the reader has not been polled yet.
    ///
    /// If every cursor is taken this waits, without holding the ring, until a
    /// reader stops and frees one.
    pub fn reader<S>(self: &Arc<Self>, sink: S) -> Reader<E, S> {
        let cursor = self.cursors.reserve();
        let slots = self.slots.read();
        cursor.place(slots.write.position());
        drop(slots);

        Reader {
            ring: Arc::clone(self),
            cursor,
            sink,
        }
    }

    /// Like [`reader`](Self::reader), also returning what the ring holds at that instant.
    ///
    /// Both are taken under one shared lock: the snapshot ends exactly where
    /// the reader starts.
    pub fn snapshot_then_reader<S>(self: &Arc<Self>, sink: S) -> (Vec<E>, Reader<E, S>)
    where
        E: Clone,
    {
        let cursor = self.cursors.reserve();
        let slots = self.slots.read();
        cursor.place(slots.write.position());
        let values = slots.chronological();
        drop(slots);

        let reader = Reader {
            ring: Arc::clone(self),
            cursor,
            sink,
        };
        (values, reader)
    }
}

impl<E> RingBuffer<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Spawns a task delivering every value written from now on to `sink`.
    ///
    /// The task ends when `sink` breaks and hands the sink back.
    pub fn follow<S: Sink<E>>(self: &Arc<Self>, sink: S) -> JoinHandle<S> {
        tokio::spawn(self.reader(sink).run())
    }

    /// Returns the current contents and spawns a follower continuing right after them.
    pub fn snapshot_then_follow<S: Sink<E>>(self: &Arc<Self>, sink: S) -> (Vec<E>, JoinHandle<S>) {
        let (values, reader) = self.snapshot_then_reader(sink);
        (values, tokio::spawn(reader.run()))
    }
}

/// A placed cursor paired with its sink, ready to be driven by a task.
///
/// Dropping a `Reader` without running it frees its cursor.
#[derive(Debug)]
pub struct Reader<E, S> {
    ring: Arc<RingBuffer<E>>,
    cursor: CursorHandle,
    sink: S,
}

impl<E, S> Reader<E, S>
where
    E: Clone + Send + Sync + 'static,
    S: Sink<E>,
{
    /// Delivers values until the sink breaks, then releases the cursor and returns the sink.
    pub async fn run(self) -> S {
        let Reader {
            ring,
            cursor,
            mut sink,
        } = self;

        loop {
            let readable = ring.readable.notified();

            let next = {
                let slots = ring.slots.read();
                let position = cursor.position();
                if position == slots.write.position() {
                    None
                } else {
                    debug_assert!(
                        slots.data[position].is_some(),
                        "slot behind the write position must hold a value"
                    );
                    slots.data[position].clone()
                }
            };

            let Some(item) = next else {
                readable.await;
                continue;
            };

            if sink.deliver(item).await.is_break() {
                break;
            }

            cursor.advance();
        }

        drop(cursor);
        sink
    }
}
