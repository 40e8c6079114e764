//! Subscriber-side types: the follower sink that turns ring signals into
//! deliveries, and the `Subscription` handle given back to the caller.
//!
//! A follower's resources are owned by its sink. When the follower task
//! stops, for whatever reason, dropping the sink closes the output queue,
//! frees the subscriber slot and marks the subscription finished, in that
//! order.

use crate::broker::{Broker, Shared};
use crate::error::Result;
use crate::signal::{Signal, SubscriptionId};
use crate::sink::Sink;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) enum Output<T> {
    Queue(mpsc::Sender<T>),
    Callback(Box<dyn FnMut(T) + Send>),
}

impl<T: Send + 'static> Output<T> {
    async fn push(&mut self, value: T) -> ControlFlow<()> {
        match self {
            Output::Queue(queue) => queue.deliver(value).await,
            Output::Callback(callback) => {
                callback(value);
                ControlFlow::Continue(())
            }
        }
    }
}

/// Holds one unit of the broker's subscriber count until dropped.
pub(crate) struct SubscriberSlot<T> {
    shared: Arc<Shared<T>>,
    id: SubscriptionId,
    finished: CancellationToken,
}

impl<T> SubscriberSlot<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, id: SubscriptionId, finished: CancellationToken) -> Self {
        Self {
            shared,
            id,
            finished,
        }
    }
}

impl<T> Drop for SubscriberSlot<T> {
    fn drop(&mut self) {
        self.shared.release_subscriber();
        self.finished.cancel();
        debug!(subscription = %self.id, "subscription ended");
    }
}

pub(crate) struct Subscriber<T> {
    id: SubscriptionId,
    // Declared before `_slot`: the queue closes before the slot is handed back.
    output: Output<T>,
    _slot: SubscriberSlot<T>,
}

impl<T> Subscriber<T> {
    pub(crate) fn new(id: SubscriptionId, output: Output<T>, slot: SubscriberSlot<T>) -> Self {
        Self {
            id,
            output,
            _slot: slot,
        }
    }
}

impl<T> Sink<Signal<T>> for Subscriber<T>
where
    T: Send + Sync + 'static,
{
    fn deliver(&mut self, signal: Signal<T>) -> impl Future<Output = ControlFlow<()>> + Send {
        async move {
            if signal.stops(self.id) {
                trace!(subscription = %self.id, "stop signal reached follower");
                return ControlFlow::Break(());
            }

            match signal.into_payload() {
                Some(value) => {
                    let flow = self.output.push(value).await;
                    if flow.is_break() {
                        debug!(subscription = %self.id, "output queue dropped, stopping");
                    }
                    flow
                }
                // Another subscription's unsubscribe
                None => ControlFlow::Continue(()),
            }
        }
    }
}

/// Handle to a live subscription, returned by [`Broker::subscribe`] and
/// [`Broker::subscribe_func`].
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription<T> {
    id: SubscriptionId,
    broker: Broker<T>,
    finished: CancellationToken,
    requested: AtomicBool,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("finished", &self.finished.is_cancelled())
            .finish()
    }
}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: SubscriptionId, broker: Broker<T>, finished: CancellationToken) -> Self {
        Self {
            id,
            broker,
            finished,
            requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Publishes this subscription's stop signal.
    ///
    /// Everything published before this call is still delivered; the
    /// follower stops when it reaches the signal. Returns once the signal is
    /// in the ring, which may be before the follower has caught up; await
    /// [`finished`](Self::finished) for that. Repeated calls, or calls after
    /// the subscription already ended, do nothing.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Closed`](crate::BrokerError::Closed) if the broker is
    /// shutting down; the follower then stops on the shutdown signal instead.
    pub async fn unsubscribe(&self) -> Result<()> {
        if self.finished.is_cancelled() || self.requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sent = self
            .broker
            .publish_signal(Signal::Unsubscribe(self.id))
            .await;
        if sent.is_err() {
            self.requested.store(false, Ordering::Release);
        } else {
            debug!(subscription = %self.id, "unsubscribe requested");
        }
        sent
    }

    /// Waits until the follower has stopped and its slot is free again.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}
