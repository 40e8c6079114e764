//! Defines `Broker`, the pub/sub surface over one shared `RingBuffer`.
//!
//! Publishers write `Signal::Payload`s into the ring. Every subscription is a
//! ring follower running on its own task, pushing payloads into the
//! subscriber's queue or callback. Unsubscribe and shutdown are signals
//! written through the same ring, so they are ordered exactly like payloads:
//! a follower sees everything published before its stop signal, then stops.
//!
//! Lifecycle: `Open -> Closing -> Closed`. The flip to `Closing` happens under
//! the lifecycle write lock, and every registration (subscription or queue
//! forwarder) happens under its read lock. A registration either lands before
//! the flip, and is then drained by `close`, or is rejected with
//! [`BrokerError::Closed`].

use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::ring_buffer::RingBuffer;
use crate::signal::{Signal, SubscriptionIds};
use crate::subscription::{Output, Subscriber, SubscriberSlot, Subscription};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Where a broker is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepting publishes and subscriptions.
    Open,
    /// `close` has begun; forwarders and followers are draining.
    Closing,
    /// Every task has ended. Terminal.
    Closed,
}

pub(crate) struct Shared<T> {
    ring: Arc<RingBuffer<Signal<T>>>,
    ids: SubscriptionIds,
    max_subscribers: usize,
    subscribers: AtomicUsize,
    state: RwLock<State>,
    shutdown: CancellationToken,
    shutdown_sent: AtomicBool,
    forwarders: TaskTracker,
    followers: TaskTracker,
    drained: OnceCell<()>,
}

impl<T> Shared<T> {
    fn reserve_subscriber(&self) -> Result<()> {
        let max = self.max_subscribers;
        self.subscribers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| BrokerError::MaxSubscribersReached { max })
    }

    pub(crate) fn release_subscriber(&self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_open(&self) -> bool {
        *self.state.read() == State::Open
    }
}

/// Broadcast pub/sub broker with backpressure instead of drops.
///
/// Cloning a `Broker` is cheap and yields another handle to the same ring
/// and subscriber set. Subscriptions and queue forwarders run as tokio
/// tasks, so they must be created from within a tokio runtime.
///
/// Call [`close`](Self::close) to stop every task the broker started;
/// dropping the handles alone leaves followers waiting for more values.
pub struct Broker<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Broker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("capacity", &self.shared.ring.capacity())
            .field("max_subscribers", &self.shared.max_subscribers)
            .field("subscribers", &self.shared.subscribers.load(Ordering::Relaxed))
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

impl<T> Broker<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a broker whose ring holds at least `min_buffer_size` values.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Configuration`] if `min_buffer_size <= 1` or
    /// `max_subscribers < 1`.
    pub fn new(min_buffer_size: usize, max_subscribers: usize) -> Result<Self> {
        Self::with_config(Config::new(min_buffer_size, max_subscribers))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;

        let ring = RingBuffer::new(config.min_buffer_size, config.max_subscribers);
        debug!(
            capacity = ring.capacity(),
            max_subscribers = config.max_subscribers,
            "broker created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                ring: Arc::new(ring),
                ids: SubscriptionIds::default(),
                max_subscribers: config.max_subscribers,
                subscribers: AtomicUsize::new(0),
                state: RwLock::new(State::Open),
                shutdown: CancellationToken::new(),
                shutdown_sent: AtomicBool::new(false),
                forwarders: TaskTracker::new(),
                followers: TaskTracker::new(),
                drained: OnceCell::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    pub fn max_subscribers(&self) -> usize {
        self.shared.max_subscribers
    }

    /// Live subscriptions, counting those still draining towards their stop signal.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        *self.shared.state.read()
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.state() != State::Open
    }

    /// Publishes one value to every live subscriber.
    ///
    /// Waits while the slowest subscriber still owes the slot about to be reused.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Closed`] once `close` has begun.
    pub async fn publish(&self, value: T) -> Result<()> {
        self.publish_signal(Signal::Payload(value)).await
    }

    /// Publishes every value in order; no other publish interleaves with the batch.
    pub async fn publish_batch<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send,
    {
        let shared = &self.shared;
        let values = values.into_iter().map(Signal::Payload);
        let written = shared
            .ring
            .write_batch_if(|| shared.is_open(), values)
            .await;
        written.then_some(()).ok_or(BrokerError::Closed)
    }

    /// Writes `signal` unless shutdown has begun.
    ///
    /// The state is checked while holding the ring's write fence, which the
    /// shutdown signal also goes through: an accepted signal is always ahead
    /// of it.
    pub(crate) async fn publish_signal(&self, signal: Signal<T>) -> Result<()> {
        let shared = &self.shared;
        let written = shared.ring.write_if(|| shared.is_open(), signal).await;
        written.then_some(()).ok_or(BrokerError::Closed)
    }

    /// Spawns a task publishing everything received on `input`.
    ///
    /// The task ends when every sender of `input` is dropped, or when the
    /// broker closes. On close, `input` is closed to new sends and whatever it
    /// already buffers is still published before the task ends; `close` waits
    /// for that before stopping subscribers, so those values reach them.
    pub fn publish_from_queue(&self, mut input: mpsc::Receiver<T>) -> Result<Completion> {
        let state = self.shared.state.read();
        if *state != State::Open {
            return Err(BrokerError::Closed);
        }

        let ring = Arc::clone(&self.shared.ring);
        let shutdown = self.shared.shutdown.clone();
        let done = CancellationToken::new();
        let completion = Completion { done: done.clone() };

        self.shared.forwarders.spawn(async move {
            let _done = done.drop_guard();
            debug!("queue forwarder started");

            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {
                        input.close();
                        while let Some(value) = input.recv().await {
                            ring.write(Signal::Payload(value)).await;
                        }
                        break;
                    }
                    received = input.recv() => match received {
                        Some(value) => ring.write(Signal::Payload(value)).await,
                        None => break,
                    },
                }
            }

            debug!("queue forwarder finished");
        });
        drop(state);

        Ok(completion)
    }

    /// Subscribes `output` to every value published from now on.
    ///
    /// When the subscription ends (unsubscribe, close, or `output`'s receiver
    /// being dropped) the sender is dropped, so the receiver sees `None`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::MaxSubscribersReached`] when every slot is taken,
    /// [`BrokerError::Closed`] once `close` has begun.
    pub fn subscribe(&self, output: mpsc::Sender<T>) -> Result<Subscription<T>> {
        self.register(Output::Queue(output), false)
            .map(|(_, subscription)| subscription)
    }

    /// Like [`subscribe`](Self::subscribe), calling `callback` on the follower task for each value.
    pub fn subscribe_func<F>(&self, callback: F) -> Result<Subscription<T>>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.register(Output::Callback(Box::new(callback)), false)
            .map(|(_, subscription)| subscription)
    }

    /// Subscribes `output` and returns the values already buffered.
    ///
    /// The snapshot ends exactly where delivery to `output` begins.
    pub fn subscribe_with_snapshot(
        &self,
        output: mpsc::Sender<T>,
    ) -> Result<(Vec<T>, Subscription<T>)> {
        self.register(Output::Queue(output), true)
    }

    /// Payloads currently held in the ring, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.shared
            .ring
            .snapshot()
            .into_iter()
            .filter_map(Signal::into_payload)
            .collect()
    }

    fn register(
        &self,
        output: Output<T>,
        with_snapshot: bool,
    ) -> Result<(Vec<T>, Subscription<T>)> {
        let shared = &self.shared;
        let state = shared.state.read();
        if *state != State::Open {
            return Err(BrokerError::Closed);
        }
        shared.reserve_subscriber()?;

        let id = shared.ids.next_id();
        let finished = CancellationToken::new();
        let subscriber = Subscriber::new(
            id,
            output,
            SubscriberSlot::new(Arc::clone(shared), id, finished.clone()),
        );

        let (snapshot, reader) = if with_snapshot {
            let (signals, reader) = shared.ring.snapshot_then_reader(subscriber);
            let payloads = signals
                .into_iter()
                .filter_map(Signal::into_payload)
                .collect();
            (payloads, reader)
        } else {
            (Vec::new(), shared.ring.reader(subscriber))
        };

        shared.followers.spawn(async move {
            reader.run().await;
        });
        drop(state);

        debug!(subscription = %id, "subscription started");
        Ok((snapshot, Subscription::new(id, self.clone(), finished)))
    }

    /// Shuts the broker down and waits until it is fully drained.
    ///
    /// Queue forwarders publish what they already hold, then the shutdown
    /// signal is written behind every value published so far. Each follower
    /// delivers everything ahead of it and stops. Concurrent and repeated
    /// calls share one shutdown and all return once it has finished.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared
            .drained
            .get_or_init(|| async {
                let began = {
                    let mut state = shared.state.write();
                    let began = *state == State::Open;
                    if began {
                        *state = State::Closing;
                    }
                    began
                };
                if began {
                    debug!("broker closing");
                }

                shared.shutdown.cancel();
                shared.forwarders.close();
                shared.forwarders.wait().await;

                if !shared.shutdown_sent.load(Ordering::Acquire) {
                    shared.ring.write(Signal::Shutdown).await;
                    shared.shutdown_sent.store(true, Ordering::Release);
                }

                shared.followers.close();
                shared.followers.wait().await;

                *shared.state.write() = State::Closed;
                debug!("broker closed");
            })
            .await;
    }
}

/// Resolves once a queue forwarder started by
/// [`Broker::publish_from_queue`] has ended.
#[derive(Debug, Clone)]
pub struct Completion {
    done: CancellationToken,
}

impl Completion {
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl<T> Shared<T> {
    #[cfg(test)]
    pub(crate) fn readers(&self) -> usize {
        self.ring.readers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::{Duration, timeout};

    async fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut got = Vec::new();
        while let Some(value) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("subscription should end")
        {
            got.push(value);
        }
        got
    }

    #[test]
    fn test_new_validates_arguments() {
        assert!(matches!(
            Broker::<u32>::new(1, 1),
            Err(BrokerError::Configuration { .. })
        ));
        assert!(matches!(
            Broker::<u32>::new(0, 1),
            Err(BrokerError::Configuration { .. })
        ));
        assert!(matches!(
            Broker::<u32>::new(4, 0),
            Err(BrokerError::Configuration { .. })
        ));
        assert!(matches!(
            Broker::<u32>::new(4, usize::MAX),
            Err(BrokerError::Configuration { .. })
        ));

        assert_eq!(Broker::<u32>::new(3, 1).unwrap().capacity(), 4);
        assert_eq!(Broker::<u32>::new(9, 1).unwrap().capacity(), 16);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let broker = Broker::new(2, 1).unwrap();
        for i in 0..16 {
            broker.publish(i).await.unwrap();
        }
        assert_eq!(broker.snapshot(), vec![15]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_subscriber_gets_everything_in_order() {
        let broker = Broker::new(4, 3).unwrap();

        let mut collectors = Vec::new();
        for _ in 0..3 {
            let (tx, mut rx) = mpsc::channel(2);
            broker.subscribe(tx).unwrap();
            collectors.push(tokio::spawn(async move { drain(&mut rx).await }));
        }
        assert_eq!(broker.subscriber_count(), 3);

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    broker.publish(i).await.unwrap();
                }
                broker.close().await;
            })
        };

        for collector in collectors {
            assert_eq!(collector.await.unwrap(), (0..100).collect::<Vec<_>>());
        }
        publisher.await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.state(), State::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_func_delivers_until_unsubscribed() {
        let broker = Broker::new(8, 1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subscription = {
            let seen = Arc::clone(&seen);
            broker
                .subscribe_func(move |value| seen.lock().push(value))
                .unwrap()
        };

        broker.publish_batch(["a", "b", "c"]).await.unwrap();
        subscription.unsubscribe().await.unwrap();
        broker.publish("d").await.unwrap();

        timeout(Duration::from_secs(5), subscription.finished())
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_subscribers() {
        let broker = Broker::<u32>::new(4, 1).unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let first = broker.subscribe(tx).unwrap();

        let (tx, _rx2) = mpsc::channel(1);
        assert_eq!(
            broker.subscribe(tx).unwrap_err(),
            BrokerError::MaxSubscribersReached { max: 1 }
        );
        assert!(matches!(
            broker.subscribe_func(|_| {}),
            Err(BrokerError::MaxSubscribersReached { max: 1 })
        ));

        first.unsubscribe().await.unwrap();
        timeout(Duration::from_secs(5), first.finished())
            .await
            .unwrap();

        let (tx, _rx3) = mpsc::channel(1);
        assert!(broker.subscribe(tx).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_receiver_frees_the_slot() {
        let broker = Broker::new(4, 1).unwrap();

        let (tx, rx) = mpsc::channel(1);
        let subscription = broker.subscribe(tx).unwrap();
        drop(rx);

        // The follower notices on its next delivery
        broker.publish(1).await.unwrap();
        timeout(Duration::from_secs(5), subscription.finished())
            .await
            .unwrap();
        assert!(subscription.is_finished());
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.shared.readers(), 0);

        // Nothing left to stop, so unsubscribing is a no-op
        subscription.unsubscribe().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe_only_stops_its_own_subscription() {
        let broker = Broker::new(8, 2).unwrap();

        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = broker.subscribe(tx_a).unwrap();
        let _b = broker.subscribe(tx_b).unwrap();

        broker.publish_batch(1..=3).await.unwrap();
        a.unsubscribe().await.unwrap();
        broker.publish_batch(4..=5).await.unwrap();

        assert_eq!(drain(&mut rx_a).await, vec![1, 2, 3]);

        broker.close().await;
        assert_eq!(drain(&mut rx_b).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_rejects_further_calls() {
        let broker = Broker::<u32>::new(4, 2).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let subscription = broker.subscribe(tx).unwrap();

        broker.close().await;
        assert!(broker.is_closed());
        assert_eq!(drain(&mut rx).await, Vec::<u32>::new());

        assert_eq!(broker.publish(1).await, Err(BrokerError::Closed));
        assert_eq!(broker.publish_batch([1, 2]).await, Err(BrokerError::Closed));
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(broker.subscribe(tx).unwrap_err(), BrokerError::Closed);
        let (_tx, input) = mpsc::channel(1);
        assert!(matches!(
            broker.publish_from_queue(input),
            Err(BrokerError::Closed)
        ));

        assert!(subscription.is_finished());
        subscription.unsubscribe().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_runs_once() {
        let broker = Broker::new(4, 2).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        broker.subscribe(tx).unwrap();
        broker.publish_batch(0..3).await.unwrap();

        let closers = (0..4)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    broker.close().await;
                    broker.state()
                })
            })
            .collect::<Vec<_>>();

        for closer in closers {
            assert_eq!(closer.await.unwrap(), State::Closed);
        }

        assert_eq!(drain(&mut rx).await, vec![0, 1, 2]);
        // Exactly one shutdown signal went through the ring
        let shutdowns = broker
            .shared
            .ring
            .snapshot()
            .into_iter()
            .filter(|signal| *signal == Signal::Shutdown)
            .count();
        assert_eq!(shutdowns, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_from_queue_forwards_and_completes() {
        let broker = Broker::new(4, 1).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        broker.subscribe(tx).unwrap();

        let (input_tx, input_rx) = mpsc::channel(16);
        let completion = broker.publish_from_queue(input_rx).unwrap();

        for i in 0..10 {
            input_tx.send(i).await.unwrap();
        }
        let mut got = Vec::new();
        while got.len() < 10 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(got, (0..10).collect::<Vec<_>>());

        // Dropping every sender ends the forwarder
        drop(input_tx);
        timeout(Duration::from_secs(5), completion.wait())
            .await
            .unwrap();
        assert!(completion.is_complete());
        broker.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_drains_queued_input_before_stopping_subscribers() {
        let broker = Broker::new(16, 1).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        broker.subscribe(tx).unwrap();

        let (input_tx, input_rx) = mpsc::channel(8);
        let completion = broker.publish_from_queue(input_rx).unwrap();
        for i in 0..5 {
            input_tx.send(i).await.unwrap();
        }

        // `input_tx` is still alive: close must not wait for it to be dropped.
        timeout(Duration::from_secs(5), broker.close())
            .await
            .expect("close should finish while the sender is still held");
        assert!(completion.is_complete());
        assert_eq!(drain(&mut rx).await, (0..5).collect::<Vec<_>>());
        assert!(input_tx.send(99).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_with_snapshot_continues_after_snapshot() {
        let broker = Broker::new(4, 2).unwrap();
        broker.publish_batch(["a", "b"]).await.unwrap();

        // An unsubscribed follower leaves its signal in the ring; it must not leak into snapshots
        let other = broker.subscribe_func(|_| {}).unwrap();
        other.unsubscribe().await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let (snapshot, _subscription) = broker.subscribe_with_snapshot(tx).unwrap();
        assert_eq!(snapshot, vec!["a", "b"]);

        broker.publish("c").await.unwrap();
        broker.close().await;
        assert_eq!(drain(&mut rx).await, vec!["c"]);
    }
}
