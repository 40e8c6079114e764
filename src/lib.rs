//! In-process broadcast pub/sub with backpressure instead of drops.
//!
//! Every subscriber receives every value published after it subscribed, in
//! order, exactly once. A publish waits until the slowest subscriber has
//! consumed the slot about to be reused, so nothing is ever lost.
//!
//! ```rust,ignore
//! let broker = gyre_pubsub::Broker::new(16, 4)?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(8);
//! let subscription = broker.subscribe(tx)?;
//!
//! broker.publish("hello").await?;
//! assert_eq!(rx.recv().await, Some("hello"));
//!
//! subscription.unsubscribe().await?;
//! broker.close().await;
//! ```

mod broker;
mod config;
mod cursor;
mod error;
mod fence;
mod ring_buffer;
mod signal;
mod sink;
mod subscription;

pub use crate::broker::{Broker, Completion, State};
pub use crate::config::Config;
pub use crate::error::{BrokerError, Result};
pub use crate::ring_buffer::{Reader, RingBuffer};
pub use crate::signal::{Signal, SubscriptionId};
pub use crate::sink::Sink;
pub use crate::subscription::Subscription;
