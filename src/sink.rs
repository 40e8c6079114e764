//! The receiving side of a ring follower.

use std::future::{self, Future};
use std::ops::ControlFlow;
use tokio::sync::mpsc;

/// Where a follower delivers each item it reads.
///
/// Returning `ControlFlow::Break` stops the follower: its cursor is released
/// and the item that caused the stop is not counted as consumed.
pub trait Sink<E>: Send + 'static {
    fn deliver(&mut self, item: E) -> impl Future<Output = ControlFlow<()>> + Send;
}

/// Any synchronous closure can act as a sink.
impl<E, F> Sink<E> for F
where
    F: FnMut(E) -> ControlFlow<()> + Send + 'static,
{
    fn deliver(&mut self, item: E) -> impl Future<Output = ControlFlow<()>> + Send {
        future::ready(self(item))
    }
}

/// Forwards into a bounded queue, waiting for room. Stops once the receiver is gone.
impl<E: Send + 'static> Sink<E> for mpsc::Sender<E> {
    fn deliver(&mut self, item: E) -> impl Future<Output = ControlFlow<()>> + Send {
        async move {
            match self.send(item).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        }
    }
}
