use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one subscription for the lifetime of its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionIds {
    next: CachePadded<AtomicU64>,
}

impl SubscriptionIds {
    pub(crate) fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a broker stores in each ring slot.
///
/// Control messages travel through the same ordered stream as payloads, so
/// everything published before an unsubscribe or shutdown reaches followers
/// first. They are separate variants rather than reserved payload values, so
/// no `T` can ever be mistaken for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    Payload(T),
    Unsubscribe(SubscriptionId),
    Shutdown,
}

impl<T> Signal<T> {
    pub fn into_payload(self) -> Option<T> {
        match self {
            Signal::Payload(value) => Some(value),
            Signal::Unsubscribe(_) | Signal::Shutdown => None,
        }
    }

    /// Whether a follower owned by `id` must stop on this signal.
    pub fn stops(&self, id: SubscriptionId) -> bool {
        match self {
            Signal::Payload(_) => false,
            Signal::Unsubscribe(target) => *target == id,
            Signal::Shutdown => true,
        }
    }
}
