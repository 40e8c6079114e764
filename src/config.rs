use crate::error::{BrokerError, Result};

/// Sizing for a [`Broker`](crate::Broker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Lower bound for the ring capacity; rounded up to a power of two.
    pub min_buffer_size: usize,
    /// How many subscriptions may be live at once.
    pub max_subscribers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_buffer_size: 1024,
            max_subscribers: 16,
        }
    }
}

impl Config {
    pub fn new(min_buffer_size: usize, max_subscribers: usize) -> Self {
        Self {
            min_buffer_size,
            max_subscribers,
        }
    }

    pub fn with_min_buffer_size(mut self, min_buffer_size: usize) -> Self {
        self.min_buffer_size = min_buffer_size;
        self
    }

    pub fn with_max_subscribers(mut self, max_subscribers: usize) -> Self {
        self.max_subscribers = max_subscribers;
        self
    }

    /// The ring capacity this configuration yields.
    pub fn capacity(&self) -> Option<usize> {
        self.min_buffer_size.checked_next_power_of_two()
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_buffer_size <= 1 {
            return Err(BrokerError::configuration(
                "min_buffer_size must be greater than 1",
            ));
        }
        if self.capacity().is_none() {
            return Err(BrokerError::configuration(
                "min_buffer_size is too large to round up to a power of two",
            ));
        }
        if self.max_subscribers < 1 {
            return Err(BrokerError::configuration(
                "max_subscribers must be at least 1",
            ));
        }
        // The ring keeps one cursor beyond the subscriber limit for snapshots.
        if self.max_subscribers.checked_add(1).is_none() {
            return Err(BrokerError::configuration("max_subscribers is too large"));
        }
        Ok(())
    }
}
