//! Error types returned by the broker.

/// Everything a broker operation can fail with.
///
/// Only validation can fail: once an operation is accepted it can wait, but
/// it cannot error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker was created with unusable arguments.
    #[error("invalid configuration: {reason}")]
    Configuration {
        /// What was wrong with the arguments
        reason: String,
    },

    /// Shutdown has begun; nothing more is accepted.
    #[error("broker is closed")]
    Closed,

    /// Every subscriber slot is taken. Retry once a subscription has finished.
    #[error("maximum number of subscribers reached ({max})")]
    MaxSubscribersReached {
        /// The configured limit
        max: usize,
    },
}

impl BrokerError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Result alias for broker operations.
pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
