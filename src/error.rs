//! Error types for casbin-etcd-watcher.

use std::time::Duration;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while publishing or watching the change signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    /// The coordination store could not be reached or rejected the request.
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store round trip did not complete within the configured timeout.
    #[error("Store request timed out after {0:?}")]
    Timeout(Duration),

    /// The revision strategy found no value at the signal key.
    #[error("Signal key '{key}' has never been initialized")]
    SignalNotInitialized {
        /// The signal key that was read
        key: String,
    },

    /// The watch stream ended because of a failure.
    #[error("Subscription terminated: {0}")]
    SubscriptionTerminated(String),

    /// The watcher has been closed.
    #[error("Watcher is closed")]
    Closed,

    /// An endpoint string could not be parsed as `host:port`.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Failed to load or validate watcher configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error for other cases.
    #[error("Watcher error: {0}")]
    Other(String),
}

impl WatcherError {
    /// Whether this error reports an un-bootstrapped signal key rather than a connectivity problem.
    ///
    /// Callers can use this to decide whether to write an initial value themselves.
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::SignalNotInitialized { .. })
    }

    /// Whether the error is transient and the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Timeout(_) | Self::SubscriptionTerminated(_)
        )
    }
}

impl From<config::ConfigError> for WatcherError {
    fn from(err: config::ConfigError) -> Self {
        WatcherError::Config(err.to_string())
    }
}
