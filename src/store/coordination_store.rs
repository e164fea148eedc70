//! Coordination store trait and the event types it produces.

use crate::error::{Result, WatcherError};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// A value read from the coordination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key that was read
    pub key: String,
    /// The stored value
    pub value: String,
    /// Revision of the last write to this key
    pub mod_revision: i64,
    /// Store-wide revision at the time of the read
    pub header_revision: i64,
}

/// Kind of a watch event as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    /// The key was written
    Put,
    /// The key was deleted
    Delete,
    /// Anything else the store emits on the stream (progress notifications, etc.)
    Other(String),
}

/// A raw event received on a store subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// What happened
    pub kind: StoreEventKind,
    /// The key the event applies to
    pub key: String,
    /// The value after a put, empty otherwise
    pub value: String,
    /// Store revision at which the event was committed
    pub revision: i64,
}

impl StoreEvent {
    /// Create a put event.
    pub fn put(key: impl Into<String>, value: impl Into<String>, revision: i64) -> Self {
        Self {
            kind: StoreEventKind::Put,
            key: key.into(),
            value: value.into(),
            revision,
        }
    }

    /// Create a delete event.
    pub fn delete(key: impl Into<String>, revision: i64) -> Self {
        Self {
            kind: StoreEventKind::Delete,
            key: key.into(),
            value: String::new(),
            revision,
        }
    }

    /// Create an event of a kind the watcher does not forward.
    pub fn other(key: impl Into<String>, label: impl Into<String>, revision: i64) -> Self {
        Self {
            kind: StoreEventKind::Other(label.into()),
            key: key.into(),
            value: String::new(),
            revision,
        }
    }
}

/// Releases a store subscription.
///
/// Cancelling is idempotent. Dropping the handle cancels the subscription too.
pub struct CancelHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    /// Wrap the function that tears down a subscription.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the subscription. Calls after the first one do nothing.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether `cancel` has already run.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A live subscription to one key: an ordered event stream plus its cancel handle.
///
/// Events arrive in commit order. After cancellation the stream yields `None`
/// once buffered events are drained.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    events: mpsc::UnboundedReceiver<Result<StoreEvent>>,
    cancel: CancelHandle,
}

impl Subscription {
    /// Assemble a subscription from its parts.
    pub fn new(
        key: impl Into<String>,
        events: mpsc::UnboundedReceiver<Result<StoreEvent>>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            key: key.into(),
            events,
            cancel,
        }
    }

    /// The key this subscription watches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next event. `None` means the stream has ended.
    pub async fn next(&mut self) -> Option<Result<StoreEvent>> {
        self.events.recv().await
    }

    /// Release the subscription.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Client of a distributed key-value store with get/put/watch semantics.
///
/// Implementations must be safe to share between the publishing side and the
/// watch task; the watcher adds no serialization around them.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read the value at `key`, or `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Write `value` at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is not accepted.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Subscribe to changes of exactly `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be set up.
    async fn watch(&self, key: &str) -> Result<Subscription>;

    /// Release the client connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be shut down cleanly.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this store (for logging/debugging).
    fn name(&self) -> String;
}

/// Run a store round trip, failing with [`WatcherError::Timeout`] if it takes longer than `timeout`.
pub(crate) async fn bounded<T, F>(timeout: Duration, request: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| WatcherError::Timeout(timeout))?
}
