//! Single-slot holder for the update callback.

use super::WatchEvent;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Boxed update callback.
pub type UpdateCallback = Box<dyn Fn(&WatchEvent) + Send + Sync>;

/// Outcome of delivering one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The callback ran to completion
    Delivered,
    /// No callback was registered
    NoCallback,
    /// The callback panicked; the message is the panic payload if it was a string
    Panicked(String),
    /// Delivery was skipped because the watcher is shutting down
    Cancelled,
}

/// Registry holding at most one update callback.
///
/// Replacing the callback and invoking it go through the same lock, so a swap
/// never lands in the middle of a delivery and a delivery never sees a
/// half-replaced slot. The callback must not call back into the registry
/// (e.g. `set`) from inside itself; the lock is not reentrant.
///
/// # Examples
///
/// ```rust
/// use casbin_etcd_watcher::notify::{CallbackRegistry, Delivery, WatchEvent, WatchEventKind};
///
/// let registry = CallbackRegistry::new();
/// registry.set(|event: &WatchEvent| {
///     println!("Policy changed at revision {}", event.revision);
/// });
///
/// let event = WatchEvent {
///     kind: WatchEventKind::Put,
///     key: "/casbin".to_string(),
///     value: "1".to_string(),
///     revision: 1,
/// };
/// assert_eq!(registry.invoke(&event), Delivery::Delivered);
/// ```
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    slot: Arc<Mutex<Option<UpdateCallback>>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active callback.
    ///
    /// Blocks while a delivery is in progress.
    pub fn set<F>(&self, callback: F)
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        *self.slot.lock() = Some(Box::new(callback));
    }

    /// Remove the active callback.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// Whether a callback is registered.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Deliver `event` to the active callback, if any.
    ///
    /// A panicking callback is contained and reported as [`Delivery::Panicked`].
    pub fn invoke(&self, event: &WatchEvent) -> Delivery {
        self.invoke_unless(event, || false)
    }

    /// Deliver `event` unless `cancelled` reports true once the lock is held.
    pub(crate) fn invoke_unless(&self, event: &WatchEvent, cancelled: impl Fn() -> bool) -> Delivery {
        let slot = self.slot.lock();
        if cancelled() {
            return Delivery::Cancelled;
        }

        let Some(callback) = slot.as_ref() else {
            return Delivery::NoCallback;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(()) => Delivery::Delivered,
            Err(payload) => Delivery::Panicked(panic_message(payload.as_ref())),
        }
    }

    /// Wait until no delivery is in progress.
    pub(crate) fn quiesce(&self) {
        drop(self.slot.lock());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
