//! Change notification delivery.
//!
//! Holds the update callback and runs the background task that turns store
//! watch events into callback invocations.

mod backoff;
pub mod event;
pub mod registry;
pub(crate) mod watch_loop;

pub use event::{WatchEvent, WatchEventKind};
pub use registry::{CallbackRegistry, Delivery, UpdateCallback};
pub use watch_loop::{LoopState, StopReason};
