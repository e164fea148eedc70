//! Watcher facade, builder, and configuration.

mod builder;
mod config;
mod watcher;

pub use builder::WatcherBuilder;
pub use self::config::{DEFAULT_KEY, Endpoint, RetryPolicy, WatcherConfig};
pub use watcher::{Watcher, WatcherState};
