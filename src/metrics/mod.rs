//! Built-in metrics for watcher operations.
//!
//! Provides OpenTelemetry metrics tracking:
//! - Publish attempts/success/failures and round-trip duration
//! - Delivered and ignored watch events
//! - Callback panics
//! - Watch stream resubscribes
//!
//! # Examples
//!
//! ```rust,no_run
//! use casbin_etcd_watcher::prelude::*;
//! use casbin_etcd_watcher::store::MemoryStore;
//! use opentelemetry::global;
//!
//! # fn example() -> Result<()> {
//! let watcher = Watcher::builder()
//!     .with_metrics(global::meter("my-app"))
//!     .build(MemoryStore::new())?;
//! # Ok(())
//! # }
//! ```

mod watcher_metrics;

pub use watcher_metrics::WatcherMetrics;

use crate::error::WatcherError;

/// Short metric label for a publish failure.
pub(crate) fn failure_reason(err: &WatcherError) -> &'static str {
    match err {
        WatcherError::StoreUnavailable(_) => "store_unavailable",
        WatcherError::Timeout(_) => "timeout",
        WatcherError::SignalNotInitialized { .. } => "not_initialized",
        WatcherError::Closed => "closed",
        _ => "other",
    }
}
