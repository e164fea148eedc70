//! # casbin-etcd-watcher
//!
//! Keeps casbin enforcers running on several hosts in sync through a single
//! key in a coordination store such as etcd.
//!
//! ## Overview
//!
//! Every instance watches one signal key. After a local policy mutation the
//! instance writes a new value to that key; every watcher sees the write and
//! invokes its update callback, which typically reloads the policy from the
//! shared adapter. The key's value carries no policy data.
//!
//! - Two ways of generating signal values: timestamps (default) or
//!   store revisions
//! - A single update callback, swapped and invoked under one lock
//! - A background watch task that survives callback panics and resubscribes
//!   after stream errors
//! - An idempotent `close` that cancels the subscription
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use casbin_etcd_watcher::prelude::*;
//! use casbin_etcd_watcher::store::MemoryCluster;
//!
//! # async fn example() -> Result<()> {
//! let cluster = MemoryCluster::new();
//! let a = Watcher::builder().build(cluster.client())?;
//! let b = Watcher::builder().build(cluster.client())?;
//!
//! b.set_update_callback(|event: &WatchEvent| {
//!     println!("Policy changed ({}), reloading", event.value);
//! });
//! b.start_watching().await?;
//!
//! a.update_for_add_policy("p", "p", &["alice", "data1", "read"]).await;
//!
//! a.close().await?;
//! b.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `etcd`: the [`store::EtcdStore`] client and `Watcher::connect`
//! - `metrics`: OpenTelemetry counters and histograms for publishes and deliveries

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod core;
pub mod error;
pub mod notify;
pub mod signal;
pub mod store;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::core::{Endpoint, RetryPolicy, Watcher, WatcherBuilder, WatcherConfig, WatcherState};
    pub use crate::error::{Result, WatcherError};
    pub use crate::notify::{LoopState, WatchEvent, WatchEventKind};
    pub use crate::signal::{PolicyChange, PublishStrategy, UpdateType};
    pub use crate::store::{CoordinationStore, MemoryCluster, MemoryStore};
}
