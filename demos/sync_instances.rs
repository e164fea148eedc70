//! Example keeping three enforcer instances in sync.
//!
//! This example shows how to:
//! - Create several watchers on one signal key
//! - Reload on every change a peer announces
//! - Close watchers cleanly
//!
//! Run with: cargo run --example sync_instances
//!
//! Set `CASBIN_WATCHER_ENDPOINTS=127.0.0.1:2379` and enable the `etcd`
//! feature to run against a real etcd instead of the in-memory cluster.

use casbin_etcd_watcher::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn instances(n: usize) -> Result<Vec<Watcher>> {
    #[cfg(feature = "etcd")]
    if std::env::var("CASBIN_WATCHER_ENDPOINTS").is_ok() {
        let config = WatcherConfig::from_env("CASBIN_WATCHER")?;
        let mut watchers = Vec::with_capacity(n);
        for _ in 0..n {
            watchers.push(Watcher::connect(config.clone()).await?);
        }
        return Ok(watchers);
    }

    let cluster = MemoryCluster::new();
    (0..n)
        .map(|_| Watcher::builder().build(cluster.client()))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Policy Sync Example ===\n");

    let watchers = instances(3).await?;
    let reloads = Arc::new(AtomicUsize::new(0));

    for (i, watcher) in watchers.iter().enumerate() {
        let reloads = Arc::clone(&reloads);
        watcher.set_update_callback(move |event: &WatchEvent| {
            reloads.fetch_add(1, Ordering::SeqCst);
            println!(
                "[Instance {}] {:?} on {} (revision {}), reloading policy",
                i, event.kind, event.key, event.revision
            );
        });
        watcher.start_watching().await?;
    }
    println!("Started {} watchers\n", watchers.len());

    println!("--- Instance 0 adds a policy ---");
    watchers[0]
        .update_for_add_policy("p", "p", &["alice", "data1", "read"])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n--- Instance 1 removes policies for data2 ---");
    watchers[1]
        .update_for_remove_filtered_policy("p", "p", 1, &["data2"])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n--- Instance 2 closes, instance 0 saves the policy ---");
    watchers[2].close().await?;
    watchers[0].update_for_save_policy("").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\nTotal reloads: {}", reloads.load(Ordering::SeqCst));

    for watcher in &watchers {
        watcher.close().await?;
    }
    println!("Example complete!");

    Ok(())
}
