//! Two or more watchers sharing one cluster, the way separate enforcer
//! processes share one etcd.

use casbin_etcd_watcher::prelude::*;
use chrono::DateTime;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn counting(watcher: &Watcher) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);
    watcher.set_update_callback(move |_| {
        counter_clone.fetch_add(1, Ordering::SeqCst);
    });
    counter
}

async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {expected} deliveries, saw {}",
            counter.load(Ordering::SeqCst)
        )
    });
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 10,
        max_delay_ms: 50,
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn test_add_policy_reaches_peer_once() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();
    let b = Watcher::builder().build(cluster.client()).unwrap();

    let counter = counting(&b);
    b.start_watching().await.unwrap();

    assert!(a.update_for_add_policy("p", "p", &["alice", "data1", "read"]).await);

    wait_for_count(&counter, 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_every_update_kind_reaches_peer() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();
    let b = Watcher::builder().build(cluster.client()).unwrap();
    let counter = counting(&b);
    b.start_watching().await.unwrap();

    let rules = vec![
        vec!["bob".to_string(), "data2".to_string(), "write".to_string()],
        vec!["carol".to_string(), "data3".to_string(), "read".to_string()],
    ];

    assert!(a.update().await);
    assert!(a.update_for_add_policy("p", "p", &["alice", "data1", "read"]).await);
    assert!(a.update_for_remove_policy("p", "p", &["alice", "data1", "read"]).await);
    assert!(a.update_for_remove_filtered_policy("p", "p", 1, &["data2"]).await);
    assert!(a.update_for_save_policy("[policy_definition]\np = sub, obj, act").await);
    assert!(a.update_for_add_policies("p", "p", &rules).await);
    assert!(a.update_for_remove_policies("p", "p", &rules).await);

    wait_for_count(&counter, 7).await;
}

#[tokio::test]
async fn test_every_watcher_on_the_key_is_notified() {
    let cluster = MemoryCluster::new();
    let publisher = Watcher::builder().build(cluster.client()).unwrap();

    let mut peers = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..3 {
        let peer = Watcher::builder().build(cluster.client()).unwrap();
        counters.push(counting(&peer));
        peer.start_watching().await.unwrap();
        peers.push(peer);
    }

    assert!(publisher.update().await);
    for counter in &counters {
        wait_for_count(counter, 1).await;
    }
}

#[tokio::test]
async fn test_other_keys_are_not_delivered() {
    let cluster = MemoryCluster::new();
    let tenant_a = Watcher::builder().with_key("/casbin/a").build(cluster.client()).unwrap();
    let tenant_b = Watcher::builder().with_key("/casbin/b").build(cluster.client()).unwrap();
    let counter = counting(&tenant_b);
    tenant_b.start_watching().await.unwrap();

    assert!(tenant_a.update().await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deletes_are_delivered_other_kinds_are_not() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();
    let b = Watcher::builder().build(cluster.client()).unwrap();

    let kinds = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let kinds_clone = Arc::clone(&kinds);
    b.set_update_callback(move |event| kinds_clone.lock().push(event.kind));
    b.start_watching().await.unwrap();

    assert!(a.update().await);
    cluster.emit_other("/casbin", "progress");
    assert!(cluster.delete("/casbin"));

    timeout(Duration::from_secs(5), async {
        while kinds.lock().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(*kinds.lock(), vec![WatchEventKind::Put, WatchEventKind::Delete]);
}

#[tokio::test]
async fn test_revision_strategy_needs_bootstrap() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder()
        .require_initialized(true)
        .build(cluster.client())
        .unwrap();
    let b = Watcher::builder().build(cluster.client()).unwrap();
    let counter = counting(&b);
    b.start_watching().await.unwrap();

    assert!(!a.update_for_add_policy("p", "p", &["alice", "data1", "read"]).await);
    assert!(a.publish().await.unwrap_err().is_not_initialized());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // An operator writes the key once; from then on revisions work.
    cluster.client().put("/casbin", "init").await.unwrap();
    wait_for_count(&counter, 1).await;

    assert!(a.update().await);
    wait_for_count(&counter, 2).await;
}

#[tokio::test]
async fn test_publishes_are_distinct_and_increasing() {
    let cluster = MemoryCluster::new();
    let timestamps = Watcher::builder().build(cluster.client()).unwrap();

    let mut previous = None;
    for _ in 0..100 {
        let value = timestamps.publish().await.unwrap();
        let stamp = DateTime::parse_from_rfc3339(&value).unwrap();
        if let Some(previous) = previous {
            assert!(stamp > previous);
        }
        previous = Some(stamp);
    }

    let revisions = Watcher::builder()
        .with_strategy(PublishStrategy::Revision)
        .build(cluster.client())
        .unwrap();
    let first: i64 = revisions.publish().await.unwrap().parse().unwrap();
    let second: i64 = revisions.publish().await.unwrap().parse().unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn test_panicking_callback_keeps_watching() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();
    let b = Watcher::builder().build(cluster.client()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    b.set_update_callback(move |_| {
        if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("policy reload failed");
        }
    });
    b.start_watching().await.unwrap();

    assert!(a.update().await);
    wait_for_count(&calls, 1).await;
    assert!(a.update().await);
    wait_for_count(&calls, 2).await;

    assert_eq!(b.loop_state(), LoopState::Watching);
}

#[tokio::test]
async fn test_watch_survives_stream_reset() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();
    let b = Watcher::builder().with_retry(fast_retry()).build(cluster.client()).unwrap();
    let counter = counting(&b);
    b.start_watching().await.unwrap();

    cluster.break_watches();
    timeout(Duration::from_secs(5), async {
        while cluster.watch_count("/casbin") == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(a.update().await);
    wait_for_count(&counter, 1).await;
}

#[tokio::test]
async fn test_unavailable_store_fails_publish() {
    let cluster = MemoryCluster::new();
    let a = Watcher::builder().build(cluster.client()).unwrap();

    cluster.set_available(false);
    assert!(!a.update().await);
    assert!(matches!(a.publish().await, Err(WatcherError::StoreUnavailable(_))));

    cluster.set_available(true);
    assert!(a.update().await);
}
