//! In-process coordination store.

use super::{CancelHandle, CoordinationStore, KeyValue, StoreEvent, Subscription};
use crate::error::{Result, WatcherError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

struct WatchEntry {
    id: u64,
    client_id: u64,
    key: String,
    tx: mpsc::UnboundedSender<Result<StoreEvent>>,
}

struct ClusterState {
    data: HashMap<String, (String, i64)>,
    revision: i64,
    watches: Vec<WatchEntry>,
    available: bool,
    next_id: u64,
}

impl ClusterState {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(WatcherError::StoreUnavailable(
                "memory cluster is partitioned".to_string(),
            ))
        }
    }

    fn dispatch(&mut self, event: StoreEvent) {
        // Dead receivers are pruned as a side effect.
        self.watches
            .retain(|w| w.key != event.key || w.tx.send(Ok(event.clone())).is_ok());
    }
}

/// A shared in-memory key-value store with a store-wide revision counter.
///
/// Every [`MemoryStore`] obtained through [`MemoryCluster::client`] sees the
/// same data, so several watchers in one process behave like instances
/// connected to the same remote store.
///
/// # Examples
///
/// ```rust
/// use casbin_etcd_watcher::store::MemoryCluster;
///
/// let cluster = MemoryCluster::new();
/// let instance_a = cluster.client();
/// let instance_b = cluster.client();
/// # let _ = (instance_a, instance_b);
/// ```
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                data: HashMap::new(),
                revision: 0,
                watches: Vec::new(),
                available: true,
                next_id: 0,
            })),
        }
    }

    /// Connect a new client to this cluster.
    pub fn client(&self) -> MemoryStore {
        let mut state = self.state.lock();
        let client_id = state.next_id;
        state.next_id += 1;

        MemoryStore {
            cluster: self.clone(),
            client_id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a network partition. While unavailable every request fails
    /// with [`WatcherError::StoreUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Fail every live subscription with a stream error.
    pub fn break_watches(&self) {
        let mut state = self.state.lock();
        for watch in state.watches.drain(..) {
            let _ = watch.tx.send(Err(WatcherError::SubscriptionTerminated(
                "watch stream reset".to_string(),
            )));
        }
    }

    /// Emit an event of a kind other than put/delete on `key`.
    pub fn emit_other(&self, key: &str, label: &str) {
        let mut state = self.state.lock();
        let revision = state.revision;
        state.dispatch(StoreEvent::other(key, label, revision));
    }

    /// Delete `key`. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if state.data.remove(key).is_none() {
            return false;
        }
        state.revision += 1;
        let revision = state.revision;
        state.dispatch(StoreEvent::delete(key, revision));
        true
    }

    /// Current store-wide revision.
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Number of live subscriptions on `key`.
    pub fn watch_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .watches
            .iter()
            .filter(|w| w.key == key && !w.tx.is_closed())
            .count()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A client handle onto a [`MemoryCluster`].
///
/// Closing a client ends only the subscriptions it opened.
pub struct MemoryStore {
    cluster: MemoryCluster,
    client_id: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a client on a fresh, private cluster.
    pub fn new() -> Self {
        MemoryCluster::new().client()
    }

    /// The cluster this client is connected to.
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Whether `close` has been called on this client.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(WatcherError::StoreUnavailable("client is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_open()?;
        let state = self.cluster.state.lock();
        state.check_available()?;

        Ok(state.data.get(key).map(|(value, mod_revision)| KeyValue {
            key: key.to_string(),
            value: value.clone(),
            mod_revision: *mod_revision,
            header_revision: state.revision,
        }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.check_available()?;

        state.revision += 1;
        let revision = state.revision;
        state
            .data
            .insert(key.to_string(), (value.to_string(), revision));
        state.dispatch(StoreEvent::put(key, value, revision));
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Subscription> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.check_available()?;

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.watches.push(WatchEntry {
            id,
            client_id: self.client_id,
            key: key.to_string(),
            tx,
        });

        let cluster = Arc::clone(&self.cluster.state);
        let cancel = CancelHandle::new(move || {
            cluster.lock().watches.retain(|w| w.id != id);
        });

        Ok(Subscription::new(key, rx, cancel))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client_id = self.client_id;
        self.cluster
            .state
            .lock()
            .watches
            .retain(|w| w.client_id != client_id);
        Ok(())
    }

    fn name(&self) -> String {
        format!("memory:client-{}", self.client_id)
    }
}
