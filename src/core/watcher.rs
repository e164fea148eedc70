//! The watcher facade handed to the policy enforcer.

use crate::core::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::notify::watch_loop::WatchLoop;
use crate::notify::{CallbackRegistry, LoopState, StopReason, WatchEvent};
use crate::signal::{ChangeSignal, PolicyChange};
use crate::store::{CoordinationStore, bounded};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(feature = "metrics")]
use crate::metrics::WatcherMetrics;

/// Lifecycle phase of a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Store client is ready; nothing is being watched yet
    ClientCreated,
    /// The watch task is running
    Watching,
    /// `close` has been called
    Closed,
}

struct TaskSlot {
    state_tx: Arc<watch::Sender<LoopState>>,
    handle: Option<JoinHandle<StopReason>>,
}

/// Keeps several enforcer instances in sync through one signal key.
///
/// The enforcer calls one of the `update*` methods after each policy
/// mutation; every other instance watching the same key then gets its update
/// callback invoked and reloads its policy.
///
/// # Examples
///
/// ```rust,no_run
/// use casbin_etcd_watcher::prelude::*;
/// use casbin_etcd_watcher::store::MemoryStore;
///
/// # async fn example() -> Result<()> {
/// let watcher = Watcher::builder()
///     .with_key("/casbin")
///     .build(MemoryStore::new())?;
///
/// watcher.set_update_callback(|event: &WatchEvent| {
///     println!("Reloading policy after revision {}", event.revision);
/// });
/// watcher.start_watching().await?;
///
/// // After a local mutation:
/// if !watcher.update_for_add_policy("p", "p", &["alice", "data1", "read"]).await {
///     eprintln!("peers may be stale");
/// }
///
/// watcher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    config: WatcherConfig,
    store: Arc<dyn CoordinationStore>,
    signal: ChangeSignal,
    registry: CallbackRegistry,
    state: Mutex<WatcherState>,
    shutdown: watch::Sender<bool>,
    loop_state: watch::Receiver<LoopState>,
    task: tokio::sync::Mutex<TaskSlot>,
    #[cfg(feature = "metrics")]
    metrics: Option<WatcherMetrics>,
}

impl Watcher {
    /// Create a watcher over an existing store client. Does not start watching.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn create(config: WatcherConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, store, CallbackRegistry::new()))
    }

    /// Connect to the configured etcd endpoints and create a watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the connection fails.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: WatcherConfig) -> Result<Self> {
        Self::builder().with_config(config).connect().await
    }

    pub(crate) fn from_parts(
        config: WatcherConfig,
        store: Arc<dyn CoordinationStore>,
        registry: CallbackRegistry,
    ) -> Self {
        let signal = ChangeSignal::new(
            config.key.clone(),
            config.effective_strategy(),
            config.request_timeout(),
        );
        let (shutdown, _) = watch::channel(false);
        let (state_tx, loop_state) = watch::channel(LoopState::Idle);

        tracing::info!(
            key = %config.key,
            store = %store.name(),
            strategy = ?signal.strategy(),
            "Watcher created"
        );

        Self {
            config,
            store,
            signal,
            registry,
            state: Mutex::new(WatcherState::ClientCreated),
            shutdown,
            loop_state,
            task: tokio::sync::Mutex::new(TaskSlot {
                state_tx: Arc::new(state_tx),
                handle: None,
            }),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<WatcherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The signal key.
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// The configuration this watcher was created with.
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Whether `close` has not been called yet.
    pub fn is_running(&self) -> bool {
        self.state() != WatcherState::Closed
    }

    /// Whether events are currently being consumed.
    ///
    /// Turns false when the watch task stops on its own, e.g. after giving up
    /// on a failed stream; `start_watching` can then be called again.
    pub fn is_watching(&self) -> bool {
        self.state() == WatcherState::Watching && self.loop_state() != LoopState::Stopped
    }

    /// Current state of the background watch task.
    pub fn loop_state(&self) -> LoopState {
        *self.loop_state.borrow()
    }

    /// A receiver that observes every watch task state change.
    pub fn loop_state_changes(&self) -> watch::Receiver<LoopState> {
        self.loop_state.clone()
    }

    /// Replace the update callback.
    ///
    /// Safe to call while an event is being delivered: the swap waits for the
    /// delivery to finish, and the next event goes to the new callback.
    pub fn set_update_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.registry.set(callback);
        tracing::info!(key = %self.config.key, "Update callback set");
    }

    /// Remove the update callback. Events keep being consumed but go nowhere.
    pub fn clear_update_callback(&self) {
        self.registry.clear();
    }

    /// Subscribe to the signal key and start the background watch task.
    ///
    /// Calling this again while watching does nothing. If the watch task has
    /// stopped on its own (the stream ended or resubscribing gave up), a new
    /// subscription and task replace it.
    ///
    /// # Errors
    ///
    /// - [`WatcherError::Closed`] if the watcher has been closed
    /// - a store error if the subscription cannot be set up
    pub async fn start_watching(&self) -> Result<()> {
        let mut task = self.task.lock().await;

        match self.state() {
            WatcherState::Watching if self.loop_state() != LoopState::Stopped => return Ok(()),
            WatcherState::Closed => return Err(WatcherError::Closed),
            WatcherState::Watching | WatcherState::ClientCreated => {}
        }

        if let Some(finished) = task.handle.take() {
            match finished.await {
                Ok(reason) => {
                    tracing::info!(key = %self.config.key, reason = ?reason, "Restarting stopped watch")
                }
                Err(e) => {
                    tracing::warn!(key = %self.config.key, error = %e, "Previous watch task failed")
                }
            }
        }

        let subscription = match bounded(
            self.config.request_timeout(),
            self.store.watch(&self.config.key),
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(key = %self.config.key, error = %e, "Failed to subscribe to signal key");
                return Err(e);
            }
        };

        let watch_loop = WatchLoop::new(
            Arc::clone(&self.store),
            self.config.key.clone(),
            self.registry.clone(),
            self.config.retry,
            self.config.request_timeout(),
            self.shutdown.subscribe(),
            Arc::clone(&task.state_tx),
        );
        #[cfg(feature = "metrics")]
        let watch_loop = watch_loop.with_metrics(self.metrics.clone());

        task.handle = Some(watch_loop.spawn(subscription));

        let mut state = self.state.lock();
        if *state == WatcherState::ClientCreated {
            *state = WatcherState::Watching;
        }
        Ok(())
    }

    /// Write a new signal value and return it.
    ///
    /// # Errors
    ///
    /// - [`WatcherError::Closed`] after `close`
    /// - [`WatcherError::SignalNotInitialized`] if the revision strategy finds no value
    /// - [`WatcherError::StoreUnavailable`] or [`WatcherError::Timeout`] on store failure
    pub async fn publish(&self) -> Result<String> {
        if self.state() == WatcherState::Closed {
            return Err(WatcherError::Closed);
        }

        #[cfg(feature = "metrics")]
        let timer = self.metrics.as_ref().map(|m| m.start_publish());

        let result = self.signal.publish(self.store.as_ref()).await;

        #[cfg(feature = "metrics")]
        if let (Some(metrics), Some(timer)) = (&self.metrics, timer) {
            match &result {
                Ok(_) => metrics.record_publish_success(timer),
                Err(e) => metrics.record_publish_failure(timer, crate::metrics::failure_reason(e)),
            }
        }

        result
    }

    /// Log `change` and signal peers.
    ///
    /// Returns `false` if the signal could not be written. The local mutation
    /// is unaffected; `false` only means peers may be stale.
    pub async fn notify(&self, change: PolicyChange) -> bool {
        change.log(&self.config.key);

        match self.publish().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    key = %self.config.key,
                    update_type = %change.update_type,
                    error = %e,
                    not_initialized = e.is_not_initialized(),
                    "Failed to publish policy change, peers may be stale"
                );
                false
            }
        }
    }

    /// Signal peers that the policy changed.
    pub async fn update(&self) -> bool {
        self.notify(PolicyChange::update()).await
    }

    /// Signal peers that one rule was added.
    pub async fn update_for_add_policy<S: AsRef<str>>(&self, sec: &str, ptype: &str, params: &[S]) -> bool {
        self.notify(PolicyChange::add_policy(sec, ptype, to_rule(params)))
            .await
    }

    /// Signal peers that one rule was removed.
    pub async fn update_for_remove_policy<S: AsRef<str>>(&self, sec: &str, ptype: &str, params: &[S]) -> bool {
        self.notify(PolicyChange::remove_policy(sec, ptype, to_rule(params)))
            .await
    }

    /// Signal peers that rules matching a field filter were removed.
    pub async fn update_for_remove_filtered_policy<S: AsRef<str>>(
        &self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: &[S],
    ) -> bool {
        self.notify(PolicyChange::remove_filtered_policy(
            sec,
            ptype,
            field_index,
            to_rule(field_values),
        ))
        .await
    }

    /// Signal peers that the whole policy was saved.
    pub async fn update_for_save_policy(&self, model: &str) -> bool {
        self.notify(PolicyChange::save_policy(model)).await
    }

    /// Signal peers that several rules were added.
    pub async fn update_for_add_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> bool {
        self.notify(PolicyChange::add_policies(sec, ptype, rules.to_vec()))
            .await
    }

    /// Signal peers that several rules were removed.
    pub async fn update_for_remove_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> bool {
        self.notify(PolicyChange::remove_policies(sec, ptype, rules.to_vec()))
            .await
    }

    /// Stop watching and release the store client.
    ///
    /// Calling `close` more than once is a no-op. Once it returns the update
    /// callback is not invoked again. Waiting for the watch task is bounded by
    /// `close_timeout`; a task that does not stop in time is aborted.
    ///
    /// With `cancel_on_close` disabled only the running flag flips and the
    /// watch task keeps delivering until the store ends the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the store client fails to shut down.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == WatcherState::Closed {
                return Ok(());
            }
            *state = WatcherState::Closed;
        }

        if !self.config.cancel_on_close {
            tracing::info!(key = %self.config.key, "Watcher closed, subscription left running");
            return Ok(());
        }

        self.shutdown.send_replace(true);

        let mut task = self.task.lock().await;
        if let Some(mut handle) = task.handle.take() {
            match tokio::time::timeout(self.config.close_timeout(), &mut handle).await {
                Ok(Ok(reason)) => {
                    tracing::debug!(key = %self.config.key, reason = ?reason, "Watch task finished")
                }
                Ok(Err(e)) => {
                    tracing::warn!(key = %self.config.key, error = %e, "Watch task failed")
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.config.key,
                        timeout_ms = self.config.close_timeout_ms,
                        "Watch task did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
            // An aborted task never reports its own stop.
            task.state_tx.send_replace(LoopState::Stopped);
        }
        drop(task);

        // An aborted task may still be inside the callback.
        self.registry.quiesce();

        let result = bounded(self.config.request_timeout(), self.store.close()).await;
        match &result {
            Ok(()) => tracing::info!(key = %self.config.key, "Watcher closed"),
            Err(e) => {
                tracing::warn!(key = %self.config.key, error = %e, "Failed to close store client")
            }
        }
        result
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("key", &self.config.key)
            .field("store", &self.store.name())
            .field("state", &self.state())
            .field("loop_state", &self.loop_state())
            .finish()
    }
}

fn to_rule<S: AsRef<str>>(params: &[S]) -> Vec<String> {
    params.iter().map(|p| p.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::PublishStrategy;
    use crate::store::{MemoryCluster, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn watcher(store: MemoryStore) -> Watcher {
        Watcher::create(WatcherConfig::default(), Arc::new(store)).unwrap()
    }

    #[tokio::test]
    async fn test_create_does_not_watch() {
        let cluster = MemoryCluster::new();
        let watcher = watcher(cluster.client());

        assert_eq!(watcher.state(), WatcherState::ClientCreated);
        assert_eq!(watcher.loop_state(), LoopState::Idle);
        assert_eq!(cluster.watch_count("/casbin"), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let config = WatcherConfig {
            key: String::new(),
            ..WatcherConfig::default()
        };
        assert!(Watcher::create(config, Arc::new(MemoryStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_start_watching_is_idempotent() {
        let cluster = MemoryCluster::new();
        let watcher = watcher(cluster.client());

        watcher.start_watching().await.unwrap();
        watcher.start_watching().await.unwrap();

        assert_eq!(watcher.state(), WatcherState::Watching);
        assert_eq!(cluster.watch_count("/casbin"), 1);
    }

    #[tokio::test]
    async fn test_start_watching_surfaces_store_failure() {
        let cluster = MemoryCluster::new();
        let watcher = watcher(cluster.client());
        cluster.set_available(false);

        assert!(matches!(
            watcher.start_watching().await,
            Err(WatcherError::StoreUnavailable(_))
        ));
        assert_eq!(watcher.state(), WatcherState::ClientCreated);

        cluster.set_available(true);
        watcher.start_watching().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Watching);
    }

    #[tokio::test]
    async fn test_start_after_close_fails() {
        let watcher = watcher(MemoryStore::new());
        watcher.close().await.unwrap();
        assert_eq!(watcher.start_watching().await, Err(WatcherError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cluster = MemoryCluster::new();
        let store = cluster.client();
        let watcher = Watcher::create(WatcherConfig::default(), Arc::new(store)).unwrap();
        watcher.start_watching().await.unwrap();

        watcher.close().await.unwrap();
        watcher.close().await.unwrap();

        assert_eq!(watcher.state(), WatcherState::Closed);
        assert!(!watcher.is_running());
        assert_eq!(watcher.loop_state(), LoopState::Stopped);
        assert_eq!(cluster.watch_count("/casbin"), 0);
    }

    #[tokio::test]
    async fn test_update_after_close_returns_false() {
        let watcher = watcher(MemoryStore::new());
        watcher.close().await.unwrap();

        assert!(!watcher.update().await);
        assert_eq!(watcher.publish().await, Err(WatcherError::Closed));
    }

    #[tokio::test]
    async fn test_revision_strategy_bootstrap_failure() {
        let config = WatcherConfig {
            require_initialized: true,
            ..WatcherConfig::default()
        };
        let watcher = Watcher::create(config, Arc::new(MemoryStore::new())).unwrap();

        assert!(!watcher.update().await);
        assert!(watcher.publish().await.unwrap_err().is_not_initialized());
    }

    #[tokio::test]
    async fn test_every_update_kind_publishes() {
        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::create(WatcherConfig::default(), store.clone()).unwrap();
        let rules = vec![vec!["jack".to_string(), "data4".to_string(), "read".to_string()]];

        assert!(watcher.update().await);
        assert!(watcher.update_for_add_policy("p", "p", &["eve", "data3", "read"]).await);
        assert!(watcher.update_for_remove_policy("p", "p", &["eve", "data3", "read"]).await);
        assert!(watcher.update_for_remove_filtered_policy("p", "p", 0, &["eve"]).await);
        assert!(watcher.update_for_save_policy("[request_definition]").await);
        assert!(watcher.update_for_add_policies("p", "p", &rules).await);
        assert!(watcher.update_for_remove_policies("p", "p", &rules).await);

        assert_eq!(store.cluster().revision(), 7);
    }

    #[tokio::test]
    async fn test_callback_receives_own_writes() {
        let watcher = watcher(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        watcher.set_update_callback(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        watcher.start_watching().await.unwrap();

        assert!(watcher.update().await);

        timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_revision_strategy_after_bootstrap() {
        let store = Arc::new(MemoryStore::new());
        store.put("/casbin", "bootstrap").await.unwrap();

        let config = WatcherConfig {
            strategy: PublishStrategy::Revision,
            ..WatcherConfig::default()
        };
        let watcher = Watcher::create(config, store.clone()).unwrap();

        assert_eq!(watcher.publish().await.unwrap(), "2");
        assert_eq!(watcher.publish().await.unwrap(), "3");
    }

    #[tokio::test]
    async fn test_drop_stops_watch_task() {
        let cluster = MemoryCluster::new();
        let watcher = watcher(cluster.client());
        watcher.start_watching().await.unwrap();
        let mut states = watcher.loop_state_changes();

        drop(watcher);

        timeout(
            Duration::from_secs(2),
            states.wait_for(|state| *state == LoopState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(cluster.watch_count("/casbin"), 0);
    }
}
