//! Background task that consumes the signal key's watch stream.

use super::backoff::backoff_delay;
use super::{CallbackRegistry, Delivery, WatchEvent};
use crate::core::RetryPolicy;
use crate::error::WatcherError;
use crate::store::{CoordinationStore, StoreEvent, Subscription, bounded};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(feature = "metrics")]
use crate::metrics::WatcherMetrics;

/// Lifecycle of the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not subscribed yet
    Idle,
    /// Subscribed and consuming events
    Watching,
    /// Subscription cancelled or stream ended
    Stopped,
}

/// Why the watch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The watcher asked the loop to stop
    Cancelled,
    /// The store closed the stream without an error
    StreamEnded,
    /// The stream failed and could not be re-established
    Failed(WatcherError),
}

enum Step {
    Cancelled,
    Event(StoreEvent),
    Failed(WatcherError),
    Ended,
}

/// Consumes one subscription and hands put/delete events to the registry.
///
/// Runs on its own task for the lifetime of the watcher. It is the only
/// consumer of the event stream.
pub(crate) struct WatchLoop {
    store: Arc<dyn CoordinationStore>,
    key: String,
    registry: CallbackRegistry,
    retry: RetryPolicy,
    request_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<LoopState>>,
    failures: u32,
    #[cfg(feature = "metrics")]
    metrics: Option<WatcherMetrics>,
}

impl WatchLoop {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        registry: CallbackRegistry,
        retry: RetryPolicy,
        request_timeout: Duration,
        shutdown: watch::Receiver<bool>,
        state: Arc<watch::Sender<LoopState>>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            registry,
            retry,
            request_timeout,
            shutdown,
            state,
            failures: 0,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<WatcherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawn the loop over an already established subscription.
    ///
    /// The state reads [`LoopState::Watching`] as soon as this returns.
    pub(crate) fn spawn(self, subscription: Subscription) -> JoinHandle<StopReason> {
        self.state.send_replace(LoopState::Watching);
        tokio::spawn(self.run(subscription))
    }

    async fn run(mut self, mut subscription: Subscription) -> StopReason {
        tracing::info!(key = %self.key, store = %self.store.name(), "Watching signal key");

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => Step::Cancelled,
                next = subscription.next() => match next {
                    Some(Ok(event)) => Step::Event(event),
                    Some(Err(err)) => Step::Failed(err),
                    None => Step::Ended,
                },
            };

            match step {
                Step::Cancelled => break StopReason::Cancelled,
                Step::Event(event) => {
                    self.failures = 0;
                    self.dispatch(event);
                }
                Step::Ended if self.is_shutdown() => break StopReason::Cancelled,
                Step::Ended => break StopReason::StreamEnded,
                Step::Failed(err) => {
                    subscription.cancel();
                    match self.resubscribe(err).await {
                        Ok(next) => subscription = next,
                        Err(reason) => break reason,
                    }
                }
            }
        };

        subscription.cancel();
        self.state.send_replace(LoopState::Stopped);

        match &reason {
            StopReason::Cancelled => tracing::info!(key = %self.key, "Watch stopped"),
            StopReason::StreamEnded => {
                tracing::error!(key = %self.key, "Watch stream closed by the store")
            }
            StopReason::Failed(err) => {
                tracing::error!(key = %self.key, error = %err, "Watch subscription terminated")
            }
        }
        reason
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn dispatch(&self, event: StoreEvent) {
        let Some(event) = WatchEvent::from_store(event) else {
            tracing::debug!(key = %self.key, "Ignoring non put/delete watch event");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_ignored();
            }
            return;
        };

        tracing::debug!(
            key = %event.key,
            kind = ?event.kind,
            revision = event.revision,
            "Delivering watch event"
        );

        match self.registry.invoke_unless(&event, || self.is_shutdown()) {
            Delivery::Delivered => {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_delivery();
                }
            }
            Delivery::NoCallback => {
                tracing::debug!(key = %self.key, "No update callback registered");
            }
            Delivery::Panicked(message) => {
                tracing::error!(
                    key = %self.key,
                    revision = event.revision,
                    panic = %message,
                    "Update callback panicked"
                );
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_callback_panic();
                }
            }
            Delivery::Cancelled => {
                tracing::debug!(key = %self.key, "Dropping event after shutdown");
            }
        }
    }

    /// Re-establish the subscription after a stream failure.
    ///
    /// Consecutive failures share one attempt budget; it resets once an event
    /// is delivered on the new stream.
    async fn resubscribe(&mut self, mut err: WatcherError) -> Result<Subscription, StopReason> {
        loop {
            self.failures += 1;
            if !self.retry.allows(self.failures) {
                return Err(StopReason::Failed(err));
            }

            let delay = backoff_delay(&self.retry, self.failures);
            tracing::warn!(
                key = %self.key,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Watch stream failed, resubscribing"
            );
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_resubscribe();
            }

            tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => return Err(StopReason::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            match bounded(self.request_timeout, self.store.watch(&self.key)).await {
                Ok(subscription) => {
                    tracing::info!(key = %self.key, attempt = self.failures, "Resubscribed to signal key");
                    return Ok(subscription);
                }
                Err(next) => err = next,
            }
        }
    }
}

/// Resolves once a stop is requested. A dropped sender counts as a request.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
