//! Watcher metrics tracking using OpenTelemetry.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector for publish and watch operations.
///
/// # Examples
///
/// ```rust,no_run
/// use casbin_etcd_watcher::metrics::WatcherMetrics;
/// use opentelemetry::global;
///
/// let meter = global::meter("casbin-watcher");
/// let metrics = WatcherMetrics::new(meter);
///
/// let timer = metrics.start_publish();
/// // ... write the signal ...
/// metrics.record_publish_success(timer);
/// ```
#[derive(Clone)]
pub struct WatcherMetrics {
    publish_attempts: Counter<u64>,
    publish_success: Counter<u64>,
    publish_failures: Counter<u64>,
    publish_duration: Histogram<f64>,
    events_delivered: Counter<u64>,
    events_ignored: Counter<u64>,
    callback_panics: Counter<u64>,
    resubscribe_attempts: Counter<u64>,
    last_delivery: Arc<parking_lot::Mutex<Option<Instant>>>,
}

impl WatcherMetrics {
    /// Create a new metrics collector with the provided meter.
    pub fn new(meter: Meter) -> Self {
        let publish_attempts = meter
            .u64_counter("casbin_watcher.publish.attempts")
            .with_description("Total number of change signal publishes")
            .build();

        let publish_success = meter
            .u64_counter("casbin_watcher.publish.success")
            .with_description("Number of publishes accepted by the store")
            .build();

        let publish_failures = meter
            .u64_counter("casbin_watcher.publish.failures")
            .with_description("Number of failed publishes, by reason")
            .build();

        let publish_duration = meter
            .f64_histogram("casbin_watcher.publish.duration")
            .with_description("Duration of publish round trips in seconds")
            .with_unit("s")
            .build();

        let events_delivered = meter
            .u64_counter("casbin_watcher.events.delivered")
            .with_description("Watch events handed to the update callback")
            .build();

        let events_ignored = meter
            .u64_counter("casbin_watcher.events.ignored")
            .with_description("Watch events of kinds other than put/delete")
            .build();

        let callback_panics = meter
            .u64_counter("casbin_watcher.callback.panics")
            .with_description("Update callback invocations that panicked")
            .build();

        let resubscribe_attempts = meter
            .u64_counter("casbin_watcher.watch.resubscribes")
            .with_description("Attempts to re-establish a failed watch stream")
            .build();

        Self {
            publish_attempts,
            publish_success,
            publish_failures,
            publish_duration,
            events_delivered,
            events_ignored,
            callback_panics,
            resubscribe_attempts,
            last_delivery: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Start a publish timer.
    pub fn start_publish(&self) -> Instant {
        self.publish_attempts.add(1, &[]);
        Instant::now()
    }

    /// Record a publish the store accepted.
    pub fn record_publish_success(&self, start: Instant) {
        self.publish_success.add(1, &[]);
        self.publish_duration
            .record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record a failed publish. `reason` is a short label such as `not_initialized`.
    pub fn record_publish_failure(&self, start: Instant, reason: &'static str) {
        self.publish_failures
            .add(1, &[KeyValue::new("reason", reason)]);
        self.publish_duration
            .record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record an event handed to the callback.
    pub fn record_delivery(&self) {
        self.events_delivered.add(1, &[]);
        *self.last_delivery.lock() = Some(Instant::now());
    }

    /// Record an event that was filtered out.
    pub fn record_ignored(&self) {
        self.events_ignored.add(1, &[]);
    }

    /// Record a callback panic.
    pub fn record_callback_panic(&self) {
        self.callback_panics.add(1, &[]);
    }

    /// Record a resubscribe attempt.
    pub fn record_resubscribe(&self) {
        self.resubscribe_attempts.add(1, &[]);
    }

    /// Time since the last delivered event, if any.
    pub fn since_last_delivery(&self) -> Option<std::time::Duration> {
        self.last_delivery.lock().map(|at| at.elapsed())
    }
}
