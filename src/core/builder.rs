//! Builder for constructing Watcher instances.

use crate::core::{Endpoint, RetryPolicy, Watcher, WatcherConfig};
use crate::error::Result;
use crate::notify::{CallbackRegistry, UpdateCallback, WatchEvent};
use crate::signal::PublishStrategy;
use crate::store::CoordinationStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::WatcherMetrics;

/// Builder for constructing a [`Watcher`].
///
/// Starts from [`WatcherConfig::default`], or from a loaded configuration via
/// [`WatcherBuilder::from_sources`]; the `with_*` methods override single fields.
///
/// # Examples
///
/// ```rust,no_run
/// use casbin_etcd_watcher::prelude::*;
/// use casbin_etcd_watcher::store::MemoryStore;
/// use std::time::Duration;
///
/// # async fn example() -> Result<()> {
/// let watcher = Watcher::builder()
///     .with_key("/casbin/tenant-a")
///     .with_strategy(PublishStrategy::Revision)
///     .with_request_timeout(Duration::from_secs(3))
///     .with_callback(|event: &WatchEvent| println!("changed: {}", event.value))
///     .build(MemoryStore::new())?;
///
/// watcher.start_watching().await?;
/// # Ok(())
/// # }
/// ```
pub struct WatcherBuilder {
    config: WatcherConfig,
    callback: Option<UpdateCallback>,
    #[cfg(feature = "metrics")]
    metrics: Option<WatcherMetrics>,
}

impl WatcherBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: WatcherConfig::default(),
            callback: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Start from a configuration file and/or environment overrides.
    ///
    /// See [`WatcherConfig::load`] for precedence rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value fails to parse.
    pub fn from_sources(path: Option<impl AsRef<Path>>, env_prefix: Option<&str>) -> Result<Self> {
        Ok(Self::new().with_config(WatcherConfig::load(path, env_prefix)?))
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a single store endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoints = vec![endpoint];
        self
    }

    /// Use several store endpoints.
    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.config.endpoints = endpoints.into_iter().collect();
        self
    }

    /// Set the signal key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.config.key = key.into();
        self
    }

    /// Set how new signal values are generated.
    pub fn with_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Fail publishes until the signal key has been written once.
    pub fn require_initialized(mut self, required: bool) -> Self {
        self.config.require_initialized = required;
        self
    }

    /// Bound for a single store round trip.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = duration_ms(timeout);
        self
    }

    /// Bound for waiting on the watch task during `close`.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout_ms = duration_ms(timeout);
        self
    }

    /// Whether `close` cancels the subscription (the default) or only flips
    /// the running flag.
    pub fn cancel_on_close(mut self, cancel: bool) -> Self {
        self.config.cancel_on_close = cancel;
        self
    }

    /// Set the resubscribe policy for failed watch streams.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Register the update callback up front.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Record OpenTelemetry metrics with `meter`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, meter: opentelemetry::metrics::Meter) -> Self {
        self.metrics = Some(WatcherMetrics::new(meter));
        self
    }

    /// Build a watcher over `store`. Does not start watching.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn build<S: CoordinationStore + 'static>(self, store: S) -> Result<Watcher> {
        self.build_shared(Arc::new(store))
    }

    /// Build a watcher over a shared store client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn build_shared(self, store: Arc<dyn CoordinationStore>) -> Result<Watcher> {
        self.config.validate()?;

        let registry = CallbackRegistry::new();
        if let Some(callback) = self.callback {
            registry.set(callback);
        }

        let watcher = Watcher::from_parts(self.config, store, registry);
        #[cfg(feature = "metrics")]
        let watcher = watcher.with_metrics(self.metrics);
        Ok(watcher)
    }

    /// Connect to the configured etcd endpoints and build a watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the connection fails.
    #[cfg(feature = "etcd")]
    pub async fn connect(self) -> Result<Watcher> {
        let store = crate::store::EtcdStore::from_config(&self.config).await?;
        self.build(store)
    }
}

impl Default for WatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher {
    /// Create a new builder for constructing a watcher.
    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::new()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
