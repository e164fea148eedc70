//! Watcher configuration and its loading from files and environment variables.

use crate::error::{Result, WatcherError};
use crate::signal::PublishStrategy;
use config::{Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default signal key shared by all instances of one policy domain.
pub const DEFAULT_KEY: &str = "/casbin";

/// Host and port of a coordination store node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("127.0.0.1", 2379)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WatcherError::InvalidEndpoint(format!("'{}' is not host:port", s)))?;

        if host.is_empty() {
            return Err(WatcherError::InvalidEndpoint(format!("'{}' has no host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| WatcherError::InvalidEndpoint(format!("'{}': bad port: {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = WatcherError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Reconnect policy for the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Resubscribe after a stream failure at all
    pub enabled: bool,

    /// Maximum number of consecutive resubscribe attempts (0 means unlimited)
    pub max_retries: u32,

    /// Backoff base (unit: milliseconds)
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never resubscribes.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.max_retries == 0 || attempt <= self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

/// Configuration for a [`Watcher`](crate::core::Watcher).
///
/// Every field has a default, so a config file only needs the values it changes.
///
/// # Examples
///
/// ```rust,no_run
/// use casbin_etcd_watcher::core::WatcherConfig;
///
/// # fn example() -> casbin_etcd_watcher::error::Result<()> {
/// // watcher.yaml, overridden by CASBIN_WATCHER_KEY, CASBIN_WATCHER_RETRY__MAX_RETRIES, ...
/// let config = WatcherConfig::load(Some("watcher.yaml"), Some("CASBIN_WATCHER"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Store nodes to connect to
    pub endpoints: Vec<Endpoint>,

    /// Signal key shared by all synchronized instances
    pub key: String,

    /// How change values are produced
    pub strategy: PublishStrategy,

    /// Fail publishing when the signal key has never been written
    pub require_initialized: bool,

    /// Timeout for each store round trip (unit: milliseconds)
    pub request_timeout_ms: u64,

    /// Upper bound on how long `close` waits for the watch task (unit: milliseconds)
    pub close_timeout_ms: u64,

    /// Cancel the store subscription on close. `false` keeps the legacy
    /// behavior of only flipping the running flag.
    pub cancel_on_close: bool,

    /// Resubscribe policy after stream failures
    pub retry: RetryPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::default()],
            key: DEFAULT_KEY.to_string(),
            strategy: PublishStrategy::default(),
            require_initialized: false,
            request_timeout_ms: 5000,
            close_timeout_ms: 2000,
            cancel_on_close: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl WatcherConfig {
    /// Load configuration from an optional file layered under optional environment overrides.
    ///
    /// Environment variables use `_` after the prefix and `__` for nesting,
    /// e.g. `CASBIN_WATCHER_RETRY__BASE_DELAY_MS=50`. `ENDPOINTS` is a comma separated list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, deserialization fails,
    /// or the result does not pass [`validate`](Self::validate).
    pub fn load(path: Option<impl AsRef<Path>>, env_prefix: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        if let Some(prefix) = env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("endpoints")
                    .try_parsing(true),
            );
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file (YAML, TOML or JSON by extension).
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path), None)
    }

    /// Load configuration from environment variables only.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::load(None::<&Path>, Some(prefix))
    }

    /// Check field values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(WatcherError::Config("key must not be empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(WatcherError::Config(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(WatcherError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// The strategy actually used for publishing.
    ///
    /// `require_initialized` forces the revision strategy, which is the one
    /// that can detect a missing signal key.
    pub fn effective_strategy(&self) -> PublishStrategy {
        if self.require_initialized {
            PublishStrategy::Revision
        } else {
            self.strategy
        }
    }

    /// Timeout for a single store round trip.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Upper bound on how long `close` waits for the watch task.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
