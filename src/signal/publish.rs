//! Publishing the change signal.

use crate::error::{Result, WatcherError};
use crate::store::{CoordinationStore, bounded};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// How a publisher produces the value written to the signal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStrategy {
    /// Write the current wall-clock time. Never depends on the key existing.
    #[default]
    Timestamp,
    /// Read the store revision and write it plus one. Fails when the key
    /// has never been written.
    Revision,
}

/// The "policy changed, reload" convention layered on one store key.
///
/// Every publish writes a value distinct from the previous one so that the
/// store emits a fresh watch event even if it coalesces identical writes.
#[derive(Debug)]
pub struct ChangeSignal {
    key: String,
    strategy: PublishStrategy,
    timeout: Duration,
    last_stamp: AtomicI64,
}

impl ChangeSignal {
    /// Create a signal on `key` using `strategy`, bounding each store round trip by `timeout`.
    pub fn new(key: impl Into<String>, strategy: PublishStrategy, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            strategy,
            timeout,
            last_stamp: AtomicI64::new(i64::MIN),
        }
    }

    /// The signal key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The active strategy.
    pub fn strategy(&self) -> PublishStrategy {
        self.strategy
    }

    /// Write a new signal value and return it.
    ///
    /// # Errors
    ///
    /// - [`WatcherError::SignalNotInitialized`] if the revision strategy finds no value at the key
    /// - [`WatcherError::StoreUnavailable`] or [`WatcherError::Timeout`] if the store cannot be reached
    pub async fn publish(&self, store: &dyn CoordinationStore) -> Result<String> {
        let value = match self.strategy {
            PublishStrategy::Revision => {
                let current = bounded(self.timeout, store.get(&self.key))
                    .await?
                    .ok_or_else(|| WatcherError::SignalNotInitialized {
                        key: self.key.clone(),
                    })?;

                tracing::info!(key = %self.key, revision = current.header_revision, "Get revision");
                (current.header_revision + 1).to_string()
            }
            PublishStrategy::Timestamp => self.next_timestamp(),
        };

        tracing::info!(key = %self.key, value = %value, "Set revision");
        bounded(self.timeout, store.put(&self.key, &value)).await?;
        Ok(value)
    }

    fn next_timestamp(&self) -> String {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        DateTime::from_timestamp_nanos(self.advance_stamp(now)).to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Move the high-water mark to `max(now, last + 1)` and return it.
    ///
    /// Keeps values strictly increasing when the clock stalls or steps back.
    fn advance_stamp(&self, now: i64) -> i64 {
        let next = |last: i64| now.max(last.saturating_add(1));
        match self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => next(previous),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn signal(strategy: PublishStrategy) -> ChangeSignal {
        ChangeSignal::new("/casbin", strategy, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_revision_requires_initialized_key() {
        let store = MemoryStore::new();
        let result = signal(PublishStrategy::Revision).publish(&store).await;

        assert!(matches!(
            result,
            Err(WatcherError::SignalNotInitialized { ref key }) if key == "/casbin"
        ));
        assert_eq!(store.get("/casbin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_revision_writes_store_revision_plus_one() {
        let store = MemoryStore::new();
        store.put("/casbin", "bootstrap").await.unwrap();
        store.put("/unrelated", "x").await.unwrap();

        let value = signal(PublishStrategy::Revision).publish(&store).await.unwrap();
        assert_eq!(value, "3");
        assert_eq!(store.get("/casbin").await.unwrap().unwrap().value, "3");
    }

    #[tokio::test]
    async fn test_timestamp_needs_no_bootstrap() {
        let store = MemoryStore::new();
        let value = signal(PublishStrategy::Timestamp).publish(&store).await.unwrap();

        assert!(DateTime::parse_from_rfc3339(&value).is_ok());
        assert_eq!(store.get("/casbin").await.unwrap().unwrap().value, value);
    }

    #[tokio::test]
    async fn test_consecutive_publishes_differ() {
        let store = MemoryStore::new();
        store.put("/casbin", "bootstrap").await.unwrap();

        for strategy in [PublishStrategy::Timestamp, PublishStrategy::Revision] {
            let signal = signal(strategy);
            let mut previous = signal.publish(&store).await.unwrap();
            for _ in 0..20 {
                let value = signal.publish(&store).await.unwrap();
                assert_ne!(value, previous);
                previous = value;
            }
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_a_bootstrap_failure() {
        let store = MemoryStore::new();
        store.cluster().set_available(false);

        let err = signal(PublishStrategy::Revision)
            .publish(&store)
            .await
            .unwrap_err();
        assert!(!err.is_not_initialized());
        assert!(matches!(err, WatcherError::StoreUnavailable(_)));
    }

    #[test]
    fn test_strategy_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            strategy: PublishStrategy,
        }

        let holder: Holder = config::Config::builder()
            .set_override("strategy", "revision")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(holder.strategy, PublishStrategy::Revision);
    }

    proptest! {
        #[test]
        fn prop_stamps_strictly_increase(clock in proptest::collection::vec(-1_000i64..1_000, 1..64)) {
            let signal = signal(PublishStrategy::Timestamp);
            let mut previous = None;
            for now in clock {
                let stamp = signal.advance_stamp(now);
                prop_assert!(stamp >= now);
                if let Some(previous) = previous {
                    prop_assert!(stamp > previous);
                }
                previous = Some(stamp);
            }
        }
    }
}
