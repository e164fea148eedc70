//! etcd v3 coordination store.

use super::{CancelHandle, CoordinationStore, KeyValue, StoreEvent, StoreEventKind, Subscription, bounded};
use crate::core::{Endpoint, WatcherConfig};
use crate::error::{Result, WatcherError};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, WatchResponse};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

impl From<etcd_client::Error> for WatcherError {
    fn from(err: etcd_client::Error) -> Self {
        WatcherError::StoreUnavailable(err.to_string())
    }
}

/// Coordination store backed by an etcd v3 cluster.
///
/// # Examples
///
/// ```rust,no_run
/// use casbin_etcd_watcher::core::Endpoint;
/// use casbin_etcd_watcher::store::EtcdStore;
/// use std::time::Duration;
///
/// # async fn example() -> casbin_etcd_watcher::error::Result<()> {
/// let endpoints = vec![Endpoint::new("localhost", 2379)];
/// let store = EtcdStore::connect(&endpoints, Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct EtcdStore {
    client: Mutex<Option<Client>>,
    endpoints: Vec<Endpoint>,
    closed: watch::Sender<bool>,
}

impl EtcdStore {
    /// Connect to the given endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoints are given or the connection fails.
    pub async fn connect(endpoints: &[Endpoint], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(WatcherError::Config(
                "at least one etcd endpoint is required".to_string(),
            ));
        }

        let urls: Vec<String> = endpoints.iter().map(Endpoint::to_string).collect();
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);

        let client = Client::connect(urls, Some(options)).await?;
        tracing::info!(endpoints = ?endpoints, "Connected to etcd");

        Ok(Self {
            client: Mutex::new(Some(client)),
            endpoints: endpoints.to_vec(),
            closed: watch::channel(false).0,
        })
    }

    /// Validate `config` and connect to its endpoints, bounded by its request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the connection fails.
    pub async fn from_config(config: &WatcherConfig) -> Result<Self> {
        config.validate()?;
        let timeout = config.request_timeout();
        bounded(timeout, Self::connect(&config.endpoints, timeout)).await
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| WatcherError::StoreUnavailable("client is closed".to_string()))
    }
}

/// The parts of a watch response that decide what a subscriber sees.
struct ResponseParts {
    canceled: bool,
    cancel_reason: String,
    created: bool,
    revision: i64,
    events: Vec<(StoreEventKind, String, i64)>,
}

impl ResponseParts {
    fn from_response(response: &WatchResponse) -> Self {
        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        let events = response
            .events()
            .iter()
            .map(|event| {
                let kind = match event.event_type() {
                    EventType::Put => StoreEventKind::Put,
                    EventType::Delete => StoreEventKind::Delete,
                };
                let (value, mod_revision) = event
                    .kv()
                    .map(|kv| (kv.value_str().unwrap_or_default().to_string(), kv.mod_revision()))
                    .unwrap_or((String::new(), revision));
                (kind, value, mod_revision)
            })
            .collect();

        Self {
            canceled: response.canceled(),
            cancel_reason: response.cancel_reason().to_string(),
            created: response.created(),
            revision,
            events,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Forward {
    Skip,
    Events(Vec<StoreEvent>),
    Terminated(WatcherError),
}

fn translate(key: &str, parts: ResponseParts) -> Forward {
    if parts.canceled {
        return Forward::Terminated(WatcherError::SubscriptionTerminated(parts.cancel_reason));
    }
    if parts.created {
        return Forward::Skip;
    }
    // Progress notifications carry no events.
    if parts.events.is_empty() {
        return Forward::Events(vec![StoreEvent::other(key, "progress", parts.revision)]);
    }

    Forward::Events(
        parts
            .events
            .into_iter()
            .map(|(kind, value, mod_revision)| match kind {
                StoreEventKind::Put => StoreEvent::put(key, value, mod_revision),
                StoreEventKind::Delete => StoreEvent::delete(key, mod_revision),
                StoreEventKind::Other(label) => StoreEvent::other(key, label, mod_revision),
            })
            .collect(),
    )
}

async fn client_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut kv = self.client()?.kv_client();
        let response = kv.get(key, None).await?;

        let header_revision = response.header().map(|h| h.revision()).unwrap_or_default();
        let Some(entry) = response.kvs().first() else {
            return Ok(None);
        };

        Ok(Some(KeyValue {
            key: key.to_string(),
            value: entry.value_str()?.to_string(),
            mod_revision: entry.mod_revision(),
            header_revision,
        }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut kv = self.client()?.kv_client();
        kv.put(key, value, None).await?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Subscription> {
        let mut watch_client = self.client()?.watch_client();
        let (mut watcher, mut stream) = watch_client.watch(key, None).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut closed = self.closed.subscribe();
        let watched_key = key.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Fires on explicit cancel and when the handle is dropped.
                    _ = &mut stop_rx => {
                        if let Err(e) = watcher.cancel().await {
                            tracing::debug!(key = %watched_key, error = %e, "etcd watch cancel failed");
                        }
                        break;
                    }
                    _ = client_closed(&mut closed) => break,
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            match translate(&watched_key, ResponseParts::from_response(&response)) {
                                Forward::Skip => {}
                                Forward::Events(events) => {
                                    for event in events {
                                        if tx.send(Ok(event)).is_err() {
                                            return;
                                        }
                                    }
                                }
                                Forward::Terminated(err) => {
                                    let _ = tx.send(Err(err));
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(WatcherError::SubscriptionTerminated(e.to_string())));
                            break;
                        }
                    }
                }
            }
        });

        let cancel = CancelHandle::new(move || {
            let _ = stop_tx.send(());
        });

        Ok(Subscription::new(key, rx, cancel))
    }

    async fn close(&self) -> Result<()> {
        let Some(client) = self.client.lock().take() else {
            return Ok(());
        };
        self.closed.send_replace(true);
        drop(client);
        tracing::info!(endpoints = ?self.endpoints, "Closed etcd client");
        Ok(())
    }

    fn name(&self) -> String {
        let endpoints: Vec<String> = self.endpoints.iter().map(Endpoint::to_string).collect();
        format!("etcd:{}", endpoints.join(","))
    }
}
