//! Events delivered to the update callback.

use crate::store::{StoreEvent, StoreEventKind};

/// Kind of change observed on the signal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// The signal key was written
    Put,
    /// The signal key was deleted
    Delete,
}

/// A change on the signal key, as handed to the update callback.
///
/// Receivers should treat any event as "reload the whole policy"; the value
/// carries no meaning beyond being different from the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened to the key
    pub kind: WatchEventKind,
    /// The signal key
    pub key: String,
    /// Value written by the publisher (empty for deletes)
    pub value: String,
    /// Store revision of the change
    pub revision: i64,
}

impl WatchEvent {
    /// Convert a raw store event, dropping kinds other than put and delete.
    pub fn from_store(event: StoreEvent) -> Option<Self> {
        let kind = match event.kind {
            StoreEventKind::Put => WatchEventKind::Put,
            StoreEventKind::Delete => WatchEventKind::Delete,
            StoreEventKind::Other(_) => return None,
        };

        Some(Self {
            kind,
            key: event.key,
            value: event.value,
            revision: event.revision,
        })
    }
}
