//! Coordination store clients.

mod coordination_store;
mod memory;

#[cfg(feature = "etcd")]
mod etcd;

pub use coordination_store::{
    CancelHandle, CoordinationStore, KeyValue, StoreEvent, StoreEventKind, Subscription,
};
pub(crate) use coordination_store::bounded;
pub use memory::{MemoryCluster, MemoryStore};

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
