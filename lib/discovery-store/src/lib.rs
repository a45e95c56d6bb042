//! Coordination store access for service discovery
//!
//! This library provides:
//! - The `CoordinationClient` trait over lease, key/value and watch primitives
//! - `MemoryStore`, a complete in-process store used for tests and local runs
//! - `EtcdClient`, an etcd-backed client (behind the `etcd` feature)

pub mod client;
pub mod error;
pub mod memory;
#[cfg(feature = "etcd")]
pub mod etcd;

pub use client::{
    CoordinationClient, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseId,
    Revision, Snapshot, WatchEvent, WatchResponse, WatchStream,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
#[cfg(feature = "etcd")]
pub use etcd::EtcdClient;
