//! Coordination client abstraction over a distributed key-value store

use crate::StoreResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Store-wide change counter
pub type Revision = i64;

/// Store-assigned lease identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A granted lease and the TTL the store accepted for it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: i64,
}

/// Acknowledgement of a single lease renewal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    /// Remaining TTL in seconds after the renewal. Zero means the lease is gone.
    pub ttl: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Store revision the read was served at
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for delete events
    pub value: Vec<u8>,
    pub mod_revision: Revision,
}

/// A batch of watch events sharing one revision
#[derive(Clone, Debug, Default)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    /// Set when the store cancelled the watch because its start revision was compacted
    pub compact_revision: Option<Revision>,
}

/// Lease renewal acknowledgements. The stream ends when the lease can no longer be kept alive.
pub type KeepAliveStream = BoxStream<'static, KeepAliveResponse>;

/// Change notifications for a watched prefix. The stream ends when the watch is lost.
pub type WatchStream = BoxStream<'static, StoreResult<WatchResponse>>;

/// CoordinationClient exposes the store primitives used for registration and resolution.
///
/// A single client is safe for concurrent use by any number of registrars and
/// resolvers; leases and watches it hands out are owned by whoever requested them.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Grant a new lease with the given TTL in seconds
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease>;

    /// Start renewing a lease. Renewal requests are sent by the client on its own schedule.
    async fn keep_alive(&self, id: LeaseId) -> StoreResult<KeepAliveStream>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, id: LeaseId) -> StoreResult<()>;

    /// Write a key, optionally attached to a lease
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<Revision>;

    /// Delete a key, returning the number of keys removed
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Delete a key only while it is still attached to `lease`.
    ///
    /// Returns 0 when the key is missing or has been rewritten under another lease.
    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<u64>;

    /// Read every key under a prefix
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot>;

    /// Watch a prefix for changes with revision >= `start_revision`
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> StoreResult<WatchStream>;
}
