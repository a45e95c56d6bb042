//! In-process coordination store
//!
//! `MemoryStore` keeps the same observable contract as a real store: every
//! mutation bumps a global revision, keys attached to a lease are evicted when
//! the lease expires, and watches can be replayed from any revision that has
//! not been compacted. It also exposes fault injection hooks so callers can
//! exercise session loss, dropped keep-alives, and compaction.

use crate::client::{
    CoordinationClient, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseId,
    Revision, Snapshot, WatchEvent, WatchResponse, WatchStream,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Revisions of watch history kept before older events are compacted away
pub const HISTORY_RETENTION: Revision = 10_000;

/// MemoryStore is a cheaply cloneable handle to a shared in-process store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct StoredValue {
    value: Vec<u8>,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: UnboundedSender<StoreResult<WatchResponse>>,
}

struct State {
    revision: Revision,
    compact_revision: Revision,
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
    next_lease: i64,
    available: bool,
    // Bumped on every simulated session loss; renewal tasks from an older epoch stop.
    session_epoch: u64,
}

impl State {
    fn check_available(&self) -> StoreResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    /// Record a batch of events sharing one revision and fan it out to watchers
    fn publish(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        self.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            let response = WatchResponse {
                revision,
                events: matching,
                compact_revision: None,
            };
            watcher.tx.unbounded_send(Ok(response)).is_ok()
        });
        self.history.extend(events);

        // Open watchers have already been sent everything; only late starters see compaction
        let floor = revision - HISTORY_RETENTION;
        if floor > self.compact_revision {
            self.discard_history(floor);
        }
    }

    fn discard_history(&mut self, revision: Revision) {
        self.compact_revision = self.compact_revision.max(revision);
        let retained = self.history.partition_point(|e| e.mod_revision < revision);
        self.history.drain(..retained);
    }

    /// Delete one key in its own revision, returning the number of keys removed
    fn remove_key(&mut self, key: &str) -> u64 {
        let Some(previous) = self.kvs.remove(key) else {
            return 0;
        };
        self.detach_from_lease(key, previous.lease);
        let revision = self.next_revision();
        self.publish(
            revision,
            vec![WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                mod_revision: revision,
            }],
        );
        1
    }

    fn detach_from_lease(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(lease) = lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
    }

    /// Drop a lease and delete its keys in a single revision
    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if lease.keys.is_empty() {
            return true;
        }

        let revision = self.next_revision();
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            if self.kvs.get(&key).map(|v| v.lease) == Some(Some(id)) {
                self.kvs.remove(&key);
                events.push(WatchEvent {
                    kind: EventKind::Delete,
                    key,
                    value: Vec::new(),
                    mod_revision: revision,
                });
            }
        }
        self.publish(revision, events);
        true
    }
}

impl MemoryStore {
    /// Create an empty store. Must be called from within a Tokio runtime, since
    /// lease expiry runs on a background task.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                revision: 1,
                compact_revision: 0,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                history: Vec::new(),
                watchers: Vec::new(),
                next_lease: 1,
                available: true,
                session_epoch: 0,
            }),
        });
        tokio::spawn(reap_expired_leases(Arc::downgrade(&shared)));
        Self { shared }
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.shared.lock().revision
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.shared.lock().leases.len()
    }

    /// Take the store offline or bring it back.
    ///
    /// Going offline fails every request, ends every open watch with an error,
    /// and stops every keep-alive stream. Leases keep ticking toward expiry.
    pub fn set_available(&self, available: bool) {
        let mut state = self.shared.lock();
        state.available = available;
        if !available {
            state.session_epoch += 1;
            for watcher in state.watchers.drain(..) {
                let _ = watcher.tx.unbounded_send(Err(StoreError::Unavailable(
                    "session closed".to_string(),
                )));
            }
        }
        debug!(available, "memory store availability changed");
    }

    /// End every keep-alive stream without touching the leases themselves
    pub fn sever_keep_alives(&self) {
        self.shared.lock().session_epoch += 1;
    }

    /// End every open watch stream
    pub fn close_watches(&self) {
        self.shared.lock().watchers.clear();
    }

    /// Expire a lease immediately, as if its TTL had run out
    pub fn expire_lease(&self, id: LeaseId) -> bool {
        self.shared.lock().remove_lease(id)
    }

    /// Discard history before `revision`.
    ///
    /// Open watches are cancelled with a compaction notice, the way a store
    /// treats watchers that fell behind the compacted revision.
    pub fn compact(&self, revision: Revision) {
        let mut state = self.shared.lock();
        let revision = revision.min(state.revision);
        state.discard_history(revision);
        let current = state.revision;
        let compacted = state.compact_revision;
        for watcher in state.watchers.drain(..) {
            let _ = watcher.tx.unbounded_send(Ok(WatchResponse {
                revision: current,
                events: Vec::new(),
                compact_revision: Some(compacted),
            }));
        }
        debug!(revision = compacted, "memory store compacted");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_expired_leases(shared: Weak<Shared>) {
    let mut ticker = time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.lock();
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = %id, "lease expired");
            state.remove_lease(id);
        }
    }
}

/// Renew a lease every third of its TTL until the lease, the session, or the receiver goes away
async fn renew_lease(
    shared: Weak<Shared>,
    id: LeaseId,
    period: Duration,
    epoch: u64,
    tx: UnboundedSender<KeepAliveResponse>,
) {
    let mut ticker = time::interval(period);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let response = {
            let mut state = shared.lock();
            if !state.available || state.session_epoch != epoch {
                break;
            }
            let Some(lease) = state.leases.get_mut(&id) else {
                break;
            };
            lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
            KeepAliveResponse { id, ttl: lease.ttl }
        };
        trace!(lease = %id, "lease renewed");
        if tx.unbounded_send(response).is_err() {
            break;
        }
    }
    debug!(lease = %id, "keep-alive stream closed");
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease> {
        let mut state = self.shared.lock();
        state.check_available()?;
        let ttl = ttl.max(1);
        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn keep_alive(&self, id: LeaseId) -> StoreResult<KeepAliveStream> {
        let (ttl, epoch) = {
            let state = self.shared.lock();
            state.check_available()?;
            let lease = state.leases.get(&id).ok_or(StoreError::LeaseNotFound(id))?;
            (lease.ttl, state.session_epoch)
        };
        let period = Duration::from_millis((ttl as u64 * 1000 / 3).max(1));
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(renew_lease(
            Arc::downgrade(&self.shared),
            id,
            period,
            epoch,
            tx,
        ));
        Ok(rx.boxed())
    }

    async fn revoke_lease(&self, id: LeaseId) -> StoreResult<()> {
        let mut state = self.shared.lock();
        state.check_available()?;
        if state.remove_lease(id) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(id))
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<Revision> {
        let mut state = self.shared.lock();
        state.check_available()?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let revision = state.next_revision();
        let previous = state.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );
        if let Some(previous) = previous {
            if previous.lease != lease {
                state.detach_from_lease(key, previous.lease);
            }
        }
        if let Some(lease) = lease.and_then(|id| state.leases.get_mut(&id)) {
            lease.keys.insert(key.to_string());
        }

        state.publish(
            revision,
            vec![WatchEvent {
                kind: EventKind::Put,
                key: key.to_string(),
                value,
                mod_revision: revision,
            }],
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.shared.lock();
        state.check_available()?;
        Ok(state.remove_key(key))
    }

    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<u64> {
        let mut state = self.shared.lock();
        state.check_available()?;
        let owned = state
            .kvs
            .get(key)
            .is_some_and(|stored| stored.lease == Some(lease));
        if owned {
            Ok(state.remove_key(key))
        } else {
            Ok(0)
        }
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot> {
        let state = self.shared.lock();
        state.check_available()?;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
                lease: stored.lease,
            })
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            kvs,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> StoreResult<WatchStream> {
        let mut state = self.shared.lock();
        state.check_available()?;

        if start_revision > 0 && start_revision < state.compact_revision {
            let notice = WatchResponse {
                revision: state.revision,
                events: Vec::new(),
                compact_revision: Some(state.compact_revision),
            };
            return Ok(stream::iter([Ok(notice)]).boxed());
        }

        let (tx, rx) = mpsc::unbounded();

        // Replay retained history, one response per revision
        let mut pending: BTreeMap<Revision, Vec<WatchEvent>> = BTreeMap::new();
        for event in state
            .history
            .iter()
            .filter(|e| e.mod_revision >= start_revision && e.key.starts_with(prefix))
        {
            pending.entry(event.mod_revision).or_default().push(event.clone());
        }
        for (revision, events) in pending {
            let _ = tx.unbounded_send(Ok(WatchResponse {
                revision,
                events,
                compact_revision: None,
            }));
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_response(stream: &mut WatchStream) -> WatchResponse {
        stream
            .next()
            .await
            .expect("watch stream ended")
            .expect("watch stream error")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/svc/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("/svc/a/2", b"two".to_vec(), None).await.unwrap();
        store.put("/svc/ab/3", b"three".to_vec(), None).await.unwrap();

        let snapshot = store.get_prefix("/svc/a/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 2);
        assert_eq!(snapshot.revision, store.revision());

        assert_eq!(store.delete("/svc/a/1").await.unwrap(), 1);
        assert_eq!(store.delete("/svc/a/1").await.unwrap(), 0);
        assert_eq!(store.get_prefix("/svc/a/").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/k", Vec::new(), Some(LeaseId(42))).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(LeaseId(42))));
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(lease.id)).await.unwrap();
        store.put("/svc/a/2", b"y".to_vec(), None).await.unwrap();

        store.revoke_lease(lease.id).await.unwrap();
        let snapshot = store.get_prefix("/svc/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].key, "/svc/a/2");
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_overwrite_moves_key_to_new_lease() {
        let store = MemoryStore::new();
        let old = store.grant_lease(10).await.unwrap();
        let new = store.grant_lease(10).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(old.id)).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(new.id)).await.unwrap();

        store.revoke_lease(old.id).await.unwrap();
        assert_eq!(store.get_prefix("/svc/").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_if_lease_spares_rewritten_key() {
        let store = MemoryStore::new();
        let old = store.grant_lease(10).await.unwrap();
        let new = store.grant_lease(10).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(old.id)).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(new.id)).await.unwrap();

        assert_eq!(store.delete_if_lease("/svc/a/1", old.id).await.unwrap(), 0);
        let snapshot = store.get_prefix("/svc/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].lease, Some(new.id));

        assert_eq!(store.delete_if_lease("/svc/a/1", new.id).await.unwrap(), 1);
        assert!(store.get_prefix("/svc/").await.unwrap().kvs.is_empty());
        assert_eq!(store.delete_if_lease("/svc/a/1", new.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_is_compacted_past_retention() {
        let store = MemoryStore::new();
        let first = store.put("/svc/a/1", b"x".to_vec(), None).await.unwrap();
        let mut live = store.watch_prefix("/svc/a/", first + 1).await.unwrap();

        for _ in 0..HISTORY_RETENTION + 10 {
            store.put("/svc/a/2", b"y".to_vec(), None).await.unwrap();
        }
        let latest = store.revision();
        assert!(store.shared.lock().history.len() <= (HISTORY_RETENTION + 1) as usize);

        // A late watch from before the retained window is told to resync
        let mut late = store.watch_prefix("/svc/a/", first).await.unwrap();
        let notice = next_response(&mut late).await;
        assert!(notice.compact_revision.is_some());

        // A watch that kept up is unaffected
        let mut last = 0;
        while last < latest {
            let response = next_response(&mut live).await;
            assert!(response.compact_revision.is_none());
            last = response.revision;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keep_alive() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(lease.id)).await.unwrap();

        time::sleep(Duration::from_millis(2500)).await;
        assert!(store.get_prefix("/svc/").await.unwrap().kvs.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_holds_lease() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(lease.id)).await.unwrap();
        let mut keep_alive = store.keep_alive(lease.id).await.unwrap();

        for _ in 0..10 {
            let response = keep_alive.next().await.expect("keep-alive ended");
            assert_eq!(response.id, lease.id);
            assert_eq!(response.ttl, 2);
        }
        assert_eq!(store.get_prefix("/svc/").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sever_keep_alives_ends_stream() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(3).await.unwrap();
        let mut keep_alive = store.keep_alive(lease.id).await.unwrap();
        assert!(keep_alive.next().await.is_some());

        store.sever_keep_alives();
        assert!(keep_alive.next().await.is_none());
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = MemoryStore::new();
        let first = store.put("/svc/a/1", b"x".to_vec(), None).await.unwrap();
        store.put("/svc/b/1", b"y".to_vec(), None).await.unwrap();
        store.delete("/svc/a/1").await.unwrap();

        let mut watch = store.watch_prefix("/svc/a/", first).await.unwrap();
        let put = next_response(&mut watch).await;
        assert_eq!(put.revision, first);
        assert_eq!(put.events[0].kind, EventKind::Put);
        let delete = next_response(&mut watch).await;
        assert_eq!(delete.events[0].kind, EventKind::Delete);
        assert_eq!(delete.events[0].key, "/svc/a/1");
    }

    #[tokio::test]
    async fn test_revoke_batches_deletes_in_one_revision() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/svc/a/1", b"x".to_vec(), Some(lease.id)).await.unwrap();
        store.put("/svc/a/2", b"y".to_vec(), Some(lease.id)).await.unwrap();
        let mut watch = store
            .watch_prefix("/svc/a/", store.revision() + 1)
            .await
            .unwrap();

        store.revoke_lease(lease.id).await.unwrap();
        let response = next_response(&mut watch).await;
        assert_eq!(response.events.len(), 2);
        assert!(response.events.iter().all(|e| e.kind == EventKind::Delete));
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision() {
        let store = MemoryStore::new();
        let first = store.put("/svc/a/1", b"x".to_vec(), None).await.unwrap();
        store.put("/svc/a/2", b"y".to_vec(), None).await.unwrap();
        let latest = store.revision();
        store.compact(latest);

        let mut watch = store.watch_prefix("/svc/a/", first).await.unwrap();
        let response = next_response(&mut watch).await;
        assert_eq!(response.compact_revision, Some(latest));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_store_fails_requests_and_ends_watches() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/svc/", 0).await.unwrap();

        store.set_available(false);
        assert!(matches!(watch.next().await, Some(Err(StoreError::Unavailable(_)))));
        assert!(watch.next().await.is_none());
        assert!(store.get_prefix("/svc/").await.is_err());
        assert!(store.grant_lease(5).await.is_err());

        store.set_available(true);
        assert!(store.get_prefix("/svc/").await.is_ok());
    }
}
