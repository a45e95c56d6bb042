//! Lease-backed service registration
//!
//! A `Registrar` announces one instance record under a lease and keeps it
//! announced for as long as the returned `Registration` is held. The renewal
//! task moves through
//!
//! ```text
//! Unregistered -> Registering -> Active -> (KeepAliveLost -> Registering)* -> Closing -> Closed
//! ```
//!
//! Any keep-alive anomaly re-runs the full registration (new lease, record
//! rewritten), since the old record can no longer be assumed to exist.
//! Cancellation always takes precedence over a pending keep-alive loss.

use crate::DiscoveryMetrics;
use discovery_core::{codec, DiscoveryConfig, DiscoveryError, InstanceRecord, Result};
use discovery_store::{
    CoordinationClient, KeepAliveResponse, KeepAliveStream, Lease, LeaseId, StoreError,
    StoreResult,
};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

const MIN_RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Registrar configuration
#[derive(Clone, Debug)]
pub struct RegistrarConfig {
    /// Key namespace records are written under
    pub namespace: String,
    /// Upper bound for each individual store request
    pub request_timeout: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            namespace: "/services".to_string(),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&DiscoveryConfig> for RegistrarConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            request_timeout: config.dial_timeout(),
        }
    }
}

/// Lifecycle state of one registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    Registering,
    /// Record is written and the lease is being renewed
    Active(LeaseId),
    KeepAliveLost,
    Closing,
    Closed,
}

/// Registrar announces service instances through an injected coordination client
pub struct Registrar {
    client: Arc<dyn CoordinationClient>,
    config: RegistrarConfig,
    metrics: Option<DiscoveryMetrics>,
}

impl Registrar {
    pub fn new(client: Arc<dyn CoordinationClient>, config: RegistrarConfig) -> Self {
        Self {
            client,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `record` under a lease of `ttl` seconds and keep it registered.
    ///
    /// Returns once the record is written. Fails with `InvalidAddress`,
    /// `InvalidServiceName` or `InvalidTtl` for bad input, and with
    /// `StoreUnavailable` when the lease/put sequence cannot complete.
    pub async fn register(&self, record: InstanceRecord, ttl: i64) -> Result<Registration> {
        record.validate()?;
        if ttl < 1 {
            return Err(DiscoveryError::InvalidTtl(ttl));
        }

        let key = codec::build_key(&self.config.namespace, &record.name, &record.addr);
        let (state_tx, state_rx) = watch::channel(RegistrarState::Unregistered);
        let announcement = Announcement {
            client: self.client.clone(),
            value: codec::encode(&record)?,
            key: key.clone(),
            ttl,
            request_timeout: self.config.request_timeout,
            metrics: self.metrics.clone(),
            state: state_tx,
        };

        announcement.set_state(RegistrarState::Registering);
        let active = match announcement.announce().await {
            Ok(active) => active,
            Err(e) => {
                announcement.count_failure();
                error!(key = %key, error = %e, "Failed to register service instance");
                return Err(e);
            }
        };

        announcement.set_state(RegistrarState::Active(active.lease.id));
        if let Some(metrics) = &self.metrics {
            metrics.registrations_total.inc();
        }
        info!(
            service = %record.name,
            addr = %record.addr,
            lease = %active.lease.id,
            ttl,
            "Registered service instance"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(announcement.run(active, cancel_rx));

        Ok(Registration {
            key,
            cancel: Some(cancel_tx),
            state: state_rx,
            task: Some(task),
        })
    }
}

/// Handle to a live registration.
///
/// Cancelling, closing or dropping the handle unregisters the instance.
#[derive(Debug)]
#[must_use = "dropping a Registration unregisters the instance"]
pub struct Registration {
    key: String,
    cancel: Option<oneshot::Sender<()>>,
    state: watch::Receiver<RegistrarState>,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    /// Registration key the record is stored under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> RegistrarState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RegistrarState> {
        self.state.clone()
    }

    /// Lease currently backing the record, if any
    pub fn lease(&self) -> Option<LeaseId> {
        match self.state() {
            RegistrarState::Active(id) => Some(id),
            _ => None,
        }
    }

    /// Signal graceful unregistration without waiting for it
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Unregister and wait for the delete and revoke to finish
    pub async fn close(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "Registration task failed");
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Active {
    lease: Lease,
    keep_alive: KeepAliveStream,
}

enum Wake {
    Cancelled,
    KeepAlive(Option<KeepAliveResponse>),
    Retry,
}

enum Attempt {
    Registered(Active),
    Failed,
    Cancelled,
}

/// State owned by the background renewal task of one registration
struct Announcement {
    client: Arc<dyn CoordinationClient>,
    key: String,
    value: Vec<u8>,
    ttl: i64,
    request_timeout: Duration,
    metrics: Option<DiscoveryMetrics>,
    state: watch::Sender<RegistrarState>,
}

impl Announcement {
    fn set_state(&self, state: RegistrarState) {
        trace!(key = %self.key, ?state, "Registrar state changed");
        self.state.send_replace(state);
    }

    fn count_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.registration_failures_total.inc();
        }
    }

    fn retry_period(&self) -> Duration {
        (Duration::from_secs(self.ttl as u64) / 3).max(MIN_RETRY_PERIOD)
    }

    /// Delay before the next re-registration attempt after `failures` consecutive failures
    fn retry_delay(&self, failures: u32) -> Duration {
        let cap = Duration::from_secs(self.ttl as u64).max(self.retry_period());
        self.retry_period()
            .saturating_mul(1u32 << failures.min(16))
            .min(cap)
    }

    async fn request<T, F>(&self, op: &'static str, request: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(|e| DiscoveryError::store(op, e)),
            Err(_) => Err(DiscoveryError::store(
                op,
                StoreError::Timeout(self.request_timeout),
            )),
        }
    }

    /// Grant a lease, write the record under it, and start renewing it
    async fn announce(&self) -> Result<Active> {
        let lease = self
            .request("grant lease", self.client.grant_lease(self.ttl))
            .await?;

        let written = async {
            self.request(
                "put record",
                self.client.put(&self.key, self.value.clone(), Some(lease.id)),
            )
            .await?;
            self.request("keep alive", self.client.keep_alive(lease.id))
                .await
        }
        .await;

        match written {
            Ok(keep_alive) => Ok(Active { lease, keep_alive }),
            Err(e) => {
                self.revoke(lease.id).await;
                Err(e)
            }
        }
    }

    async fn revoke(&self, id: LeaseId) {
        if let Err(e) = self
            .request("revoke lease", self.client.revoke_lease(id))
            .await
        {
            warn!(key = %self.key, lease = %id, error = %e, "Failed to revoke lease");
        }
    }

    /// One re-registration attempt, abandoned as soon as cancellation arrives
    async fn reregister(&self, cancel: &mut oneshot::Receiver<()>) -> Attempt {
        self.set_state(RegistrarState::Registering);
        let result = tokio::select! {
            biased;
            _ = cancel => return Attempt::Cancelled,
            result = self.announce() => result,
        };

        match result {
            Ok(active) => {
                self.set_state(RegistrarState::Active(active.lease.id));
                if let Some(metrics) = &self.metrics {
                    metrics.reregistrations_total.inc();
                }
                info!(key = %self.key, lease = %active.lease.id, "Re-registered service instance");
                Attempt::Registered(active)
            }
            Err(e) => {
                self.count_failure();
                warn!(key = %self.key, error = %e, "Re-registration failed, will retry");
                Attempt::Failed
            }
        }
    }

    async fn run(self, initial: Active, mut cancel: oneshot::Receiver<()>) {
        let mut active = Some(initial);
        // Lease replaced by a re-registration, revoked once the record is rewritten
        let mut superseded: Option<LeaseId> = None;
        let mut failures = 0u32;
        let mut retry_at = Instant::now();

        loop {
            let wake = tokio::select! {
                biased;
                _ = &mut cancel => Wake::Cancelled,
                response = next_keep_alive(&mut active) => Wake::KeepAlive(response),
                _ = time::sleep_until(retry_at), if active.is_none() => Wake::Retry,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::KeepAlive(Some(response)) if response.ttl > 0 => {
                    trace!(
                        key = %self.key,
                        lease = %response.id,
                        ttl = response.ttl,
                        "Lease renewed"
                    );
                    continue;
                }
                Wake::KeepAlive(_) => {
                    let lost = active.take().map(|a| a.lease.id);
                    let reason = DiscoveryError::LeaseLost(format!(
                        "keep-alive stream for {} ended",
                        self.key
                    ));
                    warn!(error = %reason, "Keep-alive lost, re-registering");
                    self.set_state(RegistrarState::KeepAliveLost);
                    superseded = superseded.or(lost);
                }
                Wake::Retry => {}
            }

            match self.reregister(&mut cancel).await {
                Attempt::Cancelled => break,
                Attempt::Registered(renewed) => {
                    active = Some(renewed);
                    failures = 0;
                    if let Some(old) = superseded.take() {
                        self.revoke(old).await;
                    }
                }
                Attempt::Failed => {
                    retry_at = Instant::now() + self.retry_delay(failures);
                    failures = failures.saturating_add(1);
                }
            }
        }

        self.shutdown(active.map(|a| a.lease.id), superseded).await;
    }

    /// Best-effort delete and revoke; the lease TTL covers anything that fails here.
    ///
    /// The record is only deleted while one of our own leases still holds it, so
    /// a newer registration of the same instance keeps its entry.
    async fn shutdown(&self, lease: Option<LeaseId>, superseded: Option<LeaseId>) {
        self.set_state(RegistrarState::Closing);

        let owned: Vec<LeaseId> = lease.into_iter().chain(superseded).collect();
        for &id in &owned {
            let deleted = self
                .request("delete record", self.client.delete_if_lease(&self.key, id))
                .await;
            match deleted {
                Ok(0) => debug!(key = %self.key, lease = %id, "Record not held by lease"),
                Ok(_) => debug!(key = %self.key, lease = %id, "Deleted service record"),
                Err(e) => warn!(key = %self.key, error = %e, "Failed to delete service record"),
            }
        }
        for id in owned {
            self.revoke(id).await;
        }

        self.set_state(RegistrarState::Closed);
        info!(key = %self.key, "Unregistered service instance");
    }
}

async fn next_keep_alive(active: &mut Option<Active>) -> Option<KeepAliveResponse> {
    match active {
        Some(active) => active.keep_alive.next().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_store::MemoryStore;

    fn registrar(store: &MemoryStore) -> Registrar {
        Registrar::new(Arc::new(store.clone()), RegistrarConfig::default())
    }

    async fn wait_for_state<F>(
        rx: &mut watch::Receiver<RegistrarState>,
        predicate: F,
    ) -> RegistrarState
    where
        F: FnMut(&RegistrarState) -> bool,
    {
        let state = time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for registrar state")
            .expect("registrar state channel closed");
        *state
    }

    async fn stored_records(store: &MemoryStore) -> Vec<InstanceRecord> {
        store
            .get_prefix("/services/user/")
            .await
            .unwrap()
            .kvs
            .iter()
            .map(|kv| codec::decode(&kv.value).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);

        let err = registrar
            .register(InstanceRecord::new("user", ":9000"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidAddress(_)));

        let err = registrar
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidTtl(0)));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_fails_fast_when_store_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::StoreUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_register_writes_record_under_lease() {
        let store = MemoryStore::new();
        let record = InstanceRecord::new("user", "127.0.0.1:9000");
        let registration = registrar(&store).register(record.clone(), 10).await.unwrap();

        assert_eq!(registration.key(), "/services/user/127.0.0.1:9000");
        let lease = registration.lease().expect("registration should be active");
        let snapshot = store.get_prefix("/services/user/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].lease, Some(lease));
        assert_eq!(codec::decode(&snapshot.kvs[0].value).unwrap(), record);

        registration.close().await;
    }

    #[tokio::test]
    async fn test_close_deletes_record_and_revokes_lease() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 10)
            .await
            .unwrap();
        let mut state = registration.subscribe_state();

        registration.close().await;
        assert_eq!(*state.borrow_and_update(), RegistrarState::Closed);
        assert!(stored_records(&store).await.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 10)
            .await
            .unwrap();
        let mut state = registration.subscribe_state();

        drop(registration);
        wait_for_state(&mut state, |s| *s == RegistrarState::Closed).await;
        assert!(stored_records(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_same_pair_registered_twice_has_one_entry() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        let record = InstanceRecord::new("user", "127.0.0.1:9000");

        let first = registrar.register(record.clone(), 10).await.unwrap();
        let second = registrar.register(record.clone(), 10).await.unwrap();
        assert_ne!(first.lease(), second.lease());

        let snapshot = store.get_prefix("/services/user/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].lease, second.lease());

        second.close().await;
        first.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_overwritten_registration_keeps_newer_record() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        let record = InstanceRecord::new("user", "127.0.0.1:9000");

        let first = registrar.register(record.clone(), 10).await.unwrap();
        let second = registrar.register(record.clone(), 10).await.unwrap();
        let owner = second.lease();

        first.close().await;
        time::sleep(Duration::from_secs(30)).await;

        let snapshot = store.get_prefix("/services/user/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(snapshot.kvs[0].lease, owner);
        assert_eq!(second.lease(), owner);
        assert_eq!(store.lease_count(), 1);

        second.close().await;
        assert!(stored_records(&store).await.is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pending_keep_alive_loss() {
        let store = MemoryStore::new();
        let metrics = DiscoveryMetrics::new().unwrap();
        let key = "/services/user/127.0.0.1:9000".to_string();
        let lease = store.grant_lease(10).await.unwrap();
        store.put(&key, b"{}".to_vec(), Some(lease.id)).await.unwrap();

        let (state, mut state_rx) = watch::channel(RegistrarState::Active(lease.id));
        let announcement = Announcement {
            client: Arc::new(store.clone()),
            key,
            value: b"{}".to_vec(),
            ttl: 10,
            request_timeout: Duration::from_secs(3),
            metrics: Some(metrics.clone()),
            state,
        };
        // Keep-alive stream already ended and cancellation already sent
        let active = Active {
            lease,
            keep_alive: futures::stream::empty().boxed(),
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while state_rx.changed().await.is_ok() {
                seen.push(*state_rx.borrow_and_update());
            }
            seen
        });
        announcement.run(active, cancel_rx).await;

        let seen = observer.await.unwrap();
        assert!(!seen.contains(&RegistrarState::Registering));
        assert!(!seen.contains(&RegistrarState::KeepAliveLost));
        assert_eq!(seen.last(), Some(&RegistrarState::Closed));
        assert_eq!(metrics.reregistrations_total.get(), 0);
        assert_eq!(metrics.registration_failures_total.get(), 0);
        assert_eq!(store.lease_count(), 0);
        // Only the original lease was ever granted
        assert_eq!(store.grant_lease(10).await.unwrap().id, LeaseId(lease.id.0 + 1));
        assert!(stored_records(&store).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_after_keep_alive_loss() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 3)
            .await
            .unwrap();
        let first = registration.lease().unwrap();
        let mut state = registration.subscribe_state();

        store.sever_keep_alives();
        let renewed = wait_for_state(&mut state, |s| {
            matches!(s, RegistrarState::Active(id) if *id != first)
        })
        .await;
        time::sleep(Duration::from_millis(10)).await;

        let snapshot = store.get_prefix("/services/user/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 1);
        assert_eq!(Some(snapshot.kvs[0].lease.unwrap()), registration.lease());
        assert_eq!(RegistrarState::Active(snapshot.kvs[0].lease.unwrap()), renewed);
        // The superseded lease is revoked once the record is rewritten
        assert_eq!(store.lease_count(), 1);

        // Still discoverable well past the original TTL
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stored_records(&store).await.len(), 1);

        registration.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_after_lease_expiry() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 3)
            .await
            .unwrap();
        let first = registration.lease().unwrap();
        let mut state = registration.subscribe_state();

        assert!(store.expire_lease(first));
        wait_for_state(&mut state, |s| {
            matches!(s, RegistrarState::Active(id) if *id != first)
        })
        .await;
        assert_eq!(stored_records(&store).await.len(), 1);

        registration.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_outage_longer_than_ttl() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 2)
            .await
            .unwrap();
        let mut state = registration.subscribe_state();

        store.set_available(false);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.lease_count(), 0);
        assert!(registration.lease().is_none());

        store.set_available(true);
        wait_for_state(&mut state, |s| matches!(s, RegistrarState::Active(_))).await;
        assert_eq!(stored_records(&store).await.len(), 1);

        registration.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_store_unavailable() {
        let store = MemoryStore::new();
        let registration = registrar(&store)
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 2)
            .await
            .unwrap();
        let mut state = registration.subscribe_state();

        store.set_available(false);
        wait_for_state(&mut state, |s| {
            matches!(s, RegistrarState::KeepAliveLost | RegistrarState::Registering)
        })
        .await;

        time::timeout(Duration::from_secs(30), registration.close())
            .await
            .expect("close should not hang on an unavailable store");
        assert_eq!(*state.borrow(), RegistrarState::Closed);
    }

    #[test]
    fn test_retry_delay_is_bounded_by_ttl() {
        let (state, _) = watch::channel(RegistrarState::Unregistered);
        let announcement = Announcement {
            client: Arc::new(NeverClient),
            key: "/services/user/127.0.0.1:9000".to_string(),
            value: Vec::new(),
            ttl: 9,
            request_timeout: Duration::from_secs(3),
            metrics: None,
            state,
        };
        assert_eq!(announcement.retry_delay(0), Duration::from_secs(3));
        assert_eq!(announcement.retry_delay(1), Duration::from_secs(6));
        assert_eq!(announcement.retry_delay(2), Duration::from_secs(9));
        assert_eq!(announcement.retry_delay(40), Duration::from_secs(9));
    }

    struct NeverClient;

    #[async_trait::async_trait]
    impl CoordinationClient for NeverClient {
        async fn grant_lease(&self, _ttl: i64) -> StoreResult<Lease> {
            futures::future::pending().await
        }
        async fn keep_alive(&self, _id: LeaseId) -> StoreResult<KeepAliveStream> {
            futures::future::pending().await
        }
        async fn revoke_lease(&self, _id: LeaseId) -> StoreResult<()> {
            futures::future::pending().await
        }
        async fn put(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _lease: Option<LeaseId>,
        ) -> StoreResult<i64> {
            futures::future::pending().await
        }
        async fn delete(&self, _key: &str) -> StoreResult<u64> {
            futures::future::pending().await
        }
        async fn delete_if_lease(&self, _key: &str, _lease: LeaseId) -> StoreResult<u64> {
            futures::future::pending().await
        }
        async fn get_prefix(&self, _prefix: &str) -> StoreResult<discovery_store::Snapshot> {
            futures::future::pending().await
        }
        async fn watch_prefix(
            &self,
            _prefix: &str,
            _start: i64,
        ) -> StoreResult<discovery_store::WatchStream> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_times_out_on_hung_store() {
        let registrar = Registrar::new(Arc::new(NeverClient), RegistrarConfig::default());
        let err = registrar
            .register(InstanceRecord::new("user", "127.0.0.1:9000"), 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::StoreUnavailable {
                source: StoreError::Timeout(_),
                ..
            }
        ));
    }
}
