//! Watch-based client-side service resolution
//!
//! A resolver seeds its address set with a bulk read of the service prefix,
//! then follows a watch started just after the read's revision. Every applied
//! watch response publishes the full address list; consumers replace their
//! route table wholesale rather than patching it.
//!
//! When the watch is lost (stream closed, store error, or compaction) the
//! resolver rebuilds its state from scratch: a fresh bulk read replaces the
//! address set and a new watch starts from the new baseline. Until that
//! succeeds, the last published list stays in place.

use crate::DiscoveryMetrics;
use discovery_core::record::validate_service_name;
use discovery_core::{codec, AddressSet, DiscoveryConfig, DiscoveryError, Result};
use discovery_store::{CoordinationClient, StoreError, StoreResult, WatchResponse, WatchStream};
use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Resolver configuration
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Key namespace registrations live under
    pub namespace: String,
    /// Upper bound for each individual store request
    pub request_timeout: Duration,
    /// First delay between failed resync attempts
    pub initial_backoff: Duration,
    /// Longest delay between failed resync attempts
    pub max_backoff: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            namespace: "/services".to_string(),
            request_timeout: Duration::from_secs(3),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&DiscoveryConfig> for ResolverConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            request_timeout: config.dial_timeout(),
            ..Self::default()
        }
    }
}

/// Resolver opens address subscriptions through an injected coordination client
pub struct Resolver {
    client: Arc<dyn CoordinationClient>,
    config: ResolverConfig,
    metrics: Option<DiscoveryMetrics>,
}

impl Resolver {
    pub fn new(client: Arc<dyn CoordinationClient>, config: ResolverConfig) -> Self {
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

    /// Start resolving `service`.
    ///
    /// Returns once the initial address list is published. Fails with
    /// `StoreUnavailable` if the initial read or watch cannot be established.
    pub async fn open(&self, service: &str) -> Result<ResolverHandle> {
        validate_service_name(service)?;

        let prefix = codec::service_prefix(&self.config.namespace, service);
        let (publisher, addresses) = watch::channel(Vec::new());
        let mut watch_loop = WatchLoop {
            client: self.client.clone(),
            service: service.to_string(),
            set: AddressSet::new(prefix.clone()),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            publisher,
        };

        let (set, stream) = watch_loop.bootstrap().await?;
        watch_loop.set = set;
        watch_loop.publish();
        info!(
            service = %service,
            prefix = %prefix,
            instances = watch_loop.set.len(),
            "Resolver opened"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(watch_loop.run(stream, shutdown_rx));

        Ok(ResolverHandle {
            service: service.to_string(),
            addresses,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Handle to an open resolver. Closing or dropping it stops the watch loop.
#[derive(Debug)]
pub struct ResolverHandle {
    service: String,
    addresses: watch::Receiver<Vec<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ResolverHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Subscribe to the full address list, republished on every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.addresses.clone()
    }

    /// Current address list, sorted
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.borrow().clone()
    }

    /// Stop the watch loop and wait for it to exit. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(service = %self.service, error = %e, "Resolver task failed");
            }
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// State owned by the background watch task of one resolver
struct WatchLoop {
    client: Arc<dyn CoordinationClient>,
    service: String,
    set: AddressSet,
    config: ResolverConfig,
    metrics: Option<DiscoveryMetrics>,
    publisher: watch::Sender<Vec<String>>,
}

impl WatchLoop {
    async fn request<T, F>(&self, op: &'static str, request: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.config.request_timeout;
        match time::timeout(timeout, request).await {
            Ok(result) => result.map_err(|e| DiscoveryError::store(op, e)),
            Err(_) => Err(DiscoveryError::store(op, StoreError::Timeout(timeout))),
        }
    }

    /// Read the whole prefix and open a watch right after the read's revision
    async fn bootstrap(&self) -> Result<(AddressSet, WatchStream)> {
        let prefix = self.set.prefix();
        let snapshot = self
            .request("read prefix", self.client.get_prefix(prefix))
            .await?;

        let (set, failures) = AddressSet::from_kvs(prefix, &snapshot.kvs);
        for (key, error) in failures {
            self.count_decode_error();
            warn!(
                service = %self.service,
                key = %key,
                error = %error,
                "Skipping undecodable instance record"
            );
        }

        let stream = self
            .request(
                "watch prefix",
                self.client.watch_prefix(prefix, snapshot.revision + 1),
            )
            .await?;
        debug!(service = %self.service, revision = snapshot.revision, "Watch established");
        Ok((set, stream))
    }

    fn count_decode_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.decode_errors_total.inc();
        }
    }

    /// Publish the full address list if it changed
    fn publish(&self) {
        let addresses = self.set.addresses();
        if let Some(metrics) = &self.metrics {
            metrics
                .resolved_addresses
                .with_label_values(&[self.service.as_str()])
                .set(addresses.len() as i64);
        }
        self.publisher.send_if_modified(|current| {
            if *current == addresses {
                false
            } else {
                debug!(service = %self.service, addresses = ?addresses, "Publishing address list");
                *current = addresses;
                true
            }
        });
    }

    /// Apply every event of one response before anything is published
    fn apply(&mut self, response: &WatchResponse) {
        for event in &response.events {
            if let Err(e) = self.set.apply(event) {
                self.count_decode_error();
                warn!(
                    service = %self.service,
                    key = %event.key,
                    revision = response.revision,
                    error = %e,
                    "Ignoring undecodable instance record"
                );
            }
        }
    }

    async fn run(mut self, mut stream: WatchStream, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let item = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(response)) => match response.compact_revision {
                    None => {
                        self.apply(&response);
                        self.publish();
                        continue;
                    }
                    Some(compacted) => {
                        warn!(
                            service = %self.service,
                            compact_revision = compacted,
                            "Watched revision compacted, resyncing"
                        );
                    }
                },
                Some(Err(e)) => {
                    warn!(service = %self.service, error = %e, "Watch failed, resyncing");
                }
                None => {
                    warn!(service = %self.service, "Watch channel closed, resyncing");
                }
            }

            match self.resync(&mut shutdown).await {
                Some(renewed) => stream = renewed,
                None => break,
            }
        }
        debug!(service = %self.service, "Resolver closed");
    }

    /// Rebuild the address set from a fresh read. Returns `None` if shut down first.
    async fn resync(&mut self, shutdown: &mut oneshot::Receiver<()>) -> Option<WatchStream> {
        if let Some(metrics) = &self.metrics {
            metrics.resyncs_total.inc();
        }

        let mut backoff = self.config.initial_backoff;
        loop {
            let result = tokio::select! {
                biased;
                _ = &mut *shutdown => return None,
                result = self.bootstrap() => result,
            };

            match result {
                Ok((set, stream)) => {
                    self.set = set;
                    self.publish();
                    info!(service = %self.service, instances = self.set.len(), "Resolver resynced");
                    return Some(stream);
                }
                Err(e) => {
                    let delay = with_jitter(backoff);
                    warn!(
                        service = %self.service,
                        error = %e,
                        retry_in = ?delay,
                        "Resync failed, keeping last known addresses"
                    );
                    tokio::select! {
                        biased;
                        _ = &mut *shutdown => return None,
                        _ = time::sleep(delay) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.config.max_backoff);
                }
            }
        }
    }
}

/// Spread retries of many resolvers by up to a quarter of the delay
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
