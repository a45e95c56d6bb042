//! etcd-backed coordination client

use crate::client::{
    CoordinationClient, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseId,
    Revision, Snapshot, WatchEvent, WatchResponse, WatchStream,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    TxnOpResponse, WatchOptions,
};
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// EtcdClient wraps an etcd connection for registration and resolution
#[derive(Clone)]
pub struct EtcdClient {
    client: Client,
}

impl EtcdClient {
    /// Connect to the given endpoints, failing if no endpoint answers within `dial_timeout`
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(dial_timeout)
            .with_timeout(dial_timeout);
        let client = time::timeout(dial_timeout, Client::connect(endpoints, Some(options)))
            .await
            .map_err(|_| StoreError::Timeout(dial_timeout))??;
        debug!(?endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then(|| LeaseId(kv.lease())),
    }
}

fn to_watch_response(response: &etcd_client::WatchResponse) -> WatchResponse {
    let revision = response.header().map(|h| h.revision()).unwrap_or_default();
    let events = response
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => EventKind::Put,
                EventType::Delete => EventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
        })
        .collect();
    let compact_revision = (response.compact_revision() > 0).then(|| response.compact_revision());
    WatchResponse {
        revision,
        events,
        compact_revision,
    }
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease> {
        let mut client = self.client.clone();
        let response = client.lease_grant(ttl, None).await?;
        Ok(Lease {
            id: LeaseId(response.id()),
            ttl: response.ttl(),
        })
    }

    async fn keep_alive(&self, id: LeaseId) -> StoreResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let ttl = client
            .lease_time_to_live(id.0, None)
            .await?
            .granted_ttl()
            .max(1);
        let (mut keeper, mut responses) = client.lease_keep_alive(id.0).await?;
        let period = Duration::from_millis((ttl as u64 * 1000 / 3).max(1));
        let (tx, rx) = mpsc::unbounded();

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease = %id, error = %e, "Failed to send lease keep-alive");
                    break;
                }
                match responses.message().await {
                    Ok(Some(response)) if response.ttl() > 0 => {
                        let ack = KeepAliveResponse {
                            id,
                            ttl: response.ttl(),
                        };
                        if tx.unbounded_send(ack).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        debug!(lease = %id, "Lease no longer exists");
                        break;
                    }
                    Err(e) => {
                        warn!(lease = %id, error = %e, "Lease keep-alive stream failed");
                        break;
                    }
                }
            }
        });

        Ok(rx.boxed())
    }

    async fn revoke_lease(&self, id: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(id.0).await?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<Revision> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id.0));
        let response = client.put(key, value, options).await?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut client = self.client.clone();
        let response = client.delete(key, None).await?;
        Ok(response.deleted().max(0) as u64)
    }

    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> StoreResult<u64> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::lease(key, CompareOp::Equal, lease.0)])
            .and_then([TxnOp::delete(key, None)]);
        let response = client.txn(txn).await?;
        if !response.succeeded() {
            debug!(key, lease = %lease, "Key no longer held by lease, not deleting");
            return Ok(0);
        }
        let deleted = response
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Delete(delete) => delete.deleted().max(0) as u64,
                _ => 0,
            })
            .sum();
        Ok(deleted)
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(Snapshot {
            revision: response.header().map(|h| h.revision()).unwrap_or_default(),
            kvs: response.kvs().iter().map(to_key_value).collect(),
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, responses) = client.watch(prefix, Some(options)).await?;

        // The watcher is carried in the stream state; dropping it cancels the watch.
        let stream = stream::unfold(
            Some((watcher, responses)),
            |state| async move {
                let (watcher, mut responses) = state?;
                match responses.message().await {
                    Ok(Some(response)) => {
                        let converted = to_watch_response(&response);
                        if response.canceled() && converted.compact_revision.is_none() {
                            return None;
                        }
                        let next = if converted.compact_revision.is_some() {
                            None
                        } else {
                            Some((watcher, responses))
                        };
                        Some((Ok(converted), next))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(StoreError::from(e)), None)),
                }
            },
        );
        Ok(stream.boxed())
    }
}
