//! Coordination session construction

use discovery_core::{DiscoveryConfig, DiscoveryError, Result};
use discovery_store::{CoordinationClient, MemoryStore};
use std::sync::Arc;
use tracing::warn;

/// Build the coordination client a process shares across its registrars and resolvers.
///
/// With no endpoints configured, an in-process store is used.
pub async fn connect(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationClient>> {
    if config.endpoints.is_empty() {
        warn!("No coordination store endpoints configured, using an in-process store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    connect_endpoints(config).await
}

#[cfg(feature = "etcd")]
async fn connect_endpoints(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationClient>> {
    let client = discovery_store::EtcdClient::connect(&config.endpoints, config.dial_timeout())
        .await
        .map_err(|e| DiscoveryError::store("connect", e))?;
    tracing::info!(endpoints = ?config.endpoints, "Connected to coordination store");
    Ok(Arc::new(client))
}

#[cfg(not(feature = "etcd"))]
async fn connect_endpoints(_config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationClient>> {
    Err(DiscoveryError::InvalidConfiguration(
        "coordination store endpoints require the `etcd` feature".to_string(),
    ))
}
