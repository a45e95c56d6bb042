//! Route table fed by resolver address lists

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// RouteTable holds the current address list of every resolved service.
///
/// Each update replaces a service's list wholesale.
pub struct RouteTable {
    routes: RwLock<HashMap<String, Arc<Vec<String>>>>,
    round_robin_counter: AtomicUsize,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Replace the address list for a service
    pub async fn replace(&self, service: &str, addresses: Vec<String>) {
        let mut routes = self.routes.write().await;
        routes.insert(service.to_string(), Arc::new(addresses));
        debug!("Replaced routes for service: {}", service);
    }

    /// Get the address list for a service
    pub async fn addresses(&self, service: &str) -> Option<Arc<Vec<String>>> {
        let routes = self.routes.read().await;
        routes.get(service).cloned()
    }

    /// Pick the next address for a service, round-robin
    pub async fn select(&self, service: &str) -> Option<String> {
        let addresses = self.addresses(service).await?;
        if addresses.is_empty() {
            return None;
        }

        let current = self.round_robin_counter.fetch_add(1, Ordering::SeqCst);
        addresses.get(current % addresses.len()).cloned()
    }

    /// Names of every service with a route entry
    pub async fn services(&self) -> Vec<String> {
        let routes = self.routes.read().await;
        let mut services: Vec<String> = routes.keys().cloned().collect();
        services.sort();
        services
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy every published address list for `service` into the route table until the resolver closes
pub async fn follow(
    service: String,
    mut updates: watch::Receiver<Vec<String>>,
    routes: Arc<RouteTable>,
) {
    loop {
        let addresses = updates.borrow_and_update().clone();
        info!(service = %service, count = addresses.len(), "Route table updated");
        routes.replace(&service, addresses).await;

        if updates.changed().await.is_err() {
            break;
        }
    }
    debug!("Stopped following service: {}", service);
}
