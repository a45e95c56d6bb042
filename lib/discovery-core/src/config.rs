//! Discovery configuration
//!
//! Loaded from the YAML file named by `DISCOVERY_CONFIG` when set, then
//! overridden by individual environment variables.

use crate::record::{validate_address, validate_service_name};
use crate::{DiscoveryError, InstanceRecord, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "DISCOVERY_CONFIG";

fn default_dial_timeout_secs() -> u64 {
    3
}

fn default_namespace() -> String {
    "/services".to_string()
}

fn default_ttl_secs() -> i64 {
    10
}

/// Settings shared by registrars and resolvers
#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Coordination store endpoints. Empty means an in-process store.
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Key namespace every registration lives under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// The instance to announce, for processes that register
    #[serde(default)]
    pub service: Option<ServiceConfig>,

    /// Services to resolve, for processes that route outbound calls
    #[serde(default)]
    pub targets: Vec<String>,

    /// HTTP listen address for processes that serve status endpoints
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            name: self.name.clone(),
            addr: self.addr.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout_secs: default_dial_timeout_secs(),
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
            service: None,
            targets: Vec::new(),
            listen_addr: None,
        }
    }
}

impl DiscoveryConfig {
    /// Load from `DISCOVERY_CONFIG` (if set) and the process environment
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::InvalidConfiguration(format!("failed to read {path}: {e}"))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| DiscoveryError::InvalidConfiguration(e.to_string()))
    }

    /// Apply overrides from an environment-style lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoints) = lookup("DISCOVERY_ENDPOINTS") {
            self.endpoints = split_list(&endpoints);
        }
        if let Some(targets) = lookup("DISCOVERY_TARGETS") {
            self.targets = split_list(&targets);
        }
        if let Some(namespace) = lookup("DISCOVERY_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(ttl) = lookup("DISCOVERY_TTL") {
            self.ttl_secs = ttl.parse().map_err(|_| {
                let message = format!("DISCOVERY_TTL is not an integer: {ttl}");
                DiscoveryError::InvalidConfiguration(message)
            })?;
        }
        if let Some(listen_addr) = lookup("DISCOVERY_LISTEN_ADDR") {
            self.listen_addr = Some(listen_addr);
        }

        match (lookup("SERVICE_NAME"), lookup("SERVICE_ADDR")) {
            (None, None) => {}
            (name, addr) => {
                let current = self.service.take();
                let name = name
                    .or_else(|| current.as_ref().map(|s| s.name.clone()))
                    .unwrap_or_default();
                let addr = addr
                    .or_else(|| current.as_ref().map(|s| s.addr.clone()))
                    .unwrap_or_default();
                let metadata = current.map(|s| s.metadata).unwrap_or_default();
                self.service = Some(ServiceConfig {
                    name,
                    addr,
                    metadata,
                });
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs < 1 {
            return Err(DiscoveryError::InvalidTtl(self.ttl_secs));
        }
        if self.dial_timeout_secs == 0 {
            return Err(DiscoveryError::InvalidConfiguration(
                "dial_timeout_secs must be positive".to_string(),
            ));
        }
        if self.namespace.trim_end_matches('/').is_empty() {
            return Err(DiscoveryError::InvalidConfiguration(
                "namespace must not be empty".to_string(),
            ));
        }
        if let Some(service) = &self.service {
            validate_service_name(&service.name)?;
            validate_address(&service.addr)?;
        }
        for target in &self.targets {
            validate_service_name(target)?;
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
