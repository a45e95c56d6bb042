//! Instance records announced by registrars
use crate::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;

/// One announced instance of a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Service name the instance belongs to
    pub name: String,
    /// Network address as `host:port`
    pub addr: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check that the record can be stored under a unique registration key
    pub fn validate(&self) -> Result<()> {
        validate_service_name(&self.name)?;
        validate_address(&self.addr)
    }
}

/// Service names become a single key segment, so they may not contain `/`
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(DiscoveryError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

/// Accepts `host:port` with a non-empty host and a non-zero port.
/// IPv6 hosts must be bracketed, e.g. `[::1]:9000`.
pub fn validate_address(addr: &str) -> Result<()> {
    let invalid = || DiscoveryError::InvalidAddress(addr.to_string());

    if addr.contains('/') || addr.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}
