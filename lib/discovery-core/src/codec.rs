//! Registration key layout and record serialization
//!
//! Keys follow `<namespace>/<service>/<host:port>`. Records are stored as JSON
//! objects `{"name": ..., "addr": ..., "metadata": {...}}`.

use crate::{DiscoveryError, InstanceRecord, Result};

/// Build the key an instance is registered under.
///
/// Distinct validated `(service, addr)` pairs never collide, since neither
/// segment may contain `/`.
pub fn build_key(namespace: &str, service: &str, addr: &str) -> String {
    format!("{}{}", service_prefix(namespace, service), addr)
}

/// Key prefix covering every instance of a service, including the trailing `/`
pub fn service_prefix(namespace: &str, service: &str) -> String {
    format!("{}/{}/", namespace.trim_end_matches('/'), service)
}

pub fn encode(record: &InstanceRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decode a stored record. Incomplete records are rejected rather than defaulted.
pub fn decode(bytes: &[u8]) -> Result<InstanceRecord> {
    let record: InstanceRecord = serde_json::from_slice(bytes)?;
    if record.name.is_empty() || record.addr.is_empty() {
        return Err(DiscoveryError::DecodeError(
            "record is missing name or addr".to_string(),
        ));
    }
    Ok(record)
}
