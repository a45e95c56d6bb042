use discovery_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid instance address: {0}")]
    InvalidAddress(String),

    #[error("Invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("Invalid lease TTL {0}s: must be at least 1")]
    InvalidTtl(i64),

    #[error("Coordination store unavailable during {op}: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to decode instance record: {0}")]
    DecodeError(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DiscoveryError {
    pub fn store(op: &'static str, source: StoreError) -> Self {
        DiscoveryError::StoreUnavailable { op, source }
    }

    /// Whether retrying the same call can succeed without the caller changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::StoreUnavailable { .. } | DiscoveryError::LeaseLost(_)
        )
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::DecodeError(err.to_string())
    }
}
