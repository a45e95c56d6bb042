use crate::client::LeaseId;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}
