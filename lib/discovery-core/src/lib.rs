//! Core service discovery types
//!
//! This library provides:
//! - Instance records and their coordination-store key layout
//! - The record codec shared by registrars and resolvers
//! - The address set a resolver maintains for one service
//! - Error taxonomy and configuration

pub mod address_set;
pub mod codec;
pub mod config;
pub mod error;
pub mod record;

pub use address_set::AddressSet;
pub use config::{DiscoveryConfig, ServiceConfig};
pub use error::{DiscoveryError, Result};
pub use record::InstanceRecord;
