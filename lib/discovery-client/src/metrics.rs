//! Prometheus metrics for registration and resolution

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector shared by registrars and resolvers
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Successful initial registrations
    pub registrations_total: IntCounter,
    /// Re-registrations after keep-alive loss
    pub reregistrations_total: IntCounter,
    /// Failed registration attempts, initial or background
    pub registration_failures_total: IntCounter,
    /// Full resolver resyncs after watch loss
    pub resyncs_total: IntCounter,
    /// Records that could not be decoded
    pub decode_errors_total: IntCounter,
    /// Addresses currently published per service
    pub resolved_addresses: IntGaugeVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations_total = IntCounter::new(
            "discovery_registrations_total",
            "Total successful service registrations",
        )?;
        let reregistrations_total = IntCounter::new(
            "discovery_reregistrations_total",
            "Total re-registrations after keep-alive loss",
        )?;
        let registration_failures_total = IntCounter::new(
            "discovery_registration_failures_total",
            "Total failed registration attempts",
        )?;
        let resyncs_total = IntCounter::new(
            "discovery_resyncs_total",
            "Total resolver resyncs after watch loss",
        )?;
        let decode_errors_total = IntCounter::new(
            "discovery_decode_errors_total",
            "Total instance records that failed to decode",
        )?;
        let resolved_addresses = IntGaugeVec::new(
            Opts::new(
                "discovery_resolved_addresses",
                "Addresses currently published by a resolver",
            ),
            &["service"],
        )?;

        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(reregistrations_total.clone()))?;
        registry.register(Box::new(registration_failures_total.clone()))?;
        registry.register(Box::new(resyncs_total.clone()))?;
        registry.register(Box::new(decode_errors_total.clone()))?;
        registry.register(Box::new(resolved_addresses.clone()))?;

        Ok(Self {
            registrations_total,
            reregistrations_total,
            registration_failures_total,
            resyncs_total,
            decode_errors_total,
            resolved_addresses,
            registry,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
