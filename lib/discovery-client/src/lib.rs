//! Service registration and resolution against a coordination store
//!
//! A server process holds a `Registration` obtained from `Registrar::register`
//! for as long as it serves; a client process opens a `ResolverHandle` per
//! target service and routes against the address list it publishes.

pub mod metrics;
pub mod registrar;
pub mod resolver;
pub mod session;

pub use metrics::DiscoveryMetrics;
pub use registrar::{Registrar, RegistrarConfig, RegistrarState, Registration};
pub use resolver::{Resolver, ResolverConfig, ResolverHandle};
pub use session::connect;
