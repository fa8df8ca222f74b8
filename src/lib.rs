//! Host-based ingress proxy fed by a live service directory.
//!
//! Service instances tagged `nimby-domain:<host>` are grouped per host into
//! a weighted random [`balancer::Balancer`]. The [`sync::Synchronizer`]
//! keeps the shared [`registry::DomainRegistry`] current from a directory
//! snapshot followed by its event feed, while [`lb::Ingress`] dispatches
//! each request by its `Host` header.

pub mod balancer;
pub mod configuration;
pub mod credential;
pub mod directory;
pub mod lb;
pub mod metric;
pub mod registry;
pub mod server;
pub mod sync;
pub mod upstream;
