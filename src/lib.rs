//! # Meshplane
//!
//! Meshplane is an Envoy xDS control plane that continuously discovers
//! upstream services from external registries, translates their configuration
//! into Envoy resources, and serves them to data-plane proxies over the xDS
//! streaming protocol.
//!
//! ## Architecture
//!
//! ```text
//! Discovery providers → Resource aggregator → Snapshot cache → xDS gRPC → Envoy
//!        ↓                      ↓
//! Parameter source       Domain / TLS registry
//! ```
//!
//! ## Core Components
//!
//! - **Discovery server**: periodic cycle fanning providers out in parallel
//! - **Resource aggregator**: merges per-service fragments, including
//!   per-domain virtual-host and CORS union merging
//! - **Snapshot cache**: content-hashed, versioned snapshots per node ID
//! - **xDS server**: tonic-based gRPC server implementing Envoy discovery
//!   protocols (ADS, CDS, EDS, LDS, RDS, SDS, RTDS, VHDS)
//! - **Parameter resolver**: URI-addressed configuration over pluggable
//!   key/value and blob stores
//! - **Domain/TLS registry**: idempotent DNS upserts and ACME HTTP-01
//!   certificate issuance

pub mod config;
pub mod discovery;
pub mod domains;
pub mod errors;
pub mod observability;
pub mod parameter;
pub mod xds;

// Re-export commonly used types and traits
pub use config::AppConfig;
pub use errors::{Error, MeshplaneError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_looks_like_semver() {
        let components: Vec<_> = VERSION.split('.').collect();
        assert!(components.len() >= 3, "version should follow semver: {VERSION}");
        assert!(components.iter().all(|part| !part.is_empty()));
        assert_eq!(APP_NAME, "meshplane");
    }
}
