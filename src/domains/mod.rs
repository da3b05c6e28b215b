//! # Domain and TLS registry
//!
//! Optional side effects of discovery: publishing DNS records for service
//! domains and acquiring or renewing ACME certificates for them. Providers
//! invoke both while walking a registry; neither ever fails a discovery
//! cycle.

pub mod account;
pub mod dns;
pub mod http01;
pub mod tls;

pub use dns::{DnsDomainRegistry, DomainRegistry, ZoneStore};
pub use http01::Http01Provider;
pub use tls::TlsOptions;
