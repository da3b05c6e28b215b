use serde::{Deserialize, Serialize};

/// TLS configuration for the xDS gRPC listener.
///
/// Populated through the layered configuration sources like every other
/// section; a client CA turns on mutual TLS for connecting data planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdsTlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub client_ca_path: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}
