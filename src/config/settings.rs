//! # Configuration Settings
//!
//! Defines the configuration structure for the Meshplane control plane.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::errors::{MeshplaneError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// xDS gRPC server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Discovery cycle configuration
    #[validate(nested)]
    pub discovery: DiscoveryConfig,

    /// ACME / HTTP-01 challenge configuration
    #[validate(nested)]
    pub acme: AcmeConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(MeshplaneError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Custom validation logic that goes beyond what the validator crate can do
    fn validate_custom(&self) -> Result<()> {
        if self.acme.enabled && self.acme.challenge_port == self.xds.port {
            return Err(MeshplaneError::validation(
                "xDS and ACME challenge ports cannot be the same",
            ));
        }

        if self.discovery.watch_interval_seconds == 0 {
            return Err(MeshplaneError::validation("Watch interval must be greater than zero"));
        }

        Ok(())
    }
}

/// xDS gRPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsConfig {
    /// Server bind address
    #[validate(length(min = 1, message = "Bind address cannot be empty"))]
    pub bind_address: String,

    /// Server port
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Optional TLS configuration for the gRPC listener
    pub tls: Option<super::tls::XdsTlsConfig>,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 18000, tls: None }
    }
}

impl XdsConfig {
    /// Get the server bind address
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Discovery cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DiscoveryConfig {
    /// Node ID under which snapshots are published
    #[validate(length(min = 1, message = "Node ID cannot be empty"))]
    pub node_id: String,

    /// Name of the cluster Envoy uses to reach this control plane
    #[validate(length(min = 1, message = "xDS cluster name cannot be empty"))]
    pub xds_cluster_name: String,

    /// Interval between discovery cycles in seconds
    pub watch_interval_seconds: u64,

    /// Per-cycle timeout in seconds (0 = no timeout)
    pub cycle_timeout_seconds: u64,

    /// Registry namespaces to walk during discovery
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Registry tag carrying the parameter URI of a service
    #[validate(length(min = 1, message = "Parameter URI tag cannot be empty"))]
    pub parameter_uri_tag: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_id: "meshplane-node".to_string(),
            xds_cluster_name: "xds_cluster".to_string(),
            watch_interval_seconds: 30,
            cycle_timeout_seconds: 0,
            namespaces: Vec::new(),
            parameter_uri_tag: "meshplane.parameter_uri".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Get the watch interval as Duration
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_seconds)
    }

    /// Get the per-cycle timeout as Duration (None if 0)
    pub fn cycle_timeout(&self) -> Option<Duration> {
        if self.cycle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cycle_timeout_seconds))
        }
    }
}

/// ACME / HTTP-01 challenge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Enable the in-process HTTP-01 challenge server
    pub enabled: bool,

    /// Override for the ACME directory URL (defaults to the staging directory)
    pub directory_url: Option<String>,

    /// Bind address for the HTTP-01 challenge listener
    #[validate(length(min = 1, message = "Challenge bind address cannot be empty"))]
    pub challenge_bind_address: String,

    /// Port for the HTTP-01 challenge listener
    pub challenge_port: u16,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: None,
            challenge_bind_address: "0.0.0.0".to_string(),
            challenge_port: 8788,
        }
    }
}

impl AcmeConfig {
    /// Get the challenge server bind address
    pub fn challenge_socket_address(&self) -> String {
        format!("{}:{}", self.challenge_bind_address, self.challenge_port)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is unset
    #[validate(length(min = 1, message = "Log filter cannot be empty"))]
    pub log_filter: String,

    /// Emit logs as JSON instead of human-readable text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_filter: "meshplane=info,tonic=info".to_string(), json_logs: false }
    }
}
