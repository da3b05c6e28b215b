//! # Structured Logging
//!
//! Initializes the process-wide tracing subscriber. The filter comes from
//! `RUST_LOG` when set, otherwise from the configured default. JSON output is
//! available for log aggregation pipelines.

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{MeshplaneError, Result};

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any other component starts logging.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| {
            MeshplaneError::config_with_source("Invalid log filter directive", Box::new(e))
        })?;

    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(true)
            .try_init()
            .map_err(|e| MeshplaneError::internal(format!("Failed to init logging: {}", e)))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| MeshplaneError::internal(format!("Failed to init logging: {}", e)))?;
    }

    Ok(())
}

/// Log the effective configuration at startup.
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        xds_address = %config.xds.socket_address(),
        node_id = %config.discovery.node_id,
        watch_interval_seconds = config.discovery.watch_interval_seconds,
        acme_enabled = config.acme.enabled,
        "Meshplane control plane configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_info() {
        let config = crate::config::AppConfig::default();

        // This should not panic
        log_config_info(&config);
    }

    #[test]
    fn double_init_reports_error_instead_of_panicking() {
        let config = ObservabilityConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        // Whichever call came second (other tests may have installed a
        // subscriber already), it must surface an error rather than panic.
        assert!(first.is_ok() || second.is_err());
    }
}
