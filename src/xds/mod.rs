//! Envoy xDS (eXtended Discovery Service) implementation
//!
//! Provides the gRPC server implementing Envoy's discovery protocols
//! (Aggregated, Cluster, Endpoint, Listener, Route, Secret, Runtime and
//! Virtual-Host discovery), the resource aggregator feeding it, and the
//! snapshot cache in between.

pub mod aggregator;
pub(crate) mod resources;
pub mod services;
pub mod snapshot;
pub mod vhost;

use std::future::Future;
use std::sync::Arc;

use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::virtual_host_discovery_service_server::VirtualHostDiscoveryServiceServer;
use envoy_types::pb::envoy::service::runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryServiceServer;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;

use crate::config::XdsConfig;
use crate::errors::{Result, TlsError};

pub use aggregator::ResourceAggregator;
pub use resources::{
    CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, RUNTIME_TYPE_URL,
    SECRET_TYPE_URL, VIRTUAL_HOST_TYPE_URL,
};
pub use services::{AggregatedDiscovery, TypedDiscovery, VirtualHostDiscovery};
pub use snapshot::{BuiltResource, Snapshot, SnapshotCache};
pub use vhost::VirtualHostMap;

/// Start the xDS gRPC server against a shared snapshot cache, with graceful
/// shutdown.
pub async fn start_xds_server<F>(
    config: XdsConfig,
    cache: Arc<SnapshotCache>,
    shutdown_signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_address().parse().map_err(|e| {
        crate::Error::config(format!("xDS bind address '{}' does not parse: {}", config.socket_address(), e))
    })?;

    info!(address = %addr, "Starting Envoy xDS server");

    let mut builder = Server::builder();

    if let Some(tls) = &config.tls {
        builder = builder.tls_config(listener_tls_config(tls)?).map_err(|e| {
            crate::Error::transport(format!("xDS listener rejected TLS material: {}", e))
        })?;

        info!(
            mutual_tls = tls.client_ca_path.is_some(),
            require_client_cert = tls.require_client_cert,
            "Serving xDS over TLS"
        );
    }

    let server = builder
        .add_service(AggregatedDiscoveryServiceServer::new(AggregatedDiscovery::new(
            cache.clone(),
        )))
        .add_service(ClusterDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(EndpointDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(ListenerDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(RouteDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(SecretDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(RuntimeDiscoveryServiceServer::new(TypedDiscovery::new(cache.clone())))
        .add_service(VirtualHostDiscoveryServiceServer::new(VirtualHostDiscovery::new(cache)))
        .serve_with_shutdown(addr, shutdown_signal);

    // Only a bind failure (or a panic elsewhere) is allowed to take the
    // process down; make that case recognizable to the caller.
    server.await.map_err(|e| {
        if e.to_string().contains("bind") || e.to_string().contains("in use") {
            crate::Error::transport(format!("cannot bind xDS listener on {}: {}", addr, e))
        } else {
            crate::Error::transport(format!("xDS server terminated: {}", e))
        }
    })?;

    Ok(())
}

/// Assemble the tonic TLS config for the xDS listener.
///
/// The identity is mandatory; a client CA turns on mutual TLS, optionally
/// enforced. Requesting enforcement without a CA is a configuration bug and
/// fails before any file is touched.
fn listener_tls_config(tls: &crate::config::XdsTlsConfig) -> Result<ServerTlsConfig> {
    if tls.require_client_cert && tls.client_ca_path.is_none() {
        return Err(TlsError::ClientCaMissing.into());
    }

    let cert = read_pem("certificate", &tls.cert_path)?;
    let key = read_pem("private key", &tls.key_path)?;

    let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca_path) = &tls.client_ca_path {
        let ca = read_pem("client CA bundle", ca_path)?;
        tls_config = tls_config.client_ca_root(Certificate::from_pem(ca));

        if !tls.require_client_cert {
            tls_config = tls_config.client_auth_optional(true);
        }
    }

    Ok(tls_config)
}

fn read_pem(kind: &'static str, path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| {
        TlsError::ListenerMaterial { kind, path: path.to_string(), source }.into()
    })
}
