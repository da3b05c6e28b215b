//! Single-type discovery services (CDS, EDS, LDS, RDS, SDS, RTDS).
//!
//! All of them share one implementation over the snapshot cache; the type URL
//! is pinned per service so clients that omit it on non-aggregated streams
//! still get the right bucket.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::info;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use crate::xds::resources::{
    CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, RUNTIME_TYPE_URL,
    SECRET_TYPE_URL,
};
use crate::xds::snapshot::SnapshotCache;

use super::stream;

/// Shared implementation behind every single-type discovery service.
#[derive(Debug)]
pub struct TypedDiscovery {
    cache: Arc<SnapshotCache>,
}

impl TypedDiscovery {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

macro_rules! sotw_discovery_service {
    (
        $trait_path:path,
        $type_url:expr,
        $label:literal,
        $stream_method:ident,
        $stream_assoc:ident,
        $delta_method:ident,
        $delta_assoc:ident,
        $fetch_method:ident
    ) => {
        #[tonic::async_trait]
        impl $trait_path for TypedDiscovery {
            type $stream_assoc =
                Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
            type $delta_assoc = Pin<
                Box<
                    dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send,
                >,
            >;

            async fn $stream_method(
                &self,
                request: Request<tonic::Streaming<DiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$stream_assoc>, Status> {
                info!(stream = $label, "New xDS stream connection established");

                let stream = stream::run_sotw_loop(
                    self.cache.clone(),
                    request.into_inner(),
                    Some($type_url),
                    $label,
                );

                Ok(Response::new(Box::pin(stream)))
            }

            async fn $delta_method(
                &self,
                _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$delta_assoc>, Status> {
                Err(Status::unimplemented(
                    "delta delivery is only supported for virtual hosts (VHDS)",
                ))
            }

            async fn $fetch_method(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
                stream::fetch_response(&self.cache, request.get_ref(), Some($type_url))
                    .map(Response::new)
            }
        }
    };
}

sotw_discovery_service!(
    envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService,
    CLUSTER_TYPE_URL,
    "cds",
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    fetch_clusters
);

sotw_discovery_service!(
    envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService,
    ENDPOINT_TYPE_URL,
    "eds",
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    fetch_endpoints
);

sotw_discovery_service!(
    envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService,
    LISTENER_TYPE_URL,
    "lds",
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    fetch_listeners
);

sotw_discovery_service!(
    envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService,
    ROUTE_TYPE_URL,
    "rds",
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    fetch_routes
);

sotw_discovery_service!(
    envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService,
    SECRET_TYPE_URL,
    "sds",
    stream_secrets,
    StreamSecretsStream,
    delta_secrets,
    DeltaSecretsStream,
    fetch_secrets
);

sotw_discovery_service!(
    envoy_types::pb::envoy::service::runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryService,
    RUNTIME_TYPE_URL,
    "rtds",
    stream_runtime,
    StreamRuntimeStream,
    delta_runtime,
    DeltaRuntimeStream,
    fetch_runtime
);
