//! Virtual Host Discovery Service (VHDS).
//!
//! Serves the per-domain merged virtual hosts over the delta protocol; the
//! VHDS-backed route configuration shells point Envoy here.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::info;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse,
};
use envoy_types::pb::envoy::service::route::v3::virtual_host_discovery_service_server::VirtualHostDiscoveryService;

use crate::xds::snapshot::SnapshotCache;

use super::stream;

/// VHDS implementation backed by the snapshot cache.
#[derive(Debug)]
pub struct VirtualHostDiscovery {
    cache: Arc<SnapshotCache>,
}

impl VirtualHostDiscovery {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl VirtualHostDiscoveryService for VirtualHostDiscovery {
    type DeltaVirtualHostsStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_virtual_hosts(
        &self,
        request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaVirtualHostsStream>, Status> {
        info!("New VHDS stream connection established");

        let stream =
            stream::run_vhds_delta_loop(self.cache.clone(), request.into_inner(), "vhds");

        Ok(Response::new(Box::pin(stream)))
    }
}
