//! Aggregated Discovery Service (ADS) backed by the snapshot cache.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::info;

use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use crate::xds::snapshot::SnapshotCache;

use super::stream;

/// ADS implementation serving every resource type of a node's snapshot over
/// one stream.
#[derive(Debug)]
pub struct AggregatedDiscovery {
    cache: Arc<SnapshotCache>,
}

impl AggregatedDiscovery {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AggregatedDiscovery {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!("New ADS stream connection established");

        let stream =
            stream::run_sotw_loop(self.cache.clone(), request.into_inner(), None, "ads");

        Ok(Response::new(Box::pin(stream)))
    }

    async fn delta_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        info!("Delta ADS stream connection established");

        // Delta delivery is only used for virtual hosts, which Envoy requests
        // through the dedicated VHDS service; the same loop answers both.
        let stream =
            stream::run_vhds_delta_loop(self.cache.clone(), request.into_inner(), "delta-ads");

        Ok(Response::new(Box::pin(stream)))
    }
}
