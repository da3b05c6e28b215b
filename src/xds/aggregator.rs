//! Cycle-local aggregation of discovered services into Envoy resource
//! buckets.
//!
//! The aggregator is created fresh for every discovery cycle and owned by a
//! single applier task, so it needs no locking. It never fails a cycle:
//! fragments that cannot be applied are logged and skipped, and the snapshot
//! carries whatever was applicable.

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::envoy::service::runtime::v3::Runtime;
use prost::Message;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::discovery::service::Service;
use crate::errors::Result;
use crate::xds::resources;
use crate::xds::snapshot::Snapshot;
use crate::xds::vhost::VirtualHostMap;

/// Typed resource buckets accumulated over one discovery cycle.
#[derive(Debug, Default)]
pub struct ResourceAggregator {
    clusters: Vec<Cluster>,
    endpoints: Vec<ClusterLoadAssignment>,
    listeners: Vec<Listener>,
    routes: Vec<RouteConfiguration>,
    secrets: Vec<Secret>,
    runtimes: Vec<Runtime>,
    virtual_hosts: VirtualHostMap,
}

impl ResourceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one discovered service into the buckets.
    pub fn apply_service(&mut self, svc: Service) {
        debug!(service_name = %svc.service_name, "Applying service to aggregator");

        if svc.cluster.is_some() {
            match resources::make_service_cluster(&svc) {
                Ok(cluster) => self.clusters.push(cluster),
                Err(err) => {
                    warn!(service_name = %svc.service_name, error = %err, "Skipping cluster fragment");
                }
            }
        }

        if svc.http_connection_manager.is_some() {
            match resources::make_http_connection_manager(&svc)
                .and_then(|hcm| resources::make_listener(&svc, &hcm))
            {
                Ok(listener) => {
                    self.listeners.push(listener);
                    self.routes.push(resources::make_vhds_route_configuration(&svc));
                }
                Err(err) => {
                    warn!(service_name = %svc.service_name, error = %err, "Skipping listener fragment");
                }
            }
        }

        if let Some(endpoints) = resources::make_endpoints(&svc) {
            self.endpoints.push(endpoints);
        }

        for route_spec in &svc.routes {
            let route_config = route_spec.to_envoy(&svc.service_name);
            self.virtual_hosts.merge_route_configuration(&route_config);
        }
    }

    /// True when no service contributed any resource this cycle.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
            && self.endpoints.is_empty()
            && self.listeners.is_empty()
            && self.routes.is_empty()
            && self.secrets.is_empty()
            && self.runtimes.is_empty()
            && self.virtual_hosts.is_empty()
    }

    /// SHA-256 over the canonical serialization of every resource across
    /// every bucket, in bucket-iteration order. Stable across runs: prost
    /// encodes fields in tag order and the virtual-host map iterates in
    /// domain order.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();

        for cluster in &self.clusters {
            hasher.update(cluster.encode_to_vec());
        }
        for endpoints in &self.endpoints {
            hasher.update(endpoints.encode_to_vec());
        }
        for listener in &self.listeners {
            hasher.update(listener.encode_to_vec());
        }
        for route in &self.routes {
            hasher.update(route.encode_to_vec());
        }
        for secret in &self.secrets {
            hasher.update(secret.encode_to_vec());
        }
        for runtime in &self.runtimes {
            hasher.update(runtime.encode_to_vec());
        }
        for virtual_host in self.virtual_hosts.to_resources() {
            hasher.update(virtual_host.encode_to_vec());
        }

        hasher.finalize().into()
    }

    /// Materialize the buckets into a consistent snapshot under the decimal
    /// form of `version`.
    pub fn do_snapshot(&self, version: u64) -> Result<Snapshot> {
        Snapshot::build(
            version,
            &self.clusters,
            &self.endpoints,
            &self.listeners,
            &self.routes,
            &self.secrets,
            &self.runtimes,
            &self.virtual_hosts.to_resources(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::service::{
        ClusterSpec, EndpointSpec, HttpConnectionManagerSpec, PathMatch, RouteConfigSpec,
        RouteSpec, VirtualHostSpec,
    };
    use crate::xds::resources::{
        CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, VIRTUAL_HOST_TYPE_URL,
    };

    fn full_service(name: &str) -> Service {
        Service {
            service_name: name.to_string(),
            xds_cluster_name: "xds".to_string(),
            listen_port: Some(8080),
            cluster: Some(ClusterSpec::default()),
            http_connection_manager: Some(HttpConnectionManagerSpec {
                stat_prefix: name.to_string(),
                ..Default::default()
            }),
            endpoints: vec![EndpointSpec { address: "10.0.0.1".into(), port: Some(9000) }],
            routes: vec![RouteConfigSpec {
                name: None,
                virtual_hosts: vec![VirtualHostSpec {
                    name: None,
                    domains: vec![format!("{}.example.com", name)],
                    routes: vec![RouteSpec {
                        name: None,
                        path: PathMatch::Prefix("/".into()),
                        cluster: None,
                        prefix_rewrite: None,
                        timeout_seconds: None,
                    }],
                    cors: None,
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn apply_service_fills_every_bucket() {
        let mut aggregator = ResourceAggregator::new();
        aggregator.apply_service(full_service("api"));

        let snapshot = aggregator.do_snapshot(0).unwrap();
        assert_eq!(snapshot.resources_of(CLUSTER_TYPE_URL).len(), 1);
        assert_eq!(snapshot.resources_of(LISTENER_TYPE_URL).len(), 1);
        assert_eq!(snapshot.resources_of(ROUTE_TYPE_URL).len(), 1);
        assert_eq!(snapshot.resources_of(VIRTUAL_HOST_TYPE_URL).len(), 1);
        assert_eq!(snapshot.version(), "0");
    }

    #[test]
    fn content_hash_is_stable_for_equal_inputs() {
        let mut a = ResourceAggregator::new();
        let mut b = ResourceAggregator::new();
        a.apply_service(full_service("api"));
        b.apply_service(full_service("api"));

        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_changes_with_input() {
        let mut a = ResourceAggregator::new();
        let mut b = ResourceAggregator::new();
        a.apply_service(full_service("api"));
        b.apply_service(full_service("web"));

        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn empty_aggregator_produces_empty_snapshot() {
        let aggregator = ResourceAggregator::new();
        let snapshot = aggregator.do_snapshot(0).unwrap();
        assert!(snapshot.resources_of(CLUSTER_TYPE_URL).is_empty());
    }

    #[test]
    fn service_order_does_not_change_the_virtual_host_bucket() {
        let make = |first: &str, second: &str| {
            let mut aggregator = ResourceAggregator::new();
            let mut a = full_service(first);
            let mut b = full_service(second);
            // Both services contribute to the same domain.
            a.routes[0].virtual_hosts[0].domains = vec!["shared.example.com".into()];
            b.routes[0].virtual_hosts[0].domains = vec!["shared.example.com".into()];
            aggregator.apply_service(a);
            aggregator.apply_service(b);
            aggregator
                .do_snapshot(0)
                .unwrap()
                .resources_of(VIRTUAL_HOST_TYPE_URL)
                .iter()
                .map(|r| r.name.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(make("api", "web"), make("api", "web"));
    }
}
