//! Versioned, internally consistent bundles of Envoy resources, plus the
//! process-wide cache serving them to xDS streams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::{filter, Listener};
use envoy_types::pb::envoy::config::route::v3::{RouteConfiguration, VirtualHost};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpConnectionManager,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::envoy::service::runtime::v3::Runtime;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::{MeshplaneError, Result};
use crate::xds::resources::{
    CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, RUNTIME_TYPE_URL,
    SECRET_TYPE_URL, VIRTUAL_HOST_TYPE_URL,
};

/// One named, already-encoded Envoy resource.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltResource {
    pub name: String,
    pub body: Any,
}

impl BuiltResource {
    fn new(name: impl Into<String>, type_url: &str, message: &impl Message) -> Self {
        Self {
            name: name.into(),
            body: Any { type_url: type_url.to_string(), value: message.encode_to_vec() },
        }
    }
}

/// An immutable, versioned resource bundle for one node.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: String,
    resources: BTreeMap<String, Vec<BuiltResource>>,
    content_hash: [u8; 32],
}

impl Snapshot {
    /// Encode the typed buckets under the decimal form of `version`,
    /// requiring internal consistency first.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        version: u64,
        clusters: &[Cluster],
        endpoints: &[ClusterLoadAssignment],
        listeners: &[Listener],
        routes: &[RouteConfiguration],
        secrets: &[Secret],
        runtimes: &[Runtime],
        virtual_hosts: &[VirtualHost],
    ) -> Result<Self> {
        check_consistency(clusters, endpoints, listeners, routes)?;

        let mut resources: BTreeMap<String, Vec<BuiltResource>> = BTreeMap::new();

        resources.insert(
            CLUSTER_TYPE_URL.to_string(),
            clusters
                .iter()
                .map(|c| BuiltResource::new(c.name.clone(), CLUSTER_TYPE_URL, c))
                .collect(),
        );
        resources.insert(
            ENDPOINT_TYPE_URL.to_string(),
            endpoints
                .iter()
                .map(|e| BuiltResource::new(e.cluster_name.clone(), ENDPOINT_TYPE_URL, e))
                .collect(),
        );
        resources.insert(
            LISTENER_TYPE_URL.to_string(),
            listeners
                .iter()
                .map(|l| BuiltResource::new(l.name.clone(), LISTENER_TYPE_URL, l))
                .collect(),
        );
        resources.insert(
            ROUTE_TYPE_URL.to_string(),
            routes
                .iter()
                .map(|r| BuiltResource::new(r.name.clone(), ROUTE_TYPE_URL, r))
                .collect(),
        );
        resources.insert(
            SECRET_TYPE_URL.to_string(),
            secrets
                .iter()
                .map(|s| BuiltResource::new(s.name.clone(), SECRET_TYPE_URL, s))
                .collect(),
        );
        resources.insert(
            RUNTIME_TYPE_URL.to_string(),
            runtimes
                .iter()
                .map(|r| BuiltResource::new(r.name.clone(), RUNTIME_TYPE_URL, r))
                .collect(),
        );
        resources.insert(
            VIRTUAL_HOST_TYPE_URL.to_string(),
            virtual_hosts
                .iter()
                .map(|vh| BuiltResource::new(vh.name.clone(), VIRTUAL_HOST_TYPE_URL, vh))
                .collect(),
        );

        let mut hasher = Sha256::new();
        for bucket in resources.values() {
            for resource in bucket {
                hasher.update(&resource.body.value);
            }
        }

        Ok(Self {
            version: version.to_string(),
            resources,
            content_hash: hasher.finalize().into(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn content_hash(&self) -> [u8; 32] {
        self.content_hash
    }

    /// Resources of one type, in bucket order.
    pub fn resources_of(&self, type_url: &str) -> &[BuiltResource] {
        self.resources.get(type_url).map(Vec::as_slice).unwrap_or_default()
    }

    /// Type URLs present in this snapshot.
    pub fn type_urls(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

/// Verify every named reference resolves inside the snapshot:
/// endpoint -> cluster, listener -> route configuration, and cluster names
/// are unique.
fn check_consistency(
    clusters: &[Cluster],
    endpoints: &[ClusterLoadAssignment],
    listeners: &[Listener],
    routes: &[RouteConfiguration],
) -> Result<()> {
    let mut cluster_names = HashSet::new();
    for cluster in clusters {
        if !cluster_names.insert(cluster.name.as_str()) {
            return Err(MeshplaneError::inconsistent_snapshot(format!(
                "duplicate cluster name '{}'",
                cluster.name
            )));
        }
    }

    for assignment in endpoints {
        if !cluster_names.contains(assignment.cluster_name.as_str()) {
            return Err(MeshplaneError::inconsistent_snapshot(format!(
                "endpoints reference unknown cluster '{}'",
                assignment.cluster_name
            )));
        }
    }

    let route_names: HashSet<&str> = routes.iter().map(|r| r.name.as_str()).collect();

    for listener in listeners {
        for route_name in listener_route_references(listener) {
            if !route_names.contains(route_name.as_str()) {
                return Err(MeshplaneError::inconsistent_snapshot(format!(
                    "listener '{}' references unknown route configuration '{}'",
                    listener.name, route_name
                )));
            }
        }
    }

    Ok(())
}

/// Extract the RDS route-configuration names a listener references through
/// its HTTP connection manager filters.
fn listener_route_references(listener: &Listener) -> Vec<String> {
    let mut names = Vec::new();

    for chain in &listener.filter_chains {
        for chain_filter in &chain.filters {
            let Some(filter::ConfigType::TypedConfig(any)) = &chain_filter.config_type else {
                continue;
            };

            if !any.type_url.ends_with("HttpConnectionManager") {
                continue;
            }

            let Ok(hcm) = HttpConnectionManager::decode(any.value.as_slice()) else {
                continue;
            };

            if let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier {
                names.push(rds.route_config_name);
            }
        }
    }

    names
}

/// Snapshot published for one node.
#[derive(Debug, Clone)]
pub struct SnapshotEvent {
    pub node_id: String,
    pub version: String,
}

/// Process-wide cache of the last snapshot per node.
///
/// Created at server construction, shared by the discovery server (writer)
/// and every xDS stream (readers); destroyed at process exit.
#[derive(Debug)]
pub struct SnapshotCache {
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
    update_tx: broadcast::Sender<SnapshotEvent>,
}

impl SnapshotCache {
    pub fn new() -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(128);
        Arc::new(Self { snapshots: RwLock::new(HashMap::new()), update_tx })
    }

    /// Publish a snapshot for `node_id` and notify every subscribed stream.
    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> Result<()> {
        let version = snapshot.version().to_string();

        {
            let mut snapshots =
                self.snapshots.write().map_err(|_| MeshplaneError::internal(
                    "snapshot cache lock poisoned",
                ))?;
            snapshots.insert(node_id.to_string(), Arc::new(snapshot));
        }

        info!(node_id = %node_id, version = %version, "Published snapshot");

        // Streams subscribe lazily; an empty subscriber list is not an error.
        let _ = self
            .update_tx
            .send(SnapshotEvent { node_id: node_id.to_string(), version });

        Ok(())
    }

    /// Last published snapshot for `node_id`, if any.
    pub fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let snapshots = self.snapshots.read().ok()?;
        let snapshot = snapshots.get(node_id).cloned();
        if snapshot.is_none() {
            debug!(node_id = %node_id, "No snapshot published for node yet");
        }
        snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.update_tx.subscribe()
    }
}
