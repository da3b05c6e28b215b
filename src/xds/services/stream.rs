//! xDS streaming protocol implementation.
//!
//! Shared stream loops backing every discovery service: the SOTW loop serves
//! full per-type snapshots with ACK/NACK handling and push-on-publish; the
//! delta loop serves virtual hosts incrementally for VHDS. Both loops read
//! from the process-wide [`SnapshotCache`] and watch its broadcast channel,
//! so a snapshot published for a node reaches every stream of that node
//! without polling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn};
use uuid::Uuid;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, Resource,
};

use crate::xds::resources::VIRTUAL_HOST_TYPE_URL;
use crate::xds::snapshot::{Snapshot, SnapshotCache};

const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Tracks the last sent version and nonce for ACK/NACK detection.
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: Arc<str>,
    nonce: Arc<str>,
}

/// Build a SOTW response for one type from the node's current snapshot.
/// Returns `None` while no snapshot has been published for the node; the
/// stream then answers once the first publish arrives.
fn build_sotw_response(
    cache: &SnapshotCache,
    node_id: &str,
    type_url: &str,
    resource_names: &[String],
) -> Option<DiscoveryResponse> {
    let snapshot = cache.snapshot(node_id)?;

    let resources = snapshot
        .resources_of(type_url)
        .iter()
        .filter(|resource| {
            resource_names.is_empty() || resource_names.contains(&resource.name)
        })
        .map(|resource| resource.body.clone())
        .collect();

    Some(DiscoveryResponse {
        version_info: snapshot.version().to_string(),
        resources,
        type_url: type_url.to_string(),
        nonce: Uuid::new_v4().to_string(),
        ..Default::default()
    })
}

/// Run the shared SOTW stream loop for one client stream.
///
/// `fixed_type_url` pins the resource type for the single-type discovery
/// services (CDS, EDS, ...); the aggregated service passes `None` and serves
/// whatever types the client requests.
pub fn run_sotw_loop(
    cache: Arc<SnapshotCache>,
    mut in_stream: tonic::Streaming<DiscoveryRequest>,
    fixed_type_url: Option<&'static str>,
    label: &'static str,
) -> ReceiverStream<std::result::Result<DiscoveryResponse, Status>> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let mut update_rx = cache.subscribe();

    tokio::spawn(async move {
        let mut node_id = String::new();
        let mut subscriptions: HashMap<String, Vec<String>> = HashMap::new();
        let mut last_sent: HashMap<String, LastDiscoverySnapshot> = HashMap::new();

        loop {
            tokio::select! {
                result = in_stream.next() => {
                    match result {
                        Some(Ok(request)) => {
                            if let Some(node) = &request.node {
                                if !node.id.is_empty() {
                                    node_id = node.id.clone();
                                }
                            }

                            let type_url = if request.type_url.is_empty() {
                                match fixed_type_url {
                                    Some(fixed) => fixed.to_string(),
                                    None => {
                                        warn!(stream = %label, "Discovery request without type URL");
                                        continue;
                                    }
                                }
                            } else {
                                request.type_url.clone()
                            };

                            info!(
                                type_url = %type_url,
                                version_info = %request.version_info,
                                node_id = %node_id,
                                stream = %label,
                                "Received discovery request"
                            );

                            let current_version = cache
                                .snapshot(&node_id)
                                .map(|snapshot| snapshot.version().to_string());

                            let is_ack = last_sent
                                .get(&type_url)
                                .map(|last| {
                                    !request.response_nonce.is_empty()
                                        && request.response_nonce.as_str() == last.nonce.as_ref()
                                        && request.version_info.as_str() == last.version.as_ref()
                                        && request.error_detail.is_none()
                                        && Some(last.version.as_ref().to_string()) == current_version
                                })
                                .unwrap_or(false);

                            subscriptions.insert(type_url.clone(), request.resource_names.clone());

                            if is_ack {
                                debug!(
                                    type_url = %type_url,
                                    version = %request.version_info,
                                    nonce = %request.response_nonce,
                                    stream = %label,
                                    "[ACK] Skipping duplicate discovery request"
                                );
                                continue;
                            }

                            if let Some(error_detail) = request.error_detail.as_ref() {
                                warn!(
                                    type_url = %type_url,
                                    nonce = %request.response_nonce,
                                    error_code = error_detail.code,
                                    error_message = %error_detail.message,
                                    stream = %label,
                                    "[NACK] Envoy rejected previous response"
                                );
                            }

                            match build_sotw_response(&cache, &node_id, &type_url, &request.resource_names) {
                                Some(response) => {
                                    info!(
                                        type_url = %type_url,
                                        version = %response.version_info,
                                        resource_count = response.resources.len(),
                                        stream = %label,
                                        "Sending discovery response"
                                    );

                                    last_sent.insert(type_url, LastDiscoverySnapshot {
                                        version: Arc::from(response.version_info.as_str()),
                                        nonce: Arc::from(response.nonce.as_str()),
                                    });

                                    if tx.send(Ok(response)).await.is_err() {
                                        return;
                                    }
                                }
                                None => {
                                    debug!(
                                        type_url = %type_url,
                                        node_id = %node_id,
                                        stream = %label,
                                        "Holding request until a snapshot is published"
                                    );
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(stream = %label, "Error receiving discovery request: {}", e);
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        None => {
                            info!(stream = %label, "Stream ended by client");
                            return;
                        }
                    }
                }
                update = update_rx.recv() => {
                    match update {
                        Ok(event) => {
                            if event.node_id != node_id || subscriptions.is_empty() {
                                continue;
                            }

                            for (type_url, resource_names) in &subscriptions {
                                // Skip types already acknowledged at this version.
                                if last_sent
                                    .get(type_url)
                                    .map(|last| last.version.as_ref() == event.version.as_str())
                                    .unwrap_or(false)
                                {
                                    continue;
                                }

                                let Some(response) =
                                    build_sotw_response(&cache, &node_id, type_url, resource_names)
                                else {
                                    continue;
                                };

                                info!(
                                    type_url = %type_url,
                                    version = %response.version_info,
                                    resource_count = response.resources.len(),
                                    stream = %label,
                                    "Pushing snapshot update"
                                );

                                last_sent.insert(type_url.clone(), LastDiscoverySnapshot {
                                    version: Arc::from(response.version_info.as_str()),
                                    nonce: Arc::from(response.nonce.as_str()),
                                });

                                if tx.send(Ok(response)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(stream = %label, skipped, "Missed snapshot notifications");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!(stream = %label, "Snapshot notification channel closed");
                            return;
                        }
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Answer a single SOTW fetch from the node's current snapshot.
pub fn fetch_response(
    cache: &SnapshotCache,
    request: &DiscoveryRequest,
    fixed_type_url: Option<&'static str>,
) -> std::result::Result<DiscoveryResponse, Status> {
    let node_id = request.node.as_ref().map(|node| node.id.as_str()).unwrap_or_default();

    let type_url = if request.type_url.is_empty() {
        fixed_type_url.ok_or_else(|| Status::invalid_argument("missing type URL"))?
    } else {
        request.type_url.as_str()
    };

    build_sotw_response(cache, node_id, type_url, &request.resource_names)
        .ok_or_else(|| Status::not_found(format!("no snapshot published for node '{}'", node_id)))
}

/// Virtual hosts of the snapshot matching a VHDS subscription entry.
///
/// VHDS resource names take the form `<route config name>/<host>`; the merged
/// virtual hosts are published under `<route config name>/<md5(domain)>`, so
/// matches are answered with the requested name attached as an alias.
fn matching_virtual_hosts(
    snapshot: &Snapshot,
    subscribed: &HashSet<String>,
) -> Vec<Resource> {
    use envoy_types::pb::envoy::config::route::v3::VirtualHost;
    use prost::Message;

    let bucket = snapshot.resources_of(VIRTUAL_HOST_TYPE_URL);

    if subscribed.is_empty() {
        return bucket
            .iter()
            .map(|resource| Resource {
                name: resource.name.clone(),
                version: snapshot.version().to_string(),
                resource: Some(resource.body.clone()),
                ..Default::default()
            })
            .collect();
    }

    let mut resources = Vec::new();

    for requested in subscribed {
        let requested_domain = requested
            .split_once('/')
            .map(|(_, domain)| domain.split(':').next().unwrap_or(domain))
            .unwrap_or(requested.as_str());

        for resource in bucket {
            let matches_name = resource.name == *requested;

            let matches_domain = VirtualHost::decode(resource.body.value.as_slice())
                .map(|vh| vh.domains.iter().any(|domain| domain == requested_domain))
                .unwrap_or(false);

            if matches_name || matches_domain {
                resources.push(Resource {
                    name: resource.name.clone(),
                    aliases: vec![requested.clone()],
                    version: snapshot.version().to_string(),
                    resource: Some(resource.body.clone()),
                    ..Default::default()
                });
            }
        }
    }

    resources
}

/// Run the delta stream loop serving virtual hosts for VHDS.
pub fn run_vhds_delta_loop(
    cache: Arc<SnapshotCache>,
    mut in_stream: tonic::Streaming<DeltaDiscoveryRequest>,
    label: &'static str,
) -> ReceiverStream<std::result::Result<DeltaDiscoveryResponse, Status>> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let mut update_rx = cache.subscribe();

    tokio::spawn(async move {
        let mut node_id = String::new();
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut sent: HashSet<String> = HashSet::new();
        let mut announced = false;

        loop {
            tokio::select! {
                result = in_stream.next() => {
                    match result {
                        Some(Ok(request)) => {
                            if let Some(node) = &request.node {
                                if !node.id.is_empty() {
                                    node_id = node.id.clone();
                                }
                            }

                            subscribed.extend(request.resource_names_subscribe.iter().cloned());
                            for name in &request.resource_names_unsubscribe {
                                subscribed.remove(name);
                            }

                            if !request.response_nonce.is_empty() {
                                match request.error_detail.as_ref() {
                                    Some(error_detail) => warn!(
                                        nonce = %request.response_nonce,
                                        error_code = error_detail.code,
                                        error_message = %error_detail.message,
                                        stream = %label,
                                        "[NACK] Delta request rejected by Envoy"
                                    ),
                                    None => debug!(
                                        nonce = %request.response_nonce,
                                        stream = %label,
                                        "[ACK] Delta request acknowledged"
                                    ),
                                }

                                if request.resource_names_subscribe.is_empty() {
                                    continue;
                                }
                            }

                            announced = true;

                            let Some(snapshot) = cache.snapshot(&node_id) else {
                                debug!(node_id = %node_id, stream = %label, "Holding delta request until a snapshot is published");
                                continue;
                            };

                            let resources = matching_virtual_hosts(&snapshot, &subscribed);
                            sent.extend(resources.iter().map(|resource| resource.name.clone()));

                            info!(
                                resource_count = resources.len(),
                                version = %snapshot.version(),
                                stream = %label,
                                "Sending delta response"
                            );

                            let response = DeltaDiscoveryResponse {
                                system_version_info: snapshot.version().to_string(),
                                type_url: VIRTUAL_HOST_TYPE_URL.to_string(),
                                nonce: Uuid::new_v4().to_string(),
                                resources,
                                ..Default::default()
                            };

                            if tx.send(Ok(response)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(stream = %label, "Error receiving delta discovery request: {}", e);
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        None => {
                            info!(stream = %label, "Delta stream ended by client");
                            return;
                        }
                    }
                }
                update = update_rx.recv() => {
                    match update {
                        Ok(event) => {
                            if event.node_id != node_id || !announced {
                                continue;
                            }

                            let Some(snapshot) = cache.snapshot(&node_id) else {
                                continue;
                            };

                            let resources = matching_virtual_hosts(&snapshot, &subscribed);

                            let current: HashSet<String> =
                                resources.iter().map(|resource| resource.name.clone()).collect();
                            let removed: Vec<String> =
                                sent.difference(&current).cloned().collect();

                            if resources.is_empty() && removed.is_empty() {
                                continue;
                            }

                            sent = current;

                            info!(
                                resource_count = resources.len(),
                                removed = removed.len(),
                                version = %snapshot.version(),
                                stream = %label,
                                "Pushing delta update"
                            );

                            let response = DeltaDiscoveryResponse {
                                system_version_info: snapshot.version().to_string(),
                                type_url: VIRTUAL_HOST_TYPE_URL.to_string(),
                                nonce: Uuid::new_v4().to_string(),
                                resources,
                                removed_resources: removed,
                                ..Default::default()
                            };

                            if tx.send(Ok(response)).await.is_err() {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(stream = %label, skipped, "Missed snapshot notifications");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!(stream = %label, "Snapshot notification channel closed");
                            return;
                        }
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx)
}
