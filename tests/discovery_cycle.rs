//! End-to-end discovery cycles: provider fan-out, aggregation, snapshot
//! publication and the no-op/versioning rules.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{address, socket_address};
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::{RouteConfiguration, VirtualHost};

use meshplane::discovery::memory::MemoryRegistry;
use meshplane::discovery::registry::{RegistryInstance, RegistryProvider, IPV4_ATTRIBUTE};
use meshplane::discovery::service::{
    ClusterSpec, CorsPolicySpec, HttpConnectionManagerSpec, PathMatch, RouteConfigSpec,
    RouteSpec, VirtualHostSpec,
};
use meshplane::discovery::{
    DiscoveryProvider, DiscoveryServer, DiscoveryServerOptions, Service,
};
use meshplane::parameter::memory::{MemoryBlobStorage, MemoryParameterStore};
use meshplane::parameter::{ParameterOptions, SourceOptions};
use meshplane::xds::{
    SnapshotCache, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    VIRTUAL_HOST_TYPE_URL,
};
use meshplane::Result;

const NODE_ID: &str = "test-node";

struct StaticProvider {
    services: Vec<Service>,
}

#[async_trait]
impl DiscoveryProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(
        &self,
        _token: CancellationToken,
        out: mpsc::Sender<Service>,
    ) -> Result<()> {
        for svc in self.services.clone() {
            if out.send(svc).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn server_with(services: Vec<Service>, cache: Arc<SnapshotCache>) -> DiscoveryServer {
    DiscoveryServer::new(
        DiscoveryServerOptions {
            node_id: NODE_ID.to_string(),
            providers: vec![Arc::new(StaticProvider { services })],
            watch_interval: Duration::from_millis(10),
            cycle_timeout: None,
        },
        cache,
    )
}

fn api_service() -> Service {
    Service {
        service_name: "api".into(),
        xds_cluster_name: "xds".into(),
        listen_port: Some(8080),
        cluster: Some(ClusterSpec::default()),
        http_connection_manager: Some(HttpConnectionManagerSpec {
            stat_prefix: "api".into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn single_service_cycle_publishes_expected_resources() {
    let cache = SnapshotCache::new();
    let mut server = server_with(vec![api_service()], cache.clone());
    let token = CancellationToken::new();

    server.run_cycle(&token).await;

    let snapshot = cache.snapshot(NODE_ID).expect("snapshot published");
    assert_eq!(snapshot.version(), "0");

    let clusters = snapshot.resources_of(CLUSTER_TYPE_URL);
    assert_eq!(clusters.len(), 1);
    let cluster = Cluster::decode(clusters[0].body.value.as_slice()).unwrap();
    assert_eq!(cluster.name, "api");

    let listeners = snapshot.resources_of(LISTENER_TYPE_URL);
    assert_eq!(listeners.len(), 1);
    let listener = Listener::decode(listeners[0].body.value.as_slice()).unwrap();
    assert_eq!(listener.name, "api");
    let Some(address::Address::SocketAddress(socket)) =
        &listener.address.as_ref().unwrap().address
    else {
        panic!("expected a socket address");
    };
    assert_eq!(socket.address, "0.0.0.0");
    assert_eq!(
        socket.port_specifier,
        Some(socket_address::PortSpecifier::PortValue(8080))
    );

    let routes = snapshot.resources_of(ROUTE_TYPE_URL);
    assert_eq!(routes.len(), 1);
    let route = RouteConfiguration::decode(routes[0].body.value.as_slice()).unwrap();
    assert_eq!(route.name, "api");
    assert!(route.ignore_port_in_host_matching);
    assert!(route.vhds.is_some());
}

#[tokio::test]
async fn identical_cycle_publishes_nothing_new() {
    let cache = SnapshotCache::new();
    let mut server = server_with(vec![api_service()], cache.clone());
    let token = CancellationToken::new();
    let mut updates = cache.subscribe();

    server.run_cycle(&token).await;
    assert_eq!(server.version(), 1);
    updates.recv().await.expect("first publish");

    server.run_cycle(&token).await;
    assert_eq!(server.version(), 1);
    assert!(updates.try_recv().is_err(), "second identical cycle must not publish");

    // The cached snapshot still carries the first version.
    assert_eq!(cache.snapshot(NODE_ID).unwrap().version(), "0");
}

#[tokio::test]
async fn changed_input_bumps_the_version() {
    let cache = SnapshotCache::new();
    let token = CancellationToken::new();

    // Drive the same server through both cycles by swapping the provider's
    // services between runs.
    struct TogglingProvider {
        toggle: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DiscoveryProvider for TogglingProvider {
        fn name(&self) -> &str {
            "toggling"
        }

        async fn discover(
            &self,
            _token: CancellationToken,
            out: mpsc::Sender<Service>,
        ) -> Result<()> {
            let mut svc = api_service();
            if self.toggle.fetch_xor(true, std::sync::atomic::Ordering::SeqCst) {
                svc.listen_port = Some(9090);
            }
            let _ = out.send(svc).await;
            Ok(())
        }
    }

    let mut server = DiscoveryServer::new(
        DiscoveryServerOptions {
            node_id: NODE_ID.to_string(),
            providers: vec![Arc::new(TogglingProvider {
                toggle: std::sync::atomic::AtomicBool::new(false),
            })],
            watch_interval: Duration::from_millis(10),
            cycle_timeout: None,
        },
        cache.clone(),
    );

    server.run_cycle(&token).await;
    assert_eq!(cache.snapshot(NODE_ID).unwrap().version(), "0");

    server.run_cycle(&token).await;
    assert_eq!(cache.snapshot(NODE_ID).unwrap().version(), "1");
}

fn cors_service(name: &str, allow_methods: &str) -> Service {
    Service {
        service_name: name.to_string(),
        xds_cluster_name: "xds".into(),
        routes: vec![RouteConfigSpec {
            name: None,
            virtual_hosts: vec![VirtualHostSpec {
                name: None,
                domains: vec!["api.example.com".into()],
                routes: vec![RouteSpec {
                    name: None,
                    path: PathMatch::Prefix("/".into()),
                    cluster: None,
                    prefix_rewrite: None,
                    timeout_seconds: None,
                }],
                cors: Some(CorsPolicySpec {
                    allow_methods: Some(allow_methods.to_string()),
                    ..Default::default()
                }),
            }],
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn cors_policies_merge_as_a_set_union() {
    let cache = SnapshotCache::new();
    let mut server = server_with(
        vec![cors_service("a", "GET"), cors_service("b", "POST")],
        cache.clone(),
    );

    server.run_cycle(&CancellationToken::new()).await;

    let snapshot = cache.snapshot(NODE_ID).expect("snapshot published");
    let virtual_hosts = snapshot.resources_of(VIRTUAL_HOST_TYPE_URL);
    assert_eq!(virtual_hosts.len(), 1);

    let virtual_host =
        VirtualHost::decode(virtual_hosts[0].body.value.as_slice()).unwrap();
    assert_eq!(virtual_host.domains, vec!["api.example.com".to_string()]);
    assert_eq!(virtual_host.routes.len(), 2);

    #[allow(deprecated)]
    let cors = virtual_host.cors.as_ref().unwrap();
    assert_eq!(cors.max_age, "1728000");

    let methods: BTreeSet<&str> = cors.allow_methods.split(',').collect();
    let expected: BTreeSet<&str> = ["GET", "POST"].into_iter().collect();
    assert_eq!(methods, expected);
}

struct BlockingProvider;

#[async_trait]
impl DiscoveryProvider for BlockingProvider {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn discover(
        &self,
        token: CancellationToken,
        _out: mpsc::Sender<Service>,
    ) -> Result<()> {
        // Blocks until cancelled, like a provider stuck on network I/O.
        token.cancelled().await;
        Ok(())
    }
}

#[tokio::test]
async fn cancellation_stops_the_loop_and_providers_promptly() {
    let cache = SnapshotCache::new();
    let server = DiscoveryServer::new(
        DiscoveryServerOptions {
            node_id: NODE_ID.to_string(),
            providers: vec![Arc::new(BlockingProvider)],
            watch_interval: Duration::from_secs(3600),
            cycle_timeout: None,
        },
        cache,
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(server.run(token.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop must stop within the grace period")
        .unwrap();
}

#[tokio::test]
async fn registry_provider_discovers_through_the_parameter_plane() {
    // Seed the in-memory registry: one namespace, one service tagged with a
    // parameter URI.
    let registry = Arc::new(MemoryRegistry::new());
    registry.add_namespace("ns-1", "production");
    registry.add_service("svc-1", "api", "ns-1");
    registry.set_tag("svc-1", "meshplane.parameter_uri", "param:///services/api");

    let mut instance = RegistryInstance { id: "i-1".into(), ..Default::default() };
    instance.attributes.insert(IPV4_ATTRIBUTE.to_string(), "10.0.0.9".to_string());
    registry.add_instance("svc-1", instance);

    // Seed the parameter plane: the well-known service document lives in
    // blob storage, referenced from the store.
    let storage = Arc::new(MemoryBlobStorage::new());
    storage.put_object(
        "bucket",
        "/api.json",
        br#"{
            "listen_port": 8080,
            "cluster": { "protocol": "grpc", "upstream_port": 9000 },
            "http_connection_manager": { "stat_prefix": "api" }
        }"#,
    );

    let store = Arc::new(MemoryParameterStore::new());
    store.insert("/services/api/SERVICE_MESH_SERVICE", "file://bucket/api.json");

    let parameter_options =
        ParameterOptions::new(storage.clone(), storage.clone(), store.clone());
    let source_options = SourceOptions::new(parameter_options, store);

    let provider = RegistryProvider::new(
        vec!["production".to_string()],
        "meshplane.parameter_uri".to_string(),
        "xds".to_string(),
        registry,
        source_options,
    );

    let cache = SnapshotCache::new();
    let mut server = DiscoveryServer::new(
        DiscoveryServerOptions {
            node_id: NODE_ID.to_string(),
            providers: vec![Arc::new(provider)],
            watch_interval: Duration::from_millis(10),
            cycle_timeout: None,
        },
        cache.clone(),
    );

    server.run_cycle(&CancellationToken::new()).await;

    let snapshot = cache.snapshot(NODE_ID).expect("snapshot published");

    let clusters = snapshot.resources_of(CLUSTER_TYPE_URL);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].name, "api");

    let endpoints = snapshot.resources_of(ENDPOINT_TYPE_URL);
    assert_eq!(endpoints.len(), 1);

    let assignment =
        envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment::decode(
            endpoints[0].body.value.as_slice(),
        )
        .unwrap();
    assert_eq!(assignment.cluster_name, "api");
    assert_eq!(assignment.endpoints[0].lb_endpoints.len(), 1);
}
