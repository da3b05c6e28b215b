//! Builders translating service documents into Envoy resources.

use envoy_types::pb::envoy::config::accesslog::v3::{access_log, AccessLog};
use envoy_types::pb::envoy::config::cluster::v3::{
    cluster, cluster::ClusterDiscoveryType, Cluster,
};
use envoy_types::pb::envoy::config::core::v3::{
    address, api_config_source::ApiType, config_source::ConfigSourceSpecifier, socket_address,
    Address, ApiConfigSource, ApiVersion, ConfigSource, GrpcService, Http2ProtocolOptions,
    SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, HeaderMatcher, RouteConfiguration, Vhds,
};
use envoy_types::pb::envoy::extensions::access_loggers::stream::v3::StdoutAccessLog;
use envoy_types::pb::envoy::extensions::filters::http::cors::v3::Cors;
use envoy_types::pb::envoy::extensions::filters::http::grpc_web::v3::GrpcWeb;
use envoy_types::pb::envoy::extensions::filters::http::health_check::v3::HealthCheck;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options, HttpProtocolOptions,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher, StringMatcher};
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration, UInt32Value};
use prost::Message;

use crate::discovery::service::{Service, UpstreamProtocol};
use crate::errors::Result;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const VIRTUAL_HOST_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.VirtualHost";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
pub const RUNTIME_TYPE_URL: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";

const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const CORS_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.cors.v3.Cors";
const GRPC_WEB_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.grpc_web.v3.GrpcWeb";
const HEALTH_CHECK_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.health_check.v3.HealthCheck";
const STDOUT_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog";

const CLUSTER_CONNECT_TIMEOUT_SECONDS: i64 = 15;
const DEFAULT_HEALTH_CHECK_PATH: &str = "/healthz";

/// gRPC config source pointing Envoy back at the control plane cluster, with
/// the node sent only on the first message of each stream.
pub fn grpc_config_source(xds_cluster_name: &str, api_type: ApiType) -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(ApiConfigSource {
            api_type: api_type as i32,
            transport_api_version: ApiVersion::V3 as i32,
            set_node_on_first_message_only: true,
            grpc_services: vec![GrpcService {
                target_specifier: Some(
                    envoy_types::pb::envoy::config::core::v3::grpc_service::TargetSpecifier::EnvoyGrpc(
                        envoy_types::pb::envoy::config::core::v3::grpc_service::EnvoyGrpc {
                            cluster_name: xds_cluster_name.to_string(),
                            ..Default::default()
                        },
                    ),
                ),
                ..Default::default()
            }],
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn make_socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: address.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

/// Build the EDS cluster for a service.
pub fn make_service_cluster(svc: &Service) -> Result<Cluster> {
    let spec = svc.cluster.clone().unwrap_or_default();

    let mut cluster = Cluster {
        name: svc.service_name.clone(),
        connect_timeout: Some(Duration { seconds: CLUSTER_CONNECT_TIMEOUT_SECONDS, nanos: 0 }),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        dns_lookup_family: cluster::DnsLookupFamily::V4Only as i32,
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            service_name: svc.service_name.clone(),
            eds_config: Some(grpc_config_source(&svc.xds_cluster_name, ApiType::Grpc)),
        }),
        ..Default::default()
    };

    match spec.protocol {
        UpstreamProtocol::Grpc => {
            #[allow(deprecated)]
            {
                cluster.http2_protocol_options = Some(Http2ProtocolOptions {
                    max_concurrent_streams: Some(UInt32Value { value: 2147483647 }),
                    ..Default::default()
                });
            }
        }
        UpstreamProtocol::Http1 => {
            let protocol_options = HttpProtocolOptions {
                upstream_protocol_options: Some(
                    http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                        http_protocol_options::ExplicitHttpConfig {
                            protocol_config: Some(
                                http_protocol_options::explicit_http_config::ProtocolConfig::HttpProtocolOptions(
                                    Default::default(),
                                ),
                            ),
                        },
                    ),
                ),
                ..Default::default()
            };

            cluster.typed_extension_protocol_options.insert(
                "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
                Any {
                    type_url: HTTP_PROTOCOL_OPTIONS_TYPE_URL.to_string(),
                    value: protocol_options.encode_to_vec(),
                },
            );
        }
        UpstreamProtocol::Tcp => {}
    }

    Ok(cluster)
}

/// Build the load assignment for a service's endpoints.
///
/// The cluster name is always the service name, regardless of what the
/// document carried.
pub fn make_endpoints(svc: &Service) -> Option<ClusterLoadAssignment> {
    if svc.endpoints.is_empty() {
        return None;
    }

    let upstream_port =
        svc.cluster.as_ref().and_then(|cluster| cluster.upstream_port).unwrap_or_default();

    let lb_endpoints = svc
        .endpoints
        .iter()
        .map(|endpoint| LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                address: Some(make_socket_address(
                    &endpoint.address,
                    endpoint.port.unwrap_or(upstream_port),
                )),
                ..Default::default()
            })),
            ..Default::default()
        })
        .collect();

    Some(ClusterLoadAssignment {
        cluster_name: svc.service_name.clone(),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
        ..Default::default()
    })
}

fn make_router_filter() -> HttpFilter {
    HttpFilter {
        name: "envoy.filters.http.router".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(Any {
            type_url: ROUTER_TYPE_URL.to_string(),
            value: Router::default().encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn make_cors_filter() -> HttpFilter {
    HttpFilter {
        name: "envoy.filters.http.cors".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(Any {
            type_url: CORS_TYPE_URL.to_string(),
            value: Cors::default().encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn make_grpc_web_filter() -> HttpFilter {
    HttpFilter {
        name: "envoy.filters.http.grpc_web".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(Any {
            type_url: GRPC_WEB_TYPE_URL.to_string(),
            value: GrpcWeb::default().encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn make_health_check_filter(path: &str) -> HttpFilter {
    let health_check = HealthCheck {
        pass_through_mode: Some(BoolValue { value: false }),
        headers: vec![HeaderMatcher {
            name: ":path".to_string(),
            header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
                match_pattern: Some(string_matcher::MatchPattern::Exact(path.to_string())),
                ..Default::default()
            })),
            ..Default::default()
        }],
        ..Default::default()
    };

    HttpFilter {
        name: "envoy.filters.http.health_check".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(Any {
            type_url: HEALTH_CHECK_TYPE_URL.to_string(),
            value: health_check.encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn make_stdout_access_log() -> AccessLog {
    AccessLog {
        name: "envoy.access_loggers.stdout".to_string(),
        config_type: Some(access_log::ConfigType::TypedConfig(Any {
            type_url: STDOUT_ACCESS_LOG_TYPE_URL.to_string(),
            value: StdoutAccessLog::default().encode_to_vec(),
        })),
        ..Default::default()
    }
}

/// Build the HTTP connection manager for a service.
///
/// When the template leaves the route specifier unset, an RDS reference named
/// after the service is injected, pointing back at the xDS cluster.
pub fn make_http_connection_manager(svc: &Service) -> Result<HttpConnectionManager> {
    let spec = svc.http_connection_manager.clone().unwrap_or_default();

    let mut http_filters = Vec::new();

    if let Some(health_check) = &spec.health_check {
        let path = health_check.path.as_deref().unwrap_or(DEFAULT_HEALTH_CHECK_PATH);
        http_filters.push(make_health_check_filter(path));
    }

    if spec.enable_cors {
        http_filters.push(make_cors_filter());
    }

    if spec.enable_grpc_web {
        http_filters.push(make_grpc_web_filter());
    }

    http_filters.push(make_router_filter());

    Ok(HttpConnectionManager {
        stat_prefix: spec.stat_prefix,
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(grpc_config_source(
                &svc.xds_cluster_name,
                ApiType::AggregatedGrpc,
            )),
            route_config_name: svc.route_config_name(),
        })),
        access_log: vec![make_stdout_access_log()],
        http_filters,
        ..Default::default()
    })
}

/// Build the listener for a service, wrapping its connection manager in a
/// single filter chain bound to `0.0.0.0:listen_port`.
pub fn make_listener(svc: &Service, hcm: &HttpConnectionManager) -> Result<Listener> {
    let listen_port = svc.listen_port.unwrap_or_default();

    Ok(Listener {
        name: svc.service_name.clone(),
        address: Some(make_socket_address("0.0.0.0", listen_port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(Any {
                    type_url: HCM_TYPE_URL.to_string(),
                    value: hcm.encode_to_vec(),
                })),
            }],
            ..Default::default()
        }],
        ..Default::default()
    })
}

/// Build the VHDS-backed route configuration shell for a service.
///
/// Virtual hosts are delivered separately through delta gRPC; port numbers in
/// the `Host` header are ignored when matching them.
pub fn make_vhds_route_configuration(svc: &Service) -> RouteConfiguration {
    RouteConfiguration {
        name: svc.route_config_name(),
        ignore_port_in_host_matching: true,
        vhds: Some(Vhds {
            config_source: Some(grpc_config_source(&svc.xds_cluster_name, ApiType::DeltaGrpc)),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::service::{ClusterSpec, EndpointSpec, HttpConnectionManagerSpec};

    fn service() -> Service {
        Service {
            service_name: "api".into(),
            xds_cluster_name: "xds".into(),
            listen_port: Some(8080),
            cluster: Some(ClusterSpec::default()),
            http_connection_manager: Some(HttpConnectionManagerSpec {
                stat_prefix: "api".into(),
                ..Default::default()
            }),
            endpoints: vec![EndpointSpec { address: "10.0.0.1".into(), port: Some(9000) }],
            ..Default::default()
        }
    }

    #[test]
    fn service_cluster_uses_eds_over_the_xds_cluster() {
        let cluster = make_service_cluster(&service()).unwrap();

        assert_eq!(cluster.name, "api");
        assert_eq!(cluster.connect_timeout.unwrap().seconds, 15);
        assert_eq!(cluster.lb_policy, cluster::LbPolicy::RoundRobin as i32);
        assert_eq!(cluster.dns_lookup_family, cluster::DnsLookupFamily::V4Only as i32);

        let eds = cluster.eds_cluster_config.unwrap();
        assert_eq!(eds.service_name, "api");

        let config_source = eds.eds_config.unwrap();
        let Some(ConfigSourceSpecifier::ApiConfigSource(api)) =
            config_source.config_source_specifier
        else {
            panic!("expected an API config source");
        };
        assert!(api.set_node_on_first_message_only);
        assert_eq!(api.api_type, ApiType::Grpc as i32);
    }

    #[test]
    fn grpc_protocol_enables_http2_options() {
        let mut svc = service();
        svc.cluster = Some(ClusterSpec {
            protocol: UpstreamProtocol::Grpc,
            upstream_port: None,
        });

        let cluster = make_service_cluster(&svc).unwrap();
        #[allow(deprecated)]
        let http2 = cluster.http2_protocol_options.unwrap();
        assert_eq!(http2.max_concurrent_streams.unwrap().value, 2147483647);
    }

    #[test]
    fn endpoints_take_the_service_cluster_name() {
        let endpoints = make_endpoints(&service()).unwrap();
        assert_eq!(endpoints.cluster_name, "api");
        assert_eq!(endpoints.endpoints[0].lb_endpoints.len(), 1);
    }

    #[test]
    fn endpoints_fall_back_to_upstream_port() {
        let mut svc = service();
        svc.cluster = Some(ClusterSpec { protocol: UpstreamProtocol::Tcp, upstream_port: Some(7070) });
        svc.endpoints = vec![EndpointSpec { address: "10.0.0.2".into(), port: None }];

        let endpoints = make_endpoints(&svc).unwrap();
        let lb_endpoint = &endpoints.endpoints[0].lb_endpoints[0];
        let Some(lb_endpoint::HostIdentifier::Endpoint(endpoint)) = &lb_endpoint.host_identifier
        else {
            panic!("expected an endpoint host identifier");
        };
        let Some(address::Address::SocketAddress(socket)) =
            &endpoint.address.as_ref().unwrap().address
        else {
            panic!("expected a socket address");
        };
        assert_eq!(socket.port_specifier, Some(socket_address::PortSpecifier::PortValue(7070)));
    }

    #[test]
    fn hcm_injects_rds_reference_when_unset() {
        let svc = service();
        let hcm = make_http_connection_manager(&svc).unwrap();

        let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier else {
            panic!("expected an RDS route specifier");
        };
        assert_eq!(rds.route_config_name, "api");

        // Router filter is always last.
        assert_eq!(hcm.http_filters.last().unwrap().name, "envoy.filters.http.router");
    }

    #[test]
    fn listener_binds_all_interfaces_on_the_listen_port() {
        let svc = service();
        let hcm = make_http_connection_manager(&svc).unwrap();
        let listener = make_listener(&svc, &hcm).unwrap();

        assert_eq!(listener.name, "api");
        let Some(address::Address::SocketAddress(socket)) =
            &listener.address.as_ref().unwrap().address
        else {
            panic!("expected a socket address");
        };
        assert_eq!(socket.address, "0.0.0.0");
        assert_eq!(socket.port_specifier, Some(socket_address::PortSpecifier::PortValue(8080)));
        assert_eq!(listener.filter_chains.len(), 1);
    }

    #[test]
    fn vhds_route_configuration_uses_delta_grpc() {
        let svc = service();
        let route_config = make_vhds_route_configuration(&svc);

        assert_eq!(route_config.name, "api");
        assert!(route_config.ignore_port_in_host_matching);

        let config_source = route_config.vhds.unwrap().config_source.unwrap();
        let Some(ConfigSourceSpecifier::ApiConfigSource(api)) =
            config_source.config_source_specifier
        else {
            panic!("expected an API config source");
        };
        assert_eq!(api.api_type, ApiType::DeltaGrpc as i32);
    }
}
