//! The service document exchanged between discovery providers and the
//! resource aggregator.
//!
//! A [`Service`] is an opaque bundle of Envoy resource fragments for one
//! logical service: an optional cluster template, an optional HTTP connection
//! manager template, endpoint fragments, route-configuration templates, DNS
//! records and an optional TLS spec. Providers parse it from the well-known
//! `SERVICE_MESH_SERVICE` parameter file and fill in the identity fields; the
//! aggregator completes whatever the document leaves unset.

use envoy_types::pb::envoy::config::route::v3::{
    route::Action, route_action::ClusterSpecifier, route_match::PathSpecifier, CorsPolicy, Route,
    RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::Duration;
use serde::{Deserialize, Serialize};

/// Default upstream route timeout, matching the gRPC header cap below.
const ROUTE_TIMEOUT_SECONDS: i64 = 60;

/// One logical service discovered in a single cycle.
///
/// Produced by exactly one provider, then moved to the aggregator; never
/// retained across cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    /// Unique service name within a discovery cycle. Filled by the provider
    /// from the registry, not by the document.
    #[serde(default)]
    pub service_name: String,

    /// Name of the cluster Envoy uses to reach this control plane. Filled by
    /// the provider.
    #[serde(default)]
    pub xds_cluster_name: String,

    /// Port the service's listener binds, when it has one.
    #[serde(default)]
    pub listen_port: Option<u32>,

    /// Cluster template; presence requests an EDS cluster for the service.
    #[serde(default)]
    pub cluster: Option<ClusterSpec>,

    /// HTTP connection manager template; presence requests a listener and a
    /// VHDS-backed route configuration shell.
    #[serde(default)]
    pub http_connection_manager: Option<HttpConnectionManagerSpec>,

    /// Reachable addresses for the service cluster.
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,

    /// Route-configuration templates merged into per-domain virtual hosts.
    #[serde(default)]
    pub routes: Vec<RouteConfigSpec>,

    /// DNS records to upsert in the domain registry.
    #[serde(default)]
    pub dns_records: Vec<DnsRecordSpec>,

    /// ACME certificate material to acquire or renew.
    #[serde(default)]
    pub tls: Option<TlsSpec>,
}

/// Upstream protocol of a service cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamProtocol {
    #[default]
    Tcp,
    Grpc,
    Http1,
}

/// Cluster template carried by a service document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub protocol: UpstreamProtocol,

    /// Port instances listen on; used when materializing endpoints from
    /// registry instances.
    #[serde(default)]
    pub upstream_port: Option<u32>,
}

/// HTTP connection manager template carried by a service document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConnectionManagerSpec {
    pub stat_prefix: String,

    /// Explicit RDS route configuration name. Defaults to the service name.
    #[serde(default)]
    pub route_config_name: Option<String>,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default)]
    pub enable_grpc_web: bool,

    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Health-check filter settings of an HTTP connection manager template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Request path answered directly by the proxy. Defaults to `/healthz`.
    #[serde(default)]
    pub path: Option<String>,
}

/// One reachable address of a service cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub address: String,
    #[serde(default)]
    pub port: Option<u32>,
}

/// Route-configuration template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfigSpec {
    /// Defaults to the service name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostSpec>,
}

/// Virtual host template inside a route configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualHostSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub domains: Vec<String>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    #[serde(default)]
    pub cors: Option<CorsPolicySpec>,
}

/// One route of a virtual host template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub path: PathMatch,

    /// Target cluster. Defaults to the service cluster.
    #[serde(default)]
    pub cluster: Option<String>,

    #[serde(default)]
    pub prefix_rewrite: Option<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Path matching of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
}

/// CORS policy template of a virtual host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsPolicySpec {
    #[serde(default)]
    pub allow_methods: Option<String>,

    #[serde(default)]
    pub allow_headers: Option<String>,

    #[serde(default)]
    pub expose_headers: Option<String>,

    #[serde(default)]
    pub allow_origin: Vec<OriginMatcherSpec>,
}

/// Origin matcher of a CORS policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginMatcherSpec {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

/// DNS record a provider upserts through the domain registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsRecordSpec {
    pub zone: String,
    pub record_name: String,

    #[serde(default)]
    pub cname_value: Option<String>,

    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// ACME certificate request carried by a service document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSpec {
    pub domains: Vec<String>,
    pub account_email: String,

    /// ACME directory override. Defaults to the staging directory.
    #[serde(default)]
    pub ca_dir_url: Option<String>,

    /// Key algorithm name. Defaults to `RSA4096`.
    #[serde(default)]
    pub key_type: Option<String>,
}

impl Service {
    /// Parse a service document from its JSON form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Effective route configuration name for the listener's RDS reference.
    pub fn route_config_name(&self) -> String {
        self.http_connection_manager
            .as_ref()
            .and_then(|hcm| hcm.route_config_name.clone())
            .unwrap_or_else(|| self.service_name.clone())
    }
}

impl RouteConfigSpec {
    /// Convert the template to an Envoy route configuration. Unset names
    /// default to the owning service; routes without a cluster target the
    /// service cluster.
    pub fn to_envoy(&self, service_name: &str) -> RouteConfiguration {
        let name = self.name.clone().unwrap_or_else(|| service_name.to_string());

        RouteConfiguration {
            name,
            virtual_hosts: self
                .virtual_hosts
                .iter()
                .map(|vh| vh.to_envoy(service_name))
                .collect(),
            ..Default::default()
        }
    }
}

impl VirtualHostSpec {
    fn to_envoy(&self, service_name: &str) -> VirtualHost {
        #[allow(deprecated)]
        VirtualHost {
            name: self.name.clone().unwrap_or_else(|| service_name.to_string()),
            domains: self.domains.clone(),
            routes: self.routes.iter().map(|route| route.to_envoy(service_name)).collect(),
            cors: self.cors.as_ref().map(CorsPolicySpec::to_envoy),
            ..Default::default()
        }
    }
}

impl RouteSpec {
    fn to_envoy(&self, service_name: &str) -> Route {
        let path_specifier = match &self.path {
            PathMatch::Exact(path) => PathSpecifier::Path(path.clone()),
            PathMatch::Prefix(prefix) => PathSpecifier::Prefix(prefix.clone()),
        };

        let timeout = self.timeout_seconds.map(|t| t as i64).unwrap_or(ROUTE_TIMEOUT_SECONDS);

        let mut action = RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(
                self.cluster.clone().unwrap_or_else(|| service_name.to_string()),
            )),
            timeout: Some(Duration { seconds: timeout, nanos: 0 }),
            max_stream_duration: Some(
                envoy_types::pb::envoy::config::route::v3::route_action::MaxStreamDuration {
                    grpc_timeout_header_max: Some(Duration { seconds: timeout, nanos: 0 }),
                    ..Default::default()
                },
            ),
            ..Default::default()
        };

        if let Some(prefix) = &self.prefix_rewrite {
            action.prefix_rewrite = prefix.clone();
        }

        Route {
            name: self.name.clone().unwrap_or_default(),
            r#match: Some(RouteMatch {
                path_specifier: Some(path_specifier),
                ..Default::default()
            }),
            action: Some(Action::Route(action)),
            ..Default::default()
        }
    }
}

impl CorsPolicySpec {
    fn to_envoy(&self) -> CorsPolicy {
        CorsPolicy {
            allow_methods: self.allow_methods.clone().unwrap_or_default(),
            allow_headers: self.allow_headers.clone().unwrap_or_default(),
            expose_headers: self.expose_headers.clone().unwrap_or_default(),
            allow_origin_string_match: self
                .allow_origin
                .iter()
                .map(OriginMatcherSpec::to_envoy)
                .collect(),
            ..Default::default()
        }
    }
}

impl OriginMatcherSpec {
    fn to_envoy(&self) -> StringMatcher {
        let match_pattern = match self {
            OriginMatcherSpec::Exact(value) => MatchPattern::Exact(value.clone()),
            OriginMatcherSpec::Prefix(value) => MatchPattern::Prefix(value.clone()),
            OriginMatcherSpec::Suffix(value) => MatchPattern::Suffix(value.clone()),
            OriginMatcherSpec::Contains(value) => MatchPattern::Contains(value.clone()),
        };

        StringMatcher { match_pattern: Some(match_pattern), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let document = br#"{
            "listen_port": 8080,
            "cluster": {},
            "http_connection_manager": { "stat_prefix": "api" }
        }"#;

        let service = Service::from_json(document).unwrap();
        assert_eq!(service.listen_port, Some(8080));
        assert!(service.cluster.is_some());
        assert_eq!(service.http_connection_manager.unwrap().stat_prefix, "api");
        assert!(service.routes.is_empty());
    }

    #[test]
    fn route_config_name_defaults_to_service_name() {
        let mut service = Service {
            service_name: "api".into(),
            http_connection_manager: Some(HttpConnectionManagerSpec {
                stat_prefix: "api".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(service.route_config_name(), "api");

        service.http_connection_manager.as_mut().unwrap().route_config_name =
            Some("edge".into());
        assert_eq!(service.route_config_name(), "edge");
    }

    #[test]
    fn route_template_targets_service_cluster_by_default() {
        let spec = RouteConfigSpec {
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
                cors: None,
            }],
        };

        let route_config = spec.to_envoy("api");
        assert_eq!(route_config.name, "api");

        let vh = &route_config.virtual_hosts[0];
        let action = vh.routes[0].action.as_ref().unwrap();
        let Action::Route(route_action) = action else {
            panic!("expected a route action");
        };
        assert_eq!(
            route_action.cluster_specifier,
            Some(ClusterSpecifier::Cluster("api".into()))
        );
    }

    #[test]
    fn cors_template_converts_origin_matchers() {
        let spec = CorsPolicySpec {
            allow_methods: Some("GET, POST".into()),
            allow_headers: None,
            expose_headers: None,
            allow_origin: vec![
                OriginMatcherSpec::Prefix("https://".into()),
                OriginMatcherSpec::Exact("https://app.example.com".into()),
            ],
        };

        let cors = spec.to_envoy();
        assert_eq!(cors.allow_methods, "GET, POST");
        assert_eq!(cors.allow_origin_string_match.len(), 2);
    }
}
