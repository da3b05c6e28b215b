//! Per-domain virtual-host merging across services within one discovery
//! cycle.
//!
//! Route configurations from different services can target the same domain.
//! The map accumulates their routes under a single merged virtual host and
//! takes the set-union of their CORS policies, so the published VirtualHost
//! is a pure function of the set of contributing services.

use std::collections::{BTreeMap, BTreeSet};

use envoy_types::pb::envoy::config::route::v3::{CorsPolicy, RouteConfiguration, VirtualHost};
use envoy_types::pb::envoy::r#type::matcher::v3::StringMatcher;
use md5::{Digest, Md5};
use prost::Message;

const CORS_MAX_AGE: &str = "1728000";
const CORS_LIST_SEPARATOR: char = ',';

/// One merged virtual host plus the accumulators its CORS policy is rebuilt
/// from after every merge.
#[derive(Debug, Clone)]
struct MergedVirtualHost {
    virtual_host: VirtualHost,
    cors_allow_methods: BTreeSet<String>,
    cors_allow_headers: BTreeSet<String>,
    cors_expose_headers: BTreeSet<String>,
    // Keyed by canonical (encoded) form so distinct matchers union cleanly
    // and iteration order stays deterministic.
    cors_allow_origin: BTreeMap<Vec<u8>, StringMatcher>,
}

impl MergedVirtualHost {
    fn new(route_config_name: &str, domain: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(domain.as_bytes());
        let digest = hasher.finalize();

        #[allow(deprecated)]
        let virtual_host = VirtualHost {
            name: format!("{}/{}", route_config_name, hex::encode(digest)),
            domains: vec![domain.to_string()],
            routes: Vec::new(),
            cors: Some(CorsPolicy { max_age: CORS_MAX_AGE.to_string(), ..Default::default() }),
            ..Default::default()
        };

        Self {
            virtual_host,
            cors_allow_methods: BTreeSet::new(),
            cors_allow_headers: BTreeSet::new(),
            cors_expose_headers: BTreeSet::new(),
            cors_allow_origin: BTreeMap::new(),
        }
    }

    fn merge_cors_policy(&mut self, cors: &CorsPolicy) {
        if !cors.allow_methods.is_empty() {
            add_from_list(&mut self.cors_allow_methods, &cors.allow_methods);
        }

        if !cors.allow_headers.is_empty() {
            add_from_list(&mut self.cors_allow_headers, &cors.allow_headers);
        }

        if !cors.expose_headers.is_empty() {
            add_from_list(&mut self.cors_expose_headers, &cors.expose_headers);
        }

        for matcher in &cors.allow_origin_string_match {
            self.cors_allow_origin.insert(matcher.encode_to_vec(), matcher.clone());
        }

        #[allow(deprecated)]
        let merged = self.virtual_host.cors.get_or_insert_with(Default::default);

        merged.allow_methods = join_list(&self.cors_allow_methods);
        merged.allow_headers = join_list(&self.cors_allow_headers);
        merged.expose_headers = join_list(&self.cors_expose_headers);
        merged.allow_origin_string_match = self.cors_allow_origin.values().cloned().collect();
    }
}

fn add_from_list(set: &mut BTreeSet<String>, list: &str) {
    for entry in list.split(CORS_LIST_SEPARATOR) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        set.insert(entry.to_string());
    }
}

fn join_list(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Cycle-local mapping from domain name to merged virtual host.
#[derive(Debug, Clone, Default)]
pub struct VirtualHostMap {
    hosts: BTreeMap<String, MergedVirtualHost>,
}

impl VirtualHostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a route-configuration template: every virtual host's routes and
    /// CORS policy are folded into the per-domain merged hosts.
    pub fn merge_route_configuration(&mut self, route_config: &RouteConfiguration) {
        for route_vh in &route_config.virtual_hosts {
            for domain in &route_vh.domains {
                let merged = self
                    .hosts
                    .entry(domain.clone())
                    .or_insert_with(|| MergedVirtualHost::new(&route_config.name, domain));

                merged.virtual_host.routes.extend(route_vh.routes.iter().cloned());

                #[allow(deprecated)]
                if let Some(cors) = &route_vh.cors {
                    merged.merge_cors_policy(cors);
                }
            }
        }
    }

    /// Materialize the merged hosts, in domain order.
    pub fn to_resources(&self) -> Vec<VirtualHost> {
        self.hosts.values().map(|merged| merged.virtual_host.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::route::v3::Route;
    use envoy_types::pb::envoy::r#type::matcher::v3::string_matcher::MatchPattern;

    fn route_config(
        name: &str,
        domain: &str,
        routes: usize,
        cors: Option<CorsPolicy>,
    ) -> RouteConfiguration {
        #[allow(deprecated)]
        RouteConfiguration {
            name: name.to_string(),
            virtual_hosts: vec![VirtualHost {
                name: format!("{}-vh", name),
                domains: vec![domain.to_string()],
                routes: (0..routes)
                    .map(|i| Route { name: format!("{}-{}", name, i), ..Default::default() })
                    .collect(),
                cors,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn cors(allow_methods: &str) -> CorsPolicy {
        CorsPolicy { allow_methods: allow_methods.to_string(), ..Default::default() }
    }

    #[test]
    fn first_encounter_names_host_after_route_and_domain_hash() {
        let mut map = VirtualHostMap::new();
        map.merge_route_configuration(&route_config("api", "api.example.com", 1, None));

        let hosts = map.to_resources();
        assert_eq!(hosts.len(), 1);

        let mut hasher = Md5::new();
        hasher.update(b"api.example.com");
        let expected = format!("api/{}", hex::encode(hasher.finalize()));
        assert_eq!(hosts[0].name, expected);
        assert_eq!(hosts[0].domains, vec!["api.example.com".to_string()]);

        #[allow(deprecated)]
        let cors = hosts[0].cors.as_ref().unwrap();
        assert_eq!(cors.max_age, CORS_MAX_AGE);
    }

    #[test]
    fn routes_accumulate_across_merges() {
        let mut map = VirtualHostMap::new();
        map.merge_route_configuration(&route_config("a", "api.example.com", 2, None));
        map.merge_route_configuration(&route_config("b", "api.example.com", 3, None));

        let hosts = map.to_resources();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].routes.len(), 5);
    }

    #[test]
    fn cors_methods_union_is_deduplicated_and_trimmed() {
        let mut map = VirtualHostMap::new();
        map.merge_route_configuration(&route_config(
            "a",
            "api.example.com",
            0,
            Some(cors("GET, POST")),
        ));
        map.merge_route_configuration(&route_config(
            "b",
            "api.example.com",
            0,
            Some(cors("POST, DELETE")),
        ));

        let hosts = map.to_resources();
        #[allow(deprecated)]
        let merged = hosts[0].cors.as_ref().unwrap();

        let methods: BTreeSet<&str> = merged.allow_methods.split(',').collect();
        let expected: BTreeSet<&str> = ["GET", "POST", "DELETE"].into_iter().collect();
        assert_eq!(methods, expected);
    }

    #[test]
    fn origin_matchers_union_by_canonical_form() {
        let matcher = |pattern: MatchPattern| StringMatcher {
            match_pattern: Some(pattern),
            ..Default::default()
        };

        let policy_a = CorsPolicy {
            allow_origin_string_match: vec![
                matcher(MatchPattern::Prefix("https://".into())),
                matcher(MatchPattern::Exact("https://app.example.com".into())),
            ],
            ..Default::default()
        };
        let policy_b = CorsPolicy {
            allow_origin_string_match: vec![matcher(MatchPattern::Prefix("https://".into()))],
            ..Default::default()
        };

        let mut map = VirtualHostMap::new();
        map.merge_route_configuration(&route_config("a", "api.example.com", 0, Some(policy_a)));
        map.merge_route_configuration(&route_config("b", "api.example.com", 0, Some(policy_b)));

        let hosts = map.to_resources();
        #[allow(deprecated)]
        let merged = hosts[0].cors.as_ref().unwrap();
        assert_eq!(merged.allow_origin_string_match.len(), 2);
    }

    #[test]
    fn separate_domains_stay_separate() {
        let mut map = VirtualHostMap::new();
        map.merge_route_configuration(&route_config("a", "one.example.com", 1, None));
        map.merge_route_configuration(&route_config("a", "two.example.com", 1, None));

        assert_eq!(map.len(), 2);
    }
}
