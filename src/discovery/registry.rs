//! The registry-walking discovery provider.
//!
//! Walks an external service registry: namespaces are filtered by a
//! configured name set, every service in a matching namespace is inspected
//! for a parameter-URI tag, and the parameter source behind that URI yields
//! the well-known `SERVICE_MESH_SERVICE` document. Services that declare
//! endpoints get them materialized from the registry's instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domains::dns::DomainRegistry;
use crate::domains::tls::TlsOptions;
use crate::errors::Result;
use crate::parameter::{ParameterKind, SourceOptions, WellKnown};

use super::service::{EndpointSpec, Service};
use super::DiscoveryProvider;

/// A namespace of an external service registry.
#[derive(Debug, Clone)]
pub struct RegistryNamespace {
    pub id: String,
    pub name: String,
}

/// A service entry of an external service registry.
#[derive(Debug, Clone)]
pub struct RegistryService {
    pub id: String,
    pub name: String,
    pub namespace_id: String,
}

/// A running instance of a registry service.
#[derive(Debug, Clone, Default)]
pub struct RegistryInstance {
    pub id: String,
    /// Instance attributes; IPv4 addresses live under [`IPV4_ATTRIBUTE`].
    pub attributes: HashMap<String, String>,
}

/// Instance attribute carrying the reachable IPv4 address.
pub const IPV4_ATTRIBUTE: &str = "instance_ipv4";

/// Abstract read surface of an external service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Namespaces whose names match the given set.
    async fn list_namespaces(&self, names: &[String]) -> Result<Vec<RegistryNamespace>>;

    /// Services registered in any of the given namespaces.
    async fn list_services(&self, namespace_ids: &[String]) -> Result<Vec<RegistryService>>;

    /// Metadata tags of one service.
    async fn service_tags(&self, service_id: &str) -> Result<HashMap<String, String>>;

    /// Running instances of one service.
    async fn list_instances(&self, service_id: &str) -> Result<Vec<RegistryInstance>>;
}

/// Discovery provider walking a [`ServiceRegistry`].
pub struct RegistryProvider {
    namespace_names: Vec<String>,
    parameter_uri_tag: String,
    xds_cluster_name: String,
    registry: Arc<dyn ServiceRegistry>,
    source_options: SourceOptions,
    domain_registry: Option<Arc<dyn DomainRegistry>>,
    tls_options: Option<Arc<TlsOptions>>,
}

impl RegistryProvider {
    pub fn new(
        namespace_names: Vec<String>,
        parameter_uri_tag: String,
        xds_cluster_name: String,
        registry: Arc<dyn ServiceRegistry>,
        source_options: SourceOptions,
    ) -> Self {
        Self {
            namespace_names,
            parameter_uri_tag,
            xds_cluster_name,
            registry,
            source_options,
            domain_registry: None,
            tls_options: None,
        }
    }

    /// Attach a domain registry; discovered DNS records will be upserted
    /// through it.
    pub fn with_domain_registry(mut self, domain_registry: Arc<dyn DomainRegistry>) -> Self {
        self.domain_registry = Some(domain_registry);
        self
    }

    /// Attach ACME options; discovered TLS specs will drive certificate
    /// issuance.
    pub fn with_tls_options(mut self, tls_options: Arc<TlsOptions>) -> Self {
        self.tls_options = Some(tls_options);
        self
    }

    async fn namespace_ids(&self) -> Result<Vec<String>> {
        let namespaces = self.registry.list_namespaces(&self.namespace_names).await?;

        for namespace in &namespaces {
            info!(namespace_id = %namespace.id, namespace_name = %namespace.name, "Found registry namespace");
        }

        Ok(namespaces.into_iter().map(|namespace| namespace.id).collect())
    }

    /// Inspect one registry service; returns `None` when it carries no
    /// usable service-mesh document.
    async fn discover_service(&self, entry: &RegistryService) -> Result<Option<Service>> {
        debug!(service_name = %entry.name, "Starting service discovery");

        let tags = self.registry.service_tags(&entry.id).await?;

        let Some(parameter_uri) = tags.get(&self.parameter_uri_tag) else {
            debug!(service_name = %entry.name, tag = %self.parameter_uri_tag, "Ignoring service without parameter URI tag");
            return Ok(None);
        };

        let mut source = self.source_options.source_from_url_str(parameter_uri)?;
        source.restore().await?;

        if !source.has_well_known(WellKnown::ServiceMeshService) {
            warn!(service_name = %entry.name, "No service mesh service parameter found");
            return Ok(None);
        }

        let Some(parameter) = source.get_well_known_mut(WellKnown::ServiceMeshService) else {
            return Ok(None);
        };

        if parameter.kind() != ParameterKind::File {
            warn!(service_name = %entry.name, "Service mesh service parameter must be of kind 'file'");
            return Ok(None);
        }

        parameter.load().await?;

        let mut svc = Service::from_json(parameter.file())?;
        svc.service_name = entry.name.clone();
        svc.xds_cluster_name = self.xds_cluster_name.clone();

        if svc.cluster.is_some() && svc.endpoints.is_empty() {
            svc.endpoints = self.materialize_endpoints(entry, &svc).await?;
        }

        if let Some(domain_registry) = &self.domain_registry {
            for record in &svc.dns_records {
                if let Err(err) = domain_registry.register_dns_record(record).await {
                    warn!(
                        service_name = %entry.name,
                        record_name = %record.record_name,
                        error = %err,
                        "Failed to register DNS record"
                    );
                }
            }
        }

        if let (Some(tls_options), Some(tls)) = (&self.tls_options, &svc.tls) {
            if let Err(err) = tls_options.obtain_certificate(&mut source, tls).await {
                warn!(service_name = %entry.name, error = %err, "Failed to obtain certificate");
            }
        }

        Ok(Some(svc))
    }

    async fn materialize_endpoints(
        &self,
        entry: &RegistryService,
        svc: &Service,
    ) -> Result<Vec<EndpointSpec>> {
        let upstream_port = svc.cluster.as_ref().and_then(|cluster| cluster.upstream_port);

        let mut endpoints = Vec::new();

        for instance in self.registry.list_instances(&entry.id).await? {
            let Some(address) = instance.attributes.get(IPV4_ATTRIBUTE) else {
                continue;
            };

            info!(
                service_name = %entry.name,
                instance_ipv4 = %address,
                "Add endpoint from registry instance"
            );

            endpoints.push(EndpointSpec { address: address.clone(), port: upstream_port });
        }

        Ok(endpoints)
    }
}

#[async_trait]
impl DiscoveryProvider for RegistryProvider {
    fn name(&self) -> &str {
        "registry"
    }

    async fn discover(
        &self,
        token: CancellationToken,
        out: mpsc::Sender<Service>,
    ) -> Result<()> {
        let namespace_ids = self.namespace_ids().await?;
        let services = self.registry.list_services(&namespace_ids).await?;

        for entry in services {
            if token.is_cancelled() {
                debug!(provider = self.name(), "Discovery cancelled");
                return Ok(());
            }

            match self.discover_service(&entry).await {
                Ok(Some(svc)) => {
                    info!(service_name = %entry.name, "Sending service through discovery channel");
                    if out.send(svc).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(service_name = %entry.name, error = %err, "Skipping service");
                }
            }
        }

        Ok(())
    }
}
