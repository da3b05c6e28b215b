//! Parameter source: an in-memory mapping of parameters restored from a
//! backing store and, optionally, the process environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;
use tracing::debug;

use crate::errors::{MeshplaneError, Result};

use super::model::{Parameter, ParameterOptions};
use super::store::{ParameterReader, PullRequest};

/// Logical names under which providers locate canonical service-definition
/// documents. Lookup happens via the enum's string name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnown {
    ServiceCluster,
    Ingress,
    TlsAccount,
    TlsCertificate,
    ServiceMeshService,
}

impl WellKnown {
    pub const fn key(self) -> &'static str {
        match self {
            WellKnown::ServiceCluster => "SERVICE_CLUSTER",
            WellKnown::Ingress => "INGRESS",
            WellKnown::TlsAccount => "TLS_ACCOUNT",
            WellKnown::TlsCertificate => "TLS_CERTIFICATE",
            WellKnown::ServiceMeshService => "SERVICE_MESH_SERVICE",
        }
    }
}

impl fmt::Display for WellKnown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Dependencies of a [`ParameterSource`]: the shared parameter option bundle
/// plus the store the source restores from.
#[derive(Clone)]
pub struct SourceOptions {
    pub parameter: ParameterOptions,
    pub store: Arc<dyn ParameterReader>,
}

impl SourceOptions {
    pub fn new(parameter: ParameterOptions, store: Arc<dyn ParameterReader>) -> Self {
        Self { parameter, store }
    }

    /// Create an empty source scoped to the given URL string.
    pub fn source_from_url_str(&self, url_str: &str) -> Result<ParameterSource> {
        let uri = Url::parse(url_str)?;
        Ok(ParameterSource { uri, options: self.clone(), kv: HashMap::new() })
    }
}

/// A mapping from key to [`Parameter`], restored from a backing store.
pub struct ParameterSource {
    uri: Url,
    options: SourceOptions,
    kv: HashMap<String, Parameter>,
}

impl ParameterSource {
    /// Restore the mapping from the backing store.
    ///
    /// The pull runs on its own task and emits parameters into a channel;
    /// this method drains the channel until it closes, then surfaces the pull
    /// task's terminal error, returning the first error from either side.
    pub async fn restore(&mut self) -> Result<()> {
        let (result_tx, mut result_rx) = mpsc::channel(16);

        let request = PullRequest {
            url: self.uri.clone(),
            options: self.options.parameter.clone(),
            result: result_tx,
        };

        let store = self.options.store.clone();
        let pull = tokio::spawn(async move { store.pull(request).await });

        while let Some(parameter) = result_rx.recv().await {
            debug!(key = parameter.key(), "Restored parameter from store");
            self.kv.insert(parameter.key().to_string(), parameter);
        }

        match pull.await {
            Ok(result) => result,
            Err(join_error) => Err(MeshplaneError::internal_with_source(
                "Parameter pull task failed",
                Box::new(join_error),
            )),
        }
    }

    /// Install every `NAME=VALUE` of the process environment as a `var`
    /// parameter, overriding any prior entry of the same key.
    pub fn restore_from_process_envs(&mut self) -> Result<()> {
        for (key, value) in std::env::vars() {
            let parameter = self.options.parameter.var_parameter(&key, &value)?;
            self.kv.insert(key, parameter);
        }

        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    pub fn has_well_known(&self, well_known: WellKnown) -> bool {
        self.has(well_known.key())
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.kv.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Parameter> {
        self.kv.get_mut(key)
    }

    pub fn get_well_known(&self, well_known: WellKnown) -> Option<&Parameter> {
        self.get(well_known.key())
    }

    pub fn get_well_known_mut(&mut self, well_known: WellKnown) -> Option<&mut Parameter> {
        self.get_mut(well_known.key())
    }

    pub fn list(&self) -> Vec<&Parameter> {
        self.kv.values().collect()
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }
}

impl fmt::Debug for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSource")
            .field("uri", &self.uri.as_str())
            .field("parameters", &self.kv.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::{MemoryBlobStorage, MemoryParameterStore};
    use super::super::model::ParameterKind;
    use super::*;

    fn source_options(store: Arc<MemoryParameterStore>) -> SourceOptions {
        let storage = Arc::new(MemoryBlobStorage::new());
        let parameter = ParameterOptions::new(storage.clone(), storage, store.clone());
        SourceOptions::new(parameter, store)
    }

    #[tokio::test]
    async fn restore_installs_every_pulled_parameter_once() {
        let store = Arc::new(MemoryParameterStore::new());
        store.insert("/services/api/SERVICE_MESH_SERVICE", "file://bucket/api.json");
        store.insert("/services/api/LOG_LEVEL", "var:#debug");
        store.insert("/services/other/IGNORED", "var:#nope");

        let options = source_options(store);
        let mut source = options.source_from_url_str("param:///services/api").unwrap();
        source.restore().await.unwrap();

        assert_eq!(source.len(), 2);
        assert!(source.has_well_known(WellKnown::ServiceMeshService));
        assert!(source.has("LOG_LEVEL"));
        assert!(!source.has("IGNORED"));
    }

    #[tokio::test]
    async fn restore_twice_is_idempotent() {
        let store = Arc::new(MemoryParameterStore::new());
        store.insert("/scope/A", "var:#1");
        store.insert("/scope/B", "var:#2");

        let options = source_options(store);
        let mut source = options.source_from_url_str("param:///scope").unwrap();

        source.restore().await.unwrap();
        let first: Vec<String> =
            source.list().iter().map(|p| p.key().to_string()).collect();

        source.restore().await.unwrap();
        let mut second: Vec<String> =
            source.list().iter().map(|p| p.key().to_string()).collect();

        second.sort();
        let mut first_sorted = first.clone();
        first_sorted.sort();
        assert_eq!(first_sorted, second);
        assert_eq!(source.len(), 2);
    }

    #[tokio::test]
    async fn process_envs_override_restored_vars() {
        let store = Arc::new(MemoryParameterStore::new());
        store.insert("/scope/MESHPLANE_SOURCE_TEST", "var:#from-store");

        let options = source_options(store);
        let mut source = options.source_from_url_str("param:///scope").unwrap();
        source.restore().await.unwrap();

        std::env::set_var("MESHPLANE_SOURCE_TEST", "from-env");
        source.restore_from_process_envs().unwrap();
        std::env::remove_var("MESHPLANE_SOURCE_TEST");

        let parameter = source.get("MESHPLANE_SOURCE_TEST").unwrap();
        assert_eq!(parameter.kind(), ParameterKind::Var);
        assert_eq!(parameter.fragment(), "from-env");
    }

    #[test]
    fn well_known_keys_match_enum_names() {
        assert_eq!(WellKnown::ServiceCluster.key(), "SERVICE_CLUSTER");
        assert_eq!(WellKnown::Ingress.key(), "INGRESS");
        assert_eq!(WellKnown::TlsAccount.key(), "TLS_ACCOUNT");
        assert_eq!(WellKnown::TlsCertificate.key(), "TLS_CERTIFICATE");
        assert_eq!(WellKnown::ServiceMeshService.key(), "SERVICE_MESH_SERVICE");
    }
}
