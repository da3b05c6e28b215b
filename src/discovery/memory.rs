//! In-memory service registry, backing dev mode and the test suites.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::Result;

use super::registry::{
    RegistryInstance, RegistryNamespace, RegistryService, ServiceRegistry,
};

#[derive(Debug, Default)]
struct MemoryRegistryState {
    namespaces: Vec<RegistryNamespace>,
    services: Vec<RegistryService>,
    tags: HashMap<String, HashMap<String, String>>,
    instances: HashMap<String, Vec<RegistryInstance>>,
}

/// An in-memory [`ServiceRegistry`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryRegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, id: &str, name: &str) {
        self.state.lock().expect("registry lock poisoned").namespaces.push(RegistryNamespace {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_service(&self, id: &str, name: &str, namespace_id: &str) {
        self.state.lock().expect("registry lock poisoned").services.push(RegistryService {
            id: id.to_string(),
            name: name.to_string(),
            namespace_id: namespace_id.to_string(),
        });
    }

    pub fn set_tag(&self, service_id: &str, key: &str, value: &str) {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .tags
            .entry(service_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_instance(&self, service_id: &str, instance: RegistryInstance) {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .instances
            .entry(service_id.to_string())
            .or_default()
            .push(instance);
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn list_namespaces(&self, names: &[String]) -> Result<Vec<RegistryNamespace>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state
            .namespaces
            .iter()
            .filter(|namespace| names.contains(&namespace.name))
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace_ids: &[String]) -> Result<Vec<RegistryService>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state
            .services
            .iter()
            .filter(|service| namespace_ids.contains(&service.namespace_id))
            .cloned()
            .collect())
    }

    async fn service_tags(&self, service_id: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state.tags.get(service_id).cloned().unwrap_or_default())
    }

    async fn list_instances(&self, service_id: &str) -> Result<Vec<RegistryInstance>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state.instances.get(service_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn namespaces_filter_by_name_set() {
        let registry = MemoryRegistry::new();
        registry.add_namespace("ns-1", "production");
        registry.add_namespace("ns-2", "staging");

        let namespaces =
            registry.list_namespaces(&["production".to_string()]).await.unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].id, "ns-1");
    }

    #[tokio::test]
    async fn services_filter_by_namespace() {
        let registry = MemoryRegistry::new();
        registry.add_service("svc-1", "api", "ns-1");
        registry.add_service("svc-2", "web", "ns-2");

        let services = registry.list_services(&["ns-1".to_string()]).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "api");
    }
}
