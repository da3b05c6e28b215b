//! DNS record registration with an idempotent upsert.
//!
//! The registry lists existing record sets before writing: a missing record
//! is created, a record already carrying the desired value is left alone,
//! and anything else is upserted. Zone access is abstracted behind
//! [`ZoneStore`] so the same logic drives any Route 53-like backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::discovery::service::DnsRecordSpec;
use crate::errors::{MeshplaneError, Result};

const DOMAIN_SEPARATOR: char = '.';
const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30);

/// Record types the registry manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Cname,
}

/// A hosted zone of the backing DNS service.
#[derive(Debug, Clone)]
pub struct HostedZone {
    pub id: String,
    pub name: String,
}

/// One resource record set of a hosted zone.
#[derive(Debug, Clone)]
pub struct RecordSet {
    pub fqdn: String,
    pub record_type: RecordType,
    pub ttl: Duration,
    pub values: Vec<String>,
}

/// A change applied to a hosted zone.
#[derive(Debug, Clone)]
pub enum RecordChange {
    Create(RecordSet),
    Upsert(RecordSet),
}

/// Abstract zone access of a DNS backend.
#[async_trait]
pub trait ZoneStore: Send + Sync {
    /// Hosted zone whose name matches `zone`, if any.
    async fn find_zone(&self, zone: &str) -> Result<Option<HostedZone>>;

    /// Record sets of `record_type` whose fully-qualified name equals `fqdn`.
    async fn list_record_sets(
        &self,
        zone_id: &str,
        fqdn: &str,
        record_type: RecordType,
    ) -> Result<Vec<RecordSet>>;

    /// Apply one change to the zone.
    async fn change_record_set(&self, zone_id: &str, change: RecordChange) -> Result<()>;
}

/// The idempotent-upsert contract providers call into.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    async fn register_dns_record(&self, record: &DnsRecordSpec) -> Result<()>;
}

/// [`DomainRegistry`] implementation over an abstract [`ZoneStore`].
pub struct DnsDomainRegistry {
    store: Arc<dyn ZoneStore>,
}

impl DnsDomainRegistry {
    pub fn new(store: Arc<dyn ZoneStore>) -> Self {
        Self { store }
    }

    fn fqdn(record: &DnsRecordSpec) -> String {
        format!(
            "{}{}{}",
            record.record_name.trim_end_matches(DOMAIN_SEPARATOR),
            DOMAIN_SEPARATOR,
            record.zone.trim_start_matches(DOMAIN_SEPARATOR)
        )
    }

    async fn register_cname(
        &self,
        zone: &HostedZone,
        fqdn: &str,
        cname_value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let existing = self.store.list_record_sets(&zone.id, fqdn, RecordType::Cname).await?;

        if existing.is_empty() {
            info!(record_fqdn = %fqdn, "Inserting record (action create)");

            return self
                .store
                .change_record_set(
                    &zone.id,
                    RecordChange::Create(RecordSet {
                        fqdn: fqdn.to_string(),
                        record_type: RecordType::Cname,
                        ttl,
                        values: vec![cname_value.to_string()],
                    }),
                )
                .await;
        }

        for record_set in existing {
            if record_set.values.iter().any(|value| value == cname_value) {
                debug!(record_fqdn = %fqdn, "No need to update cname value, skipping action");
                continue;
            }

            info!(record_fqdn = %fqdn, "Changing record (action upsert)");

            self.store
                .change_record_set(
                    &zone.id,
                    RecordChange::Upsert(RecordSet {
                        values: vec![cname_value.to_string()],
                        ..record_set
                    }),
                )
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl DomainRegistry for DnsDomainRegistry {
    async fn register_dns_record(&self, record: &DnsRecordSpec) -> Result<()> {
        let zone = self.store.find_zone(&record.zone).await?.ok_or_else(|| {
            MeshplaneError::domain_registry(format!(
                "Found 0 hosted zones (ingress zone: {})",
                record.zone
            ))
        })?;

        let ttl = record.ttl_seconds.map(Duration::from_secs).unwrap_or(DEFAULT_RECORD_TTL);
        let fqdn = Self::fqdn(record);

        if let Some(cname_value) = &record.cname_value {
            if !cname_value.is_empty() {
                info!(zone = %record.zone, record_name = %record.record_name, "Ingress domain is a CNAME value");
                self.register_cname(&zone, &fqdn, cname_value, ttl).await?;
            }
        }

        Ok(())
    }
}

/// In-memory [`ZoneStore`], backing dev mode and the test suites. Counts
/// writes so idempotence is observable.
#[derive(Debug, Default)]
pub struct MemoryZoneStore {
    state: std::sync::Mutex<MemoryZoneState>,
    writes: std::sync::atomic::AtomicUsize,
}

#[derive(Debug, Default)]
struct MemoryZoneState {
    zones: Vec<HostedZone>,
    records: Vec<(String, RecordSet)>,
}

impl MemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&self, id: &str, name: &str) {
        self.state
            .lock()
            .expect("zone store lock poisoned")
            .zones
            .push(HostedZone { id: id.to_string(), name: name.to_string() });
    }

    pub fn add_record(&self, zone_id: &str, record_set: RecordSet) {
        self.state
            .lock()
            .expect("zone store lock poisoned")
            .records
            .push((zone_id.to_string(), record_set));
    }

    /// Number of write operations performed through the contract.
    pub fn write_count(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn record_values(&self, zone_id: &str, fqdn: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("zone store lock poisoned")
            .records
            .iter()
            .filter(|(id, record_set)| id == zone_id && record_set.fqdn == fqdn)
            .flat_map(|(_, record_set)| record_set.values.clone())
            .collect()
    }
}

#[async_trait]
impl ZoneStore for MemoryZoneStore {
    async fn find_zone(&self, zone: &str) -> Result<Option<HostedZone>> {
        let state = self.state.lock().expect("zone store lock poisoned");
        Ok(state
            .zones
            .iter()
            .find(|hosted| hosted.name.trim_end_matches('.') == zone.trim_end_matches('.'))
            .cloned())
    }

    async fn list_record_sets(
        &self,
        zone_id: &str,
        fqdn: &str,
        record_type: RecordType,
    ) -> Result<Vec<RecordSet>> {
        let state = self.state.lock().expect("zone store lock poisoned");
        Ok(state
            .records
            .iter()
            .filter(|(id, record_set)| {
                id == zone_id && record_set.fqdn == fqdn && record_set.record_type == record_type
            })
            .map(|(_, record_set)| record_set.clone())
            .collect())
    }

    async fn change_record_set(&self, zone_id: &str, change: RecordChange) -> Result<()> {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let mut state = self.state.lock().expect("zone store lock poisoned");

        match change {
            RecordChange::Create(record_set) => {
                state.records.push((zone_id.to_string(), record_set));
            }
            RecordChange::Upsert(record_set) => {
                state
                    .records
                    .retain(|(id, existing)| !(id == zone_id && existing.fqdn == record_set.fqdn));
                state.records.push((zone_id.to_string(), record_set));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(zone: &str, name: &str, value: &str) -> DnsRecordSpec {
        DnsRecordSpec {
            zone: zone.to_string(),
            record_name: name.to_string(),
            cname_value: Some(value.to_string()),
            ttl_seconds: None,
        }
    }

    #[tokio::test]
    async fn missing_record_is_created_with_default_ttl() {
        let store = Arc::new(MemoryZoneStore::new());
        store.add_zone("z1", "x.com");

        let registry = DnsDomainRegistry::new(store.clone());
        registry.register_dns_record(&record("x.com", "api", "edge.x.com")).await.unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.record_values("z1", "api.x.com"), vec!["edge.x.com".to_string()]);
    }

    #[tokio::test]
    async fn matching_value_performs_no_writes() {
        let store = Arc::new(MemoryZoneStore::new());
        store.add_zone("z1", "x.com");
        store.add_record(
            "z1",
            RecordSet {
                fqdn: "api.x.com".to_string(),
                record_type: RecordType::Cname,
                ttl: DEFAULT_RECORD_TTL,
                values: vec!["old".to_string()],
            },
        );

        let registry = DnsDomainRegistry::new(store.clone());
        registry.register_dns_record(&record("x.com", "api", "old")).await.unwrap();

        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn changed_value_performs_exactly_one_upsert() {
        let store = Arc::new(MemoryZoneStore::new());
        store.add_zone("z1", "x.com");
        store.add_record(
            "z1",
            RecordSet {
                fqdn: "api.x.com".to_string(),
                record_type: RecordType::Cname,
                ttl: DEFAULT_RECORD_TTL,
                values: vec!["old".to_string()],
            },
        );

        let registry = DnsDomainRegistry::new(store.clone());
        registry.register_dns_record(&record("x.com", "api", "new")).await.unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.record_values("z1", "api.x.com"), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn unknown_zone_is_an_error() {
        let store = Arc::new(MemoryZoneStore::new());
        let registry = DnsDomainRegistry::new(store);

        let result = registry.register_dns_record(&record("missing.com", "api", "v")).await;
        assert!(matches!(result, Err(MeshplaneError::DomainRegistry { .. })));
    }
}
