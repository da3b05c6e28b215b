//! The discovery server: periodic cycle orchestration.
//!
//! Every cycle fans the registered providers out in parallel, funnels their
//! services through a single apply channel into a fresh aggregator, and
//! publishes a snapshot only when the aggregated content hash changed.
//! Publish failures leave the version counter and previous hash untouched so
//! the next cycle retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::xds::aggregator::ResourceAggregator;
use crate::xds::snapshot::SnapshotCache;

use super::DiscoveryProvider;

const APPLY_CHANNEL_CAPACITY: usize = 16;

/// Configuration of the discovery server.
#[derive(Clone)]
pub struct DiscoveryServerOptions {
    /// Node ID snapshots are published under.
    pub node_id: String,

    /// Ordered list of providers; each runs once per cycle.
    pub providers: Vec<Arc<dyn DiscoveryProvider>>,

    /// Sleep between cycles.
    pub watch_interval: Duration,

    /// Optional upper bound on a single cycle.
    pub cycle_timeout: Option<Duration>,
}

/// Runs discovery cycles forever and publishes snapshots to the cache.
pub struct DiscoveryServer {
    options: DiscoveryServerOptions,
    cache: Arc<SnapshotCache>,
    version: u64,
    previous_hash: Option<[u8; 32]>,
}

impl DiscoveryServer {
    pub fn new(options: DiscoveryServerOptions, cache: Arc<SnapshotCache>) -> Self {
        Self { options, cache, version: 0, previous_hash: None }
    }

    /// Version that the next publish will carry.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Run the discovery loop until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            node_id = %self.options.node_id,
            providers = self.options.providers.len(),
            watch_interval = ?self.options.watch_interval,
            "Starting discovery loop"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            self.run_cycle(&token).await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.watch_interval) => {}
            }
        }

        info!(node_id = %self.options.node_id, "Discovery loop stopped");
    }

    /// Execute one discovery cycle: fan out, apply, hash, publish.
    #[instrument(skip_all, fields(node_id = %self.options.node_id, version = self.version), name = "discovery_cycle")]
    pub async fn run_cycle(&mut self, token: &CancellationToken) {
        let cycle_token = token.child_token();

        if let Some(timeout) = self.options.cycle_timeout {
            let deadline_token = cycle_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline_token.cancel();
            });
        }

        let (apply_tx, mut apply_rx) = mpsc::channel::<super::Service>(APPLY_CHANNEL_CAPACITY);

        // Single applier task owns the cycle-local aggregator.
        let applier = tokio::spawn(async move {
            let mut aggregator = ResourceAggregator::new();
            while let Some(svc) = apply_rx.recv().await {
                aggregator.apply_service(svc);
            }
            aggregator
        });

        let mut providers = JoinSet::new();

        for provider in &self.options.providers {
            let provider = Arc::clone(provider);
            let provider_token = cycle_token.clone();
            let apply_tx = apply_tx.clone();

            providers.spawn(async move {
                let name = provider.name().to_string();
                let (svc_tx, mut svc_rx) = mpsc::channel(APPLY_CHANNEL_CAPACITY);

                let discover = tokio::spawn({
                    let provider = Arc::clone(&provider);
                    let token = provider_token.clone();
                    async move { provider.discover(token, svc_tx).await }
                });

                // Forward until the provider drops its sender.
                while let Some(svc) = svc_rx.recv().await {
                    if apply_tx.send(svc).await.is_err() {
                        break;
                    }
                }

                match discover.await {
                    Ok(Ok(())) => debug!(provider = %name, "Provider finished"),
                    Ok(Err(err)) => {
                        warn!(provider = %name, error = %err, "Provider failed; continuing with partial data");
                    }
                    Err(err) => {
                        warn!(provider = %name, error = %err, "Provider panicked; continuing with partial data");
                    }
                }
            });
        }

        drop(apply_tx);

        while providers.join_next().await.is_some() {}

        cycle_token.cancel();

        let aggregator = match applier.await {
            Ok(aggregator) => aggregator,
            Err(err) => {
                warn!(error = %err, "Applier task failed; skipping publish");
                return;
            }
        };

        if aggregator.is_empty() && self.previous_hash.is_none() {
            debug!("Nothing discovered and nothing published before; skipping publish");
            return;
        }

        let new_hash = aggregator.content_hash();

        if self.previous_hash.as_ref() == Some(&new_hash) {
            debug!("Aggregated resources unchanged; skipping publish");
            return;
        }

        let snapshot = match aggregator.do_snapshot(self.version) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "Snapshot failed consistency; keeping previous state");
                return;
            }
        };

        if let Err(err) = self.cache.set_snapshot(&self.options.node_id, snapshot) {
            warn!(error = %err, "Failed to publish snapshot; keeping previous state");
            return;
        }

        self.previous_hash = Some(new_hash);
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Service;
    use crate::errors::Result;
    use async_trait::async_trait;

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

    struct FailingProvider;

    #[async_trait]
    impl DiscoveryProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn discover(
            &self,
            _token: CancellationToken,
            _out: mpsc::Sender<Service>,
        ) -> Result<()> {
            Err(crate::errors::MeshplaneError::transport("registry unreachable"))
        }
    }

    fn options(providers: Vec<Arc<dyn DiscoveryProvider>>) -> DiscoveryServerOptions {
        DiscoveryServerOptions {
            node_id: "test-node".to_string(),
            providers,
            watch_interval: Duration::from_millis(10),
            cycle_timeout: None,
        }
    }

    #[tokio::test]
    async fn empty_cycles_never_publish() {
        let cache = SnapshotCache::new();
        let mut server = DiscoveryServer::new(options(vec![]), cache.clone());

        let token = CancellationToken::new();
        server.run_cycle(&token).await;
        server.run_cycle(&token).await;

        assert_eq!(server.version(), 0);
        assert!(cache.snapshot("test-node").is_none());
    }

    #[tokio::test]
    async fn failing_provider_does_not_abort_the_cycle() {
        let cache = SnapshotCache::new();

        let svc = Service {
            service_name: "api".into(),
            xds_cluster_name: "xds".into(),
            cluster: Some(Default::default()),
            ..Default::default()
        };

        let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![
            Arc::new(FailingProvider),
            Arc::new(StaticProvider { services: vec![svc] }),
        ];

        let mut server = DiscoveryServer::new(options(providers), cache.clone());
        server.run_cycle(&CancellationToken::new()).await;

        let snapshot = cache.snapshot("test-node").expect("snapshot published");
        assert_eq!(
            snapshot.resources_of(crate::xds::resources::CLUSTER_TYPE_URL).len(),
            1
        );
    }

    #[tokio::test]
    async fn run_stops_promptly_on_cancellation() {
        let cache = SnapshotCache::new();
        let server = DiscoveryServer::new(options(vec![]), cache);

        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("discovery loop should stop within the grace period")
            .unwrap();
    }
}
