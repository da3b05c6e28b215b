use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use meshplane::config::load_config;
use meshplane::discovery::memory::MemoryRegistry;
use meshplane::discovery::registry::RegistryProvider;
use meshplane::discovery::{DiscoveryProvider, DiscoveryServer, DiscoveryServerOptions};
use meshplane::domains::dns::{DnsDomainRegistry, MemoryZoneStore};
use meshplane::domains::{Http01Provider, TlsOptions};
use meshplane::observability::logging::log_config_info;
use meshplane::parameter::memory::{MemoryBlobStorage, MemoryParameterStore};
use meshplane::parameter::{ParameterOptions, SourceOptions};
use meshplane::xds::SnapshotCache;
use meshplane::{Result, APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "meshplane", version, about = "Envoy xDS control plane")]
struct Cli {
    /// Path to a configuration file (YAML or TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    meshplane::observability::init_logging(&config.observability)?;

    info!(app_name = APP_NAME, version = VERSION, "Starting Meshplane control plane");
    log_config_info(&config);

    let cache = SnapshotCache::new();
    let token = CancellationToken::new();

    // Built-in in-memory drivers. Cloud-backed parameter stores, blob
    // storages, registries and zone stores plug in through the same traits.
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());
    let parameter_options =
        ParameterOptions::new(storage.clone(), storage.clone(), store.clone());
    let source_options = SourceOptions::new(parameter_options, store);
    let registry = Arc::new(MemoryRegistry::new());
    let zone_store = Arc::new(MemoryZoneStore::new());

    warn!("No cloud drivers configured; running with in-memory dev drivers");

    let http01 = Http01Provider::new();

    let mut provider = RegistryProvider::new(
        config.discovery.namespaces.clone(),
        config.discovery.parameter_uri_tag.clone(),
        config.discovery.xds_cluster_name.clone(),
        registry,
        source_options,
    )
    .with_domain_registry(Arc::new(DnsDomainRegistry::new(zone_store)));

    if config.acme.enabled {
        let mut tls_options = TlsOptions::new(http01.clone());
        if let Some(directory_url) = &config.acme.directory_url {
            tls_options = tls_options.with_directory_url(directory_url.clone());
        }
        provider = provider.with_tls_options(Arc::new(tls_options));

        let listener = tokio::net::TcpListener::bind(config.acme.challenge_socket_address())
            .await
            .map_err(|e| {
                meshplane::Error::transport(format!(
                    "Failed to bind HTTP-01 challenge listener: {}",
                    e
                ))
            })?;

        info!(address = %config.acme.challenge_socket_address(), "Starting HTTP-01 challenge server");

        let router = http01.router();
        let challenge_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(challenge_token.cancelled_owned())
                .await
            {
                error!(error = %e, "HTTP-01 challenge server failed");
            }
        });
    }

    let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![Arc::new(provider)];

    let discovery = DiscoveryServer::new(
        DiscoveryServerOptions {
            node_id: config.discovery.node_id.clone(),
            providers,
            watch_interval: config.discovery.watch_interval(),
            cycle_timeout: config.discovery.cycle_timeout(),
        },
        cache.clone(),
    );

    let discovery_handle = tokio::spawn(discovery.run(token.clone()));

    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to install CTRL+C signal handler");
            }
            info!("Shutdown signal received");
            token.cancel();
        });
    }

    let shutdown_signal = token.clone().cancelled_owned();

    if let Err(e) = meshplane::xds::start_xds_server(config.xds, cache, shutdown_signal).await {
        error!(error = %e, "Failed to run XDS server");
        token.cancel();
        let _ = discovery_handle.await;
        std::process::exit(1);
    }

    token.cancel();
    let _ = discovery_handle.await;

    info!("Meshplane control plane shutdown completed");
    Ok(())
}
