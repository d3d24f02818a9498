//! Panoptes-Stream launcher: bootstraps the configuration store, the
//! logger, the status endpoint, registry membership, and the telemetry
//! pipeline, then runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panoptes_config::{
    ConfigStore, ConsulConfigStore, EtcdConfigStore, FileConfigStore, ENV_CONSUL_ADDRESS,
    ENV_ETCD_ADDRESS,
};
use panoptes_discovery::{ConsulRegistry, Discovery, EtcdRegistry};
use panoptes_telemetry::backoff::Backoff;
use panoptes_telemetry::Supervisor;

/// Streaming network telemetry collector.
#[derive(Debug, Parser)]
#[command(name = "panoptes-stream", version)]
struct Cli {
    /// Bootstrap configuration: a file path, `consul:<path>` /
    /// `etcd:<path>` for a KV store bootstrapped from a file, or `-`
    /// to pick the KV store from PANOPTES_CONFIG_*_ADDRESS.
    config: String,
}

/// Process exit classification per the operator contract.
enum Fatal {
    Config(String),
    Registry(String),
}

impl Fatal {
    fn code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Registry(_) => 2,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(fatal) = run(cli).await {
        match &fatal {
            Fatal::Config(message) => eprintln!("fatal configuration error: {message}"),
            Fatal::Registry(message) => eprintln!("fatal registry error: {message}"),
        }
        std::process::exit(fatal.code());
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    let config = build_config_store(&cli.config)
        .await
        .map_err(|e| Fatal::Config(e.to_string()))?;

    let global = config.snapshot().global.clone();
    init_logger(&global.logger);
    info!(version = %global.version, "panoptes-stream starting");

    let cancel = CancellationToken::new();

    if global.status.addr.is_empty() {
        warn!("status endpoint disabled, registry health checks will fail");
    } else {
        if global.status.tls_config.enabled {
            warn!("TLS for the status listener is not supported, serving plaintext");
        }
        let addr = global.status.addr.clone();
        let status_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = panoptes_status::serve(addr, status_cancel).await {
                error!(error = %e, "status endpoint failed");
            }
        });
    }

    let discovery = build_registry(&config)
        .await
        .map_err(|e| Fatal::Registry(e.to_string()))?;
    if let Some(discovery) = &discovery {
        spawn_registration(Arc::clone(discovery), cancel.clone());
    }

    let (dispatch_tx, dispatch_rx) = panoptes_telemetry::channel(global.dispatch_capacity());

    let outputs = tokio::spawn(panoptes_outputs::run(
        dispatch_rx,
        Arc::clone(&config),
        cancel.clone(),
    ));

    let supervisor = Supervisor::new(Arc::clone(&config), discovery.clone(), dispatch_tx);
    let pipeline = tokio::spawn(supervisor.run(cancel.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "signal handler failed, shutting down"),
    }
    cancel.cancel();

    if let Some(discovery) = &discovery {
        if let Err(e) = discovery.deregister().await {
            warn!(error = %e, "deregistration failed, registry TTL will reclaim the instance");
        }
        discovery.stop();
    }
    let _ = pipeline.await;
    let _ = outputs.await;
    config.stop();

    info!("panoptes-stream stopped");
    Ok(())
}

/// Builds the configuration store named by the bootstrap argument.
async fn build_config_store(
    bootstrap: &str,
) -> Result<Arc<dyn ConfigStore>, panoptes_config::ConfigError> {
    if bootstrap == "-" {
        let consul = std::env::var(ENV_CONSUL_ADDRESS).unwrap_or_default();
        let etcd = std::env::var(ENV_ETCD_ADDRESS).unwrap_or_default();
        return if !consul.is_empty() {
            Ok(Arc::new(ConsulConfigStore::new("-").await?))
        } else if !etcd.is_empty() {
            Ok(Arc::new(EtcdConfigStore::new("-").await?))
        } else {
            Err(panoptes_config::ConfigError::Store(format!(
                "discovery-only mode needs {ENV_CONSUL_ADDRESS} or {ENV_ETCD_ADDRESS}"
            )))
        };
    }

    if let Some(path) = bootstrap.strip_prefix("consul:") {
        return Ok(Arc::new(ConsulConfigStore::new(path).await?));
    }
    if let Some(path) = bootstrap.strip_prefix("etcd:") {
        return Ok(Arc::new(EtcdConfigStore::new(path).await?));
    }
    Ok(Arc::new(FileConfigStore::new(bootstrap)?))
}

/// Builds the registry adapter selected by the discovery block.
async fn build_registry(
    config: &Arc<dyn ConfigStore>,
) -> Result<Option<Arc<dyn Discovery>>, panoptes_discovery::DiscoveryError> {
    let service = config.snapshot().global.discovery.service.clone();
    match service.as_str() {
        "" => Ok(None),
        "consul" => Ok(Some(Arc::new(ConsulRegistry::new(Arc::clone(config))?))),
        "etcd" => Ok(Some(Arc::new(EtcdRegistry::new(Arc::clone(config)).await?))),
        other => Err(panoptes_discovery::DiscoveryError::NotConfigured(format!(
            "unknown discovery service {other}"
        ))),
    }
}

/// Retries registration until it succeeds; sharded workloads stay
/// gated in the meantime.
fn spawn_registration(discovery: Arc<dyn Discovery>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut backoff = Backoff::with_bounds(Duration::from_secs(1), Duration::from_secs(60));
        loop {
            match discovery.register().await {
                Ok(()) => {
                    info!(id = ?discovery.id(), "instance registered");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "registration failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff.next_delay()) => {}
                    }
                }
            }
        }
    });
}

/// Configures the global tracing subscriber from the logger block.
fn init_logger(logger: &panoptes_config::LoggerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logger.level.clone()));

    if logger.encoding == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
