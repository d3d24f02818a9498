//! etcd-backed configuration store.
//!
//! Same KV layout as the Consul store, read through `etcd-client` and
//! watched with a native watch stream. The endpoint list may be
//! overridden with `PANOPTES_CONFIG_ETCD_ADDRESS`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Certificate, Client, ConnectOptions, GetOptions, Identity, TlsOptions, WatchOptions};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::TlsConfig;
use crate::snapshot::{ConfigSnapshot, RawBundle, SharedState};
use crate::{ConfigError, ConfigStore, ENV_ETCD_ADDRESS, RELOAD_DEBOUNCE};

/// Delay before rebuilding a failed watch stream.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// etcd store settings from the bootstrap file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdStoreConfig {
    /// etcd endpoints, `host:port`.
    pub endpoints: Vec<String>,
    /// Key prefix the configuration tree lives under.
    pub prefix: String,
    /// TLS settings for the client connection (filesystem paths).
    pub tls_config: TlsConfig,
}

impl Default for EtcdStoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".into()],
            prefix: "panoptes".into(),
            tls_config: TlsConfig::default(),
        }
    }
}

/// Configuration store backed by etcd.
pub struct EtcdConfigStore {
    client: Client,
    prefix: String,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl EtcdConfigStore {
    /// Connects, performs the initial load, and starts the watcher.
    ///
    /// `path` is the bootstrap file holding an [`EtcdStoreConfig`], or
    /// `-` for defaults plus the environment override.
    ///
    /// # Errors
    ///
    /// Returns the connection, parse, or validation error of the
    /// initial load.
    pub async fn new(path: &str) -> Result<Self, ConfigError> {
        let mut cfg = if path == "-" {
            EtcdStoreConfig::default()
        } else {
            read_store_config(Path::new(path))?
        };
        if let Ok(addr) = std::env::var(ENV_ETCD_ADDRESS) {
            if !addr.is_empty() {
                cfg.endpoints = vec![addr];
            }
        }

        let options = connect_options(&cfg)?;
        let client = Client::connect(cfg.endpoints.clone(), options)
            .await
            .map_err(|e| ConfigError::Store(format!("etcd connect failed: {e}")))?;
        let prefix = cfg.prefix;

        let bundle = load(client.clone(), &prefix).await?;
        let snapshot = bundle.build(1)?;
        info!(endpoints = ?cfg.endpoints, devices = snapshot.devices.len(), "configuration loaded from etcd");

        let shared = Arc::new(SharedState::new(snapshot));
        let cancel = CancellationToken::new();
        let store = Self {
            client,
            prefix,
            shared,
            cancel,
        };
        store.spawn_watcher();
        Ok(store)
    }

    /// Watches the config prefix and commits a debounced reload per
    /// event batch.
    fn spawn_watcher(&self) {
        let client = self.client.clone();
        let prefix = self.prefix.clone();
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let root = format!("{prefix}/config/");
            loop {
                let mut watch_client = client.clone();
                let built = tokio::select! {
                    () = cancel.cancelled() => break,
                    built = watch_client.watch(root.as_str(), Some(WatchOptions::new().with_prefix())) => built,
                };

                let (_watcher, mut stream) = match built {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "etcd watch failed to start");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                        }
                    }
                };

                loop {
                    let message = tokio::select! {
                        () = cancel.cancelled() => return,
                        message = stream.message() => message,
                    };
                    match message {
                        Ok(Some(response)) => {
                            if response.events().is_empty() {
                                continue;
                            }
                            tokio::time::sleep(RELOAD_DEBOUNCE).await;
                            match load(client.clone(), &prefix).await
                                .and_then(|bundle| shared.commit(bundle))
                            {
                                Ok(true) => info!("etcd configuration reloaded"),
                                Ok(false) => debug!("etcd configuration unchanged"),
                                Err(e) => warn!(error = %e, "etcd reload rejected, previous snapshot retained"),
                            }
                        }
                        Ok(None) => {
                            warn!("etcd watch stream closed, rebuilding");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "etcd watch stream error, rebuilding");
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConfigStore for EtcdConfigStore {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.shared.snapshot()
    }

    fn informer(&self) -> watch::Receiver<u64> {
        self.shared.informer()
    }

    async fn update(&self) -> Result<bool, ConfigError> {
        let bundle = load(self.client.clone(), &self.prefix).await?;
        self.shared.commit(bundle)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EtcdConfigStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads the full config tree into a bundle.
async fn load(mut client: Client, prefix: &str) -> Result<RawBundle, ConfigError> {
    let root = format!("{prefix}/config/");
    let response = client
        .get(root.as_str(), Some(GetOptions::new().with_prefix()))
        .await
        .map_err(|e| ConfigError::Store(format!("etcd get failed: {e}")))?;

    let mut bundle = RawBundle::default();
    for kv in response.kvs() {
        let key = kv
            .key_str()
            .map_err(|e| ConfigError::Store(format!("etcd key not UTF-8: {e}")))?;
        let Some(suffix) = key.strip_prefix(&root) else {
            continue;
        };
        bundle.insert_entry(suffix, kv.value())?;
    }
    Ok(bundle)
}

fn read_store_config(path: &Path) -> Result<EtcdStoreConfig, ConfigError> {
    let raw = std::fs::read(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_slice(&raw)?),
        _ => Ok(serde_yaml::from_slice(&raw)?),
    }
}

fn connect_options(cfg: &EtcdStoreConfig) -> Result<Option<ConnectOptions>, ConfigError> {
    if !cfg.tls_config.enabled {
        return Ok(None);
    }

    let mut tls = TlsOptions::new();
    if !cfg.tls_config.ca_file.is_empty() {
        let pem = std::fs::read(&cfg.tls_config.ca_file)?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }
    if !cfg.tls_config.cert_file.is_empty() && !cfg.tls_config.key_file.is_empty() {
        let cert = std::fs::read(&cfg.tls_config.cert_file)?;
        let key = std::fs::read(&cfg.tls_config.key_file)?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    Ok(Some(ConnectOptions::new().with_tls(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let cfg = EtcdStoreConfig::default();
        assert_eq!(cfg.endpoints, vec!["127.0.0.1:2379".to_string()]);
        assert_eq!(cfg.prefix, "panoptes");
    }

    #[test]
    fn test_store_config_from_json() {
        let raw = r#"{"endpoints": ["10.0.0.1:2379", "10.0.0.2:2379"], "prefix": "telemetry"}"#;
        let cfg: EtcdStoreConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.prefix, "telemetry");
    }

    #[test]
    fn test_plaintext_connect_options() {
        let cfg = EtcdStoreConfig::default();
        assert!(connect_options(&cfg).unwrap().is_none());
    }
}
