//! Consul-backed configuration store.
//!
//! Reads the tree under `<prefix>/config/` from the Consul KV API and
//! watches it with blocking queries. The store address comes from the
//! bootstrap file (or defaults) and may be overridden with
//! `PANOPTES_CONFIG_CONSUL_ADDRESS`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::TlsConfig;
use crate::snapshot::{ConfigSnapshot, RawBundle, SharedState};
use crate::{ConfigError, ConfigStore, ENV_CONSUL_ADDRESS, RELOAD_DEBOUNCE};

/// Wait horizon for Consul blocking queries.
const BLOCKING_WAIT: &str = "55s";

/// Delay before retrying a failed watch query.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Consul store settings from the bootstrap file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulStoreConfig {
    /// Consul agent address, `host:port` or a full URL.
    pub address: String,
    /// KV prefix the configuration tree lives under.
    pub prefix: String,
    /// TLS settings for the agent connection (filesystem paths).
    pub tls_config: TlsConfig,
}

impl Default for ConsulStoreConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".into(),
            prefix: "panoptes".into(),
            tls_config: TlsConfig::default(),
        }
    }
}

/// One entry of a recursive KV read. Values are base64-encoded.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Configuration store backed by the Consul KV API.
#[derive(Debug)]
pub struct ConsulConfigStore {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl ConsulConfigStore {
    /// Connects, performs the initial load, and starts the watcher.
    ///
    /// `path` is the bootstrap file holding a [`ConsulStoreConfig`], or
    /// `-` for defaults plus the environment override.
    ///
    /// # Errors
    ///
    /// Returns the request, parse, or validation error of the initial
    /// load.
    pub async fn new(path: &str) -> Result<Self, ConfigError> {
        let mut cfg = if path == "-" {
            ConsulStoreConfig::default()
        } else {
            read_store_config(Path::new(path))?
        };
        if let Ok(addr) = std::env::var(ENV_CONSUL_ADDRESS) {
            if !addr.is_empty() {
                cfg.address = addr;
            }
        }

        let client = build_client(&cfg)?;
        let base_url = base_url(&cfg);
        let prefix = cfg.prefix;

        let bundle = load(&client, &base_url, &prefix).await?;
        let snapshot = bundle.build(1)?;
        info!(address = %base_url, devices = snapshot.devices.len(), "configuration loaded from consul");

        let shared = Arc::new(SharedState::new(snapshot));
        let cancel = CancellationToken::new();
        let store = Self {
            client,
            base_url,
            prefix,
            shared,
            cancel,
        };
        store.spawn_watcher();
        Ok(store)
    }

    /// Watches the config prefix with blocking queries and commits a
    /// debounced reload on every index change.
    fn spawn_watcher(&self) {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let prefix = self.prefix.clone();
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            loop {
                let url = format!(
                    "{base_url}/v1/kv/{prefix}/config/?recurse=true&index={index}&wait={BLOCKING_WAIT}"
                );
                let response = tokio::select! {
                    () = cancel.cancelled() => break,
                    response = client.get(&url).send() => response,
                };

                match response {
                    Ok(response) => {
                        let next = consul_index(&response).unwrap_or(0);
                        if index != 0 && next != index {
                            tokio::time::sleep(RELOAD_DEBOUNCE).await;
                            match load(&client, &base_url, &prefix).await
                                .and_then(|bundle| shared.commit(bundle))
                            {
                                Ok(true) => info!("consul configuration reloaded"),
                                Ok(false) => debug!("consul configuration unchanged"),
                                Err(e) => warn!(error = %e, "consul reload rejected, previous snapshot retained"),
                            }
                        }
                        // A lower index means Consul reset its raft log.
                        index = if next < index { 0 } else { next };
                    }
                    Err(e) => {
                        warn!(error = %e, "consul watch query failed");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConfigStore for ConsulConfigStore {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.shared.snapshot()
    }

    fn informer(&self) -> watch::Receiver<u64> {
        self.shared.informer()
    }

    async fn update(&self) -> Result<bool, ConfigError> {
        let bundle = load(&self.client, &self.base_url, &self.prefix).await?;
        self.shared.commit(bundle)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConsulConfigStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads the full config tree into a bundle.
async fn load(
    client: &reqwest::Client,
    base_url: &str,
    prefix: &str,
) -> Result<RawBundle, ConfigError> {
    let url = format!("{base_url}/v1/kv/{prefix}/config/?recurse=true");
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ConfigError::Store(format!("consul request failed: {e}")))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(RawBundle::default());
    }
    if !response.status().is_success() {
        return Err(ConfigError::Store(format!(
            "consul returned {}",
            response.status()
        )));
    }

    let pairs: Vec<KvPair> = response
        .json()
        .await
        .map_err(|e| ConfigError::Store(format!("consul response malformed: {e}")))?;
    bundle_from_pairs(pairs, prefix)
}

/// Decodes and routes KV pairs into a bundle.
fn bundle_from_pairs(pairs: Vec<KvPair>, prefix: &str) -> Result<RawBundle, ConfigError> {
    let root = format!("{prefix}/config/");
    let mut bundle = RawBundle::default();

    for pair in pairs {
        let Some(key) = pair.key.strip_prefix(&root) else {
            continue;
        };
        let raw = match pair.value {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map_err(|e| ConfigError::Store(format!("consul value for {key} malformed: {e}")))?,
            None => Vec::new(),
        };
        bundle.insert_entry(key, &raw)?;
    }
    Ok(bundle)
}

/// Extracts the `X-Consul-Index` header.
fn consul_index(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("X-Consul-Index")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn read_store_config(path: &Path) -> Result<ConsulStoreConfig, ConfigError> {
    let raw = std::fs::read(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_slice(&raw)?),
        _ => Ok(serde_yaml::from_slice(&raw)?),
    }
}

fn base_url(cfg: &ConsulStoreConfig) -> String {
    if cfg.address.starts_with("http://") || cfg.address.starts_with("https://") {
        cfg.address.trim_end_matches('/').to_string()
    } else if cfg.tls_config.enabled {
        format!("https://{}", cfg.address)
    } else {
        format!("http://{}", cfg.address)
    }
}

fn build_client(cfg: &ConsulStoreConfig) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(5));

    if cfg.tls_config.enabled {
        if cfg.tls_config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !cfg.tls_config.ca_file.is_empty() {
            let pem = std::fs::read(&cfg.tls_config.ca_file)?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ConfigError::Store(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        if !cfg.tls_config.cert_file.is_empty() && !cfg.tls_config.key_file.is_empty() {
            let mut pem = std::fs::read(&cfg.tls_config.cert_file)?;
            pem.extend(std::fs::read(&cfg.tls_config.key_file)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ConfigError::Store(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
    }

    builder
        .build()
        .map_err(|e| ConfigError::Store(format!("client build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, raw: &[u8]) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: Some(STANDARD.encode(raw)),
        }
    }

    #[test]
    fn test_bundle_from_pairs_routes_and_decodes() {
        let pairs = vec![
            pair(
                "panoptes/config/devices/core1.bur",
                br#"{"host": "core1.lhr", "port": 50051, "sensors": ["sensor1"]}"#,
            ),
            pair(
                "panoptes/config/sensors/sensor1",
                br#"{"service": "juniper.jti", "path": "/interfaces/", "mode": "sample",
                     "sampleInterval": 10, "output":"console::stdout"}"#,
            ),
            pair("panoptes/config/global", br#"{"status": {"addr":"127.0.0.2:8081"}}"#),
            KvPair {
                key: "panoptes/config/".to_string(),
                value: None,
            },
            pair("unrelated/key", b"{}"),
        ];

        let bundle = bundle_from_pairs(pairs, "panoptes").unwrap();
        assert_eq!(bundle.devices.len(), 1);
        assert_eq!(bundle.sensors.len(), 1);
        assert_eq!(bundle.global.as_ref().unwrap().status.addr, "127.0.0.2:8081");

        let snapshot = bundle.build(1).unwrap();
        assert_eq!(snapshot.devices["core1.lhr:50051"].host, "core1.lhr");
    }

    #[test]
    fn test_bundle_from_pairs_rejects_bad_base64() {
        let pairs = vec![KvPair {
            key: "panoptes/config/global".to_string(),
            value: Some("not-base64!!".to_string()),
        }];
        assert!(bundle_from_pairs(pairs, "panoptes").is_err());
    }

    #[test]
    fn test_base_url_scheme_selection() {
        let mut cfg = ConsulStoreConfig::default();
        assert_eq!(base_url(&cfg), "http://127.0.0.1:8500");

        cfg.tls_config.enabled = true;
        assert_eq!(base_url(&cfg), "https://127.0.0.1:8500");

        cfg.address = "https://consul.example.com/".into();
        assert_eq!(base_url(&cfg), "https://consul.example.com");
    }

    #[test]
    fn test_store_config_defaults() {
        let cfg = ConsulStoreConfig::default();
        assert_eq!(cfg.prefix, "panoptes");
        assert!(!cfg.tls_config.enabled);
    }
}
