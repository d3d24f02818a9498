//! Consul service-registry adapter.
//!
//! Registers the collector as an agent service with an HTTP health
//! check, allocates its slot id under a session-backed global lock,
//! and watches the service's membership with blocking queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use panoptes_config::{ConfigStore, Global, TlsConfig};

use crate::{
    allocate_slot, healthcheck_url, hostname, registration_meta, Discovery, DiscoveryError,
    Instance, SlotDecision, GLOBAL_LOCK_KEY, LOCK_DEADLINE, LOCK_TTL, SERVICE_NAME,
};

/// Environment variable overriding the Consul registry address.
pub const ENV_DISCOVERY_CONSUL_ADDRESS: &str = "PANOPTES_DISCOVERY_CONSUL_ADDRESS";

/// Wait horizon for membership blocking queries.
const BLOCKING_WAIT: &str = "55s";

/// Delay before retrying a failed lock acquisition or watch query.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Registry settings from `Global.discovery.config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulRegistryConfig {
    /// Consul agent address, `host:port` or a full URL.
    pub address: String,
    /// TLS settings for the agent connection (filesystem paths).
    pub tls_config: TlsConfig,
}

impl Default for ConsulRegistryConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".into(),
            tls_config: TlsConfig::default(),
        }
    }
}

/// One entry of the agent health-by-service-name response.
#[derive(Debug, Deserialize)]
struct HealthInfo {
    #[serde(rename = "AggregatedStatus")]
    aggregated_status: String,
    #[serde(rename = "Service")]
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

/// Service registry backed by a Consul agent.
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    config: Arc<dyn ConfigStore>,
    local_hostname: String,
    id: RwLock<Option<String>>,
    membership: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl ConsulRegistry {
    /// Builds the adapter from `Global.discovery.config` and starts
    /// the membership watcher.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotConfigured`] when the discovery block is
    /// malformed.
    pub fn new(config: Arc<dyn ConfigStore>) -> Result<Self, DiscoveryError> {
        let discovery = config.snapshot().global.discovery.clone();
        let mut registry_config = if discovery.config.is_null() {
            ConsulRegistryConfig::default()
        } else {
            serde_json::from_value(discovery.config)
                .map_err(|e| DiscoveryError::NotConfigured(e.to_string()))?
        };
        if let Ok(addr) = std::env::var(ENV_DISCOVERY_CONSUL_ADDRESS) {
            if !addr.is_empty() {
                registry_config.address = addr;
            }
        }

        let client = build_client(&registry_config)?;
        let base_url = base_url(&registry_config);
        let (membership, _) = watch::channel(0);

        let registry = Self {
            client,
            base_url,
            config,
            local_hostname: hostname(),
            id: RwLock::new(None),
            membership,
            cancel: CancellationToken::new(),
        };
        registry.spawn_watcher();
        Ok(registry)
    }

    /// Creates the lock session and contends for the global lock until
    /// the deadline.
    async fn acquire_lock(&self) -> Result<String, DiscoveryError> {
        let url = format!("{}/v1/session/create", self.base_url);
        let body = json!({
            "TTL": format!("{}s", LOCK_TTL.as_secs()),
            "Behavior": "delete",
        });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("session create failed: {e}")))?;

        #[derive(Deserialize)]
        struct Session {
            #[serde(rename = "ID")]
            id: String,
        }
        let session: Session = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Request(format!("session response malformed: {e}")))?;

        let deadline = tokio::time::Instant::now() + LOCK_DEADLINE;
        loop {
            let url = format!(
                "{}/v1/kv/{GLOBAL_LOCK_KEY}?acquire={}",
                self.base_url, session.id
            );
            let acquired = self
                .client
                .put(&url)
                .body(self.local_hostname.clone())
                .send()
                .await
                .map_err(|e| DiscoveryError::Request(format!("lock acquire failed: {e}")))?
                .json::<bool>()
                .await
                .unwrap_or(false);

            if acquired {
                return Ok(session.id);
            }
            if tokio::time::Instant::now() + RETRY_DELAY >= deadline {
                self.destroy_session(&session.id).await;
                return Err(DiscoveryError::LockTimeout);
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn release_lock(&self, session: &str) {
        let url = format!("{}/v1/kv/{GLOBAL_LOCK_KEY}?release={session}", self.base_url);
        if let Err(e) = self.client.put(&url).send().await {
            warn!(error = %e, "lock release failed, session TTL will reclaim it");
        }
        self.destroy_session(session).await;
    }

    async fn destroy_session(&self, session: &str) {
        let url = format!("{}/v1/session/destroy/{session}", self.base_url);
        if let Err(e) = self.client.put(&url).send().await {
            warn!(error = %e, "session destroy failed");
        }
    }

    /// Allocates the slot and registers the agent service. Runs under
    /// the global lock.
    async fn register_locked(&self, global: &Global) -> Result<String, DiscoveryError> {
        let instances = self.instances().await?;
        let decision = allocate_slot(&instances, &self.local_hostname, &global.shard)?;
        let id = decision.id().to_string();

        let registration = json!({
            "ID": id,
            "Name": SERVICE_NAME,
            "Address": self.local_hostname,
            "Meta": registration_meta(global),
            "Check": {
                "HTTP": healthcheck_url(&global.status),
                "Interval": "10s",
                "Timeout": "2s",
            },
        });
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&registration)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("service register failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Request(format!(
                "service register returned {}",
                response.status()
            )));
        }

        match decision {
            SlotDecision::Recovered(_) => info!(id, "consul service registry recovered"),
            SlotDecision::New(_) => info!(id, "consul service registered"),
        }
        Ok(id)
    }

    /// Watches the service's health entries and ticks the membership
    /// channel on every index change.
    fn spawn_watcher(&self) {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let membership = self.membership.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            let mut version: u64 = 0;
            loop {
                let url = format!(
                    "{base_url}/v1/health/service/{SERVICE_NAME}?index={index}&wait={BLOCKING_WAIT}"
                );
                let response = tokio::select! {
                    () = cancel.cancelled() => break,
                    response = client.get(&url).send() => response,
                };

                match response {
                    Ok(response) => {
                        let next = response
                            .headers()
                            .get("X-Consul-Index")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        if index != 0 && next != index {
                            version += 1;
                            let _ = membership.send(version);
                            info!("consul membership changed");
                        }
                        index = if next < index { 0 } else { next };
                    }
                    Err(e) => {
                        warn!(error = %e, "consul membership watch failed");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(Duration::from_secs(2)) => {}
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Discovery for ConsulRegistry {
    async fn register(&self) -> Result<(), DiscoveryError> {
        let global = self.config.snapshot().global.clone();
        let session = self.acquire_lock().await?;
        let result = self.register_locked(&global).await;
        self.release_lock(&session).await;

        let id = result?;
        *self.id.write() = Some(id);
        Ok(())
    }

    async fn deregister(&self) -> Result<(), DiscoveryError> {
        let Some(id) = self.id.read().clone() else {
            return Ok(());
        };
        let url = format!("{}/v1/agent/service/deregister/{id}", self.base_url);
        self.client
            .put(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("deregister failed: {e}")))?;
        info!(id, "consul service deregistered");
        Ok(())
    }

    async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let url = format!(
            "{}/v1/agent/health/service/name/{SERVICE_NAME}",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("health listing failed: {e}")))?;

        // The endpoint mirrors the aggregated status in its HTTP code:
        // 200 passing, 429 warning, 503 critical. All carry the body.
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success()
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
            && status != reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            return Err(DiscoveryError::Request(format!(
                "health listing returned {status}"
            )));
        }

        let entries: Vec<HealthInfo> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Request(format!("health listing malformed: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|entry| Instance {
                id: entry.service.id,
                address: entry.service.address,
                meta: entry.service.meta,
                status: entry.aggregated_status,
            })
            .collect())
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn base_url(cfg: &ConsulRegistryConfig) -> String {
    if cfg.address.starts_with("http://") || cfg.address.starts_with("https://") {
        cfg.address.trim_end_matches('/').to_string()
    } else if cfg.tls_config.enabled {
        format!("https://{}", cfg.address)
    } else {
        format!("http://{}", cfg.address)
    }
}

fn build_client(cfg: &ConsulRegistryConfig) -> Result<reqwest::Client, DiscoveryError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(5));

    if cfg.tls_config.enabled {
        if cfg.tls_config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !cfg.tls_config.ca_file.is_empty() {
            let pem = std::fs::read(&cfg.tls_config.ca_file)
                .map_err(|e| DiscoveryError::NotConfigured(format!("CA bundle unreadable: {e}")))?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| DiscoveryError::NotConfigured(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        if !cfg.tls_config.cert_file.is_empty() && !cfg.tls_config.key_file.is_empty() {
            let mut pem = std::fs::read(&cfg.tls_config.cert_file)
                .map_err(|e| DiscoveryError::NotConfigured(format!("certificate unreadable: {e}")))?;
            pem.extend(std::fs::read(&cfg.tls_config.key_file).map_err(|e| {
                DiscoveryError::NotConfigured(format!("key unreadable: {e}"))
            })?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| DiscoveryError::NotConfigured(format!("invalid identity: {e}")))?;
            builder = builder.identity(identity);
        }
    }

    builder
        .build()
        .map_err(|e| DiscoveryError::NotConfigured(format!("client build failed: {e}")))
}
