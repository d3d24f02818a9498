//! etcd service-registry adapter.
//!
//! Registration is a lease-backed key under
//! `<prefix>/services/panoptes/`; the lease keepalive doubles as the
//! liveness signal, so a registered key is a `passing` instance.
//! Slot allocation runs under etcd's native lock API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, GetOptions, Identity, LockOptions, TlsOptions,
    WatchOptions,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use panoptes_config::{ConfigStore, Global, TlsConfig};

use crate::{
    allocate_slot, hostname, registration_meta, Discovery, DiscoveryError, Instance,
    SlotDecision, GLOBAL_LOCK_KEY, LOCK_DEADLINE, LOCK_TTL, SERVICE_NAME,
};

/// Environment variable overriding the etcd registry address.
pub const ENV_DISCOVERY_ETCD_ADDRESS: &str = "PANOPTES_DISCOVERY_ETCD_ADDRESS";

/// TTL of the registration lease.
const REGISTRATION_TTL: Duration = Duration::from_secs(15);

/// Keepalive cadence for the registration lease.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Registry settings from `Global.discovery.config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdRegistryConfig {
    /// etcd endpoints, `host:port`.
    pub endpoints: Vec<String>,
    /// Key prefix the registry tree lives under.
    pub prefix: String,
    /// TLS settings for the client connection (filesystem paths).
    pub tls_config: TlsConfig,
}

impl Default for EtcdRegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".into()],
            prefix: "panoptes".into(),
            tls_config: TlsConfig::default(),
        }
    }
}

/// The JSON document stored per registered instance.
#[derive(Debug, Serialize, Deserialize)]
struct RegisteredInstance {
    id: String,
    address: String,
    meta: HashMap<String, String>,
}

/// Service registry backed by etcd.
pub struct EtcdRegistry {
    client: Client,
    root: String,
    config: Arc<dyn ConfigStore>,
    local_hostname: String,
    id: RwLock<Option<String>>,
    lease: RwLock<Option<i64>>,
    keepalive_cancel: RwLock<Option<CancellationToken>>,
    membership: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl EtcdRegistry {
    /// Connects from `Global.discovery.config` and starts the
    /// membership watcher.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotConfigured`] for a malformed discovery
    /// block, [`DiscoveryError::Request`] when etcd is unreachable.
    pub async fn new(config: Arc<dyn ConfigStore>) -> Result<Self, DiscoveryError> {
        let discovery = config.snapshot().global.discovery.clone();
        let mut registry_config = if discovery.config.is_null() {
            EtcdRegistryConfig::default()
        } else {
            serde_json::from_value(discovery.config)
                .map_err(|e| DiscoveryError::NotConfigured(e.to_string()))?
        };
        if let Ok(addr) = std::env::var(ENV_DISCOVERY_ETCD_ADDRESS) {
            if !addr.is_empty() {
                registry_config.endpoints = vec![addr];
            }
        }

        let options = connect_options(&registry_config)?;
        let client = Client::connect(registry_config.endpoints.clone(), options)
            .await
            .map_err(|e| DiscoveryError::Request(format!("etcd connect failed: {e}")))?;

        let root = format!("{}/services/{SERVICE_NAME}/", registry_config.prefix);
        let (membership, _) = watch::channel(0);

        let registry = Self {
            client,
            root,
            config,
            local_hostname: hostname(),
            id: RwLock::new(None),
            lease: RwLock::new(None),
            keepalive_cancel: RwLock::new(None),
            membership,
            cancel: CancellationToken::new(),
        };
        registry.spawn_watcher();
        Ok(registry)
    }

    /// Allocates the slot and writes the lease-backed registration
    /// key. Runs under the global lock.
    async fn register_locked(&self, global: &Global) -> Result<String, DiscoveryError> {
        let instances = self.instances().await?;
        let decision = allocate_slot(&instances, &self.local_hostname, &global.shard)?;
        let id = decision.id().to_string();

        let mut client = self.client.clone();
        #[allow(clippy::cast_possible_wrap)]
        let lease = client
            .lease_grant(REGISTRATION_TTL.as_secs() as i64, None)
            .await
            .map_err(|e| DiscoveryError::Request(format!("lease grant failed: {e}")))?
            .id();

        let document = RegisteredInstance {
            id: id.clone(),
            address: self.local_hostname.clone(),
            meta: registration_meta(global),
        };
        let value = serde_json::to_vec(&document)
            .map_err(|e| DiscoveryError::Request(format!("registration encode failed: {e}")))?;
        client
            .put(
                format!("{}{id}", self.root),
                value,
                Some(etcd_client::PutOptions::new().with_lease(lease)),
            )
            .await
            .map_err(|e| DiscoveryError::Request(format!("registration put failed: {e}")))?;

        self.start_keepalive(lease);
        *self.lease.write() = Some(lease);

        match decision {
            SlotDecision::Recovered(_) => info!(id, "etcd service registry recovered"),
            SlotDecision::New(_) => info!(id, "etcd service registered"),
        }
        Ok(id)
    }

    /// Spawns the lease keepalive task, replacing any previous one.
    fn start_keepalive(&self, lease: i64) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.keepalive_cancel.write().replace(cancel.clone()) {
            previous.cancel();
        }

        let client = self.client.clone();
        let parent = self.cancel.clone();
        tokio::spawn(async move {
            let Ok((mut keeper, mut stream)) = client.clone().lease_keep_alive(lease).await else {
                warn!(lease, "lease keepalive stream failed to start");
                return;
            };
            let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = parent.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            warn!(lease, error = %e, "lease keepalive failed");
                            break;
                        }
                    }
                    message = stream.message() => {
                        if message.is_err() {
                            warn!(lease, "lease keepalive stream closed");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Watches the registration prefix and ticks the membership
    /// channel per event batch.
    fn spawn_watcher(&self) {
        let client = self.client.clone();
        let root = self.root.clone();
        let membership = self.membership.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut version: u64 = 0;
            loop {
                let mut watch_client = client.clone();
                let built = tokio::select! {
                    () = cancel.cancelled() => break,
                    built = watch_client.watch(root.as_str(), Some(WatchOptions::new().with_prefix())) => built,
                };
                let (_watcher, mut stream) = match built {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "etcd membership watch failed to start");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(Duration::from_secs(2)) => continue,
                        }
                    }
                };

                loop {
                    let message = tokio::select! {
                        () = cancel.cancelled() => return,
                        message = stream.message() => message,
                    };
                    match message {
                        Ok(Some(response)) if !response.events().is_empty() => {
                            version += 1;
                            let _ = membership.send(version);
                            info!("etcd membership changed");
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => {
                            warn!("etcd membership watch stream closed, rebuilding");
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn register(&self) -> Result<(), DiscoveryError> {
        let global = self.config.snapshot().global.clone();
        let mut client = self.client.clone();

        #[allow(clippy::cast_possible_wrap)]
        let lock_lease = client
            .lease_grant(LOCK_TTL.as_secs() as i64, None)
            .await
            .map_err(|e| DiscoveryError::Request(format!("lock lease failed: {e}")))?
            .id();

        let lock = match tokio::time::timeout(
            LOCK_DEADLINE,
            client.lock(GLOBAL_LOCK_KEY, Some(LockOptions::new().with_lease(lock_lease))),
        )
        .await
        {
            Ok(Ok(lock)) => lock,
            Ok(Err(e)) => {
                let _ = client.lease_revoke(lock_lease).await;
                return Err(DiscoveryError::Request(format!("lock failed: {e}")));
            }
            Err(_) => {
                // Revoking the lease releases the pending lock request.
                let _ = client.lease_revoke(lock_lease).await;
                return Err(DiscoveryError::LockTimeout);
            }
        };

        let result = self.register_locked(&global).await;
        if let Err(e) = client.unlock(lock.key().to_vec()).await {
            warn!(error = %e, "lock release failed, lease TTL will reclaim it");
        }
        let _ = client.lease_revoke(lock_lease).await;

        let id = result?;
        *self.id.write() = Some(id);
        Ok(())
    }

    async fn deregister(&self) -> Result<(), DiscoveryError> {
        if let Some(cancel) = self.keepalive_cancel.write().take() {
            cancel.cancel();
        }
        let Some(id) = self.id.read().clone() else {
            return Ok(());
        };

        let mut client = self.client.clone();
        client
            .delete(format!("{}{id}", self.root), None)
            .await
            .map_err(|e| DiscoveryError::Request(format!("deregister failed: {e}")))?;
        let lease = self.lease.write().take();
        if let Some(lease) = lease {
            let _ = client.lease_revoke(lease).await;
        }
        info!(id, "etcd service deregistered");
        Ok(())
    }

    async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut client = self.client.clone();
        let response = client
            .get(self.root.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::Request(format!("instance listing failed: {e}")))?;

        let mut instances = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<RegisteredInstance>(kv.value()) {
                Ok(document) => instances.push(Instance {
                    id: document.id,
                    address: document.address,
                    meta: document.meta,
                    // A live lease-backed key is a healthy instance.
                    status: "passing".to_string(),
                }),
                Err(e) => warn!(error = %e, "skipping malformed registration document"),
            }
        }
        Ok(instances)
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

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn connect_options(cfg: &EtcdRegistryConfig) -> Result<Option<ConnectOptions>, DiscoveryError> {
    if !cfg.tls_config.enabled {
        return Ok(None);
    }

    let mut tls = TlsOptions::new();
    if !cfg.tls_config.ca_file.is_empty() {
        let pem = read_pem(&cfg.tls_config.ca_file)?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }
    if !cfg.tls_config.cert_file.is_empty() && !cfg.tls_config.key_file.is_empty() {
        let cert = read_pem(&cfg.tls_config.cert_file)?;
        let key = read_pem(&cfg.tls_config.key_file)?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    Ok(Some(ConnectOptions::new().with_tls(tls)))
}

fn read_pem(path: &str) -> Result<Vec<u8>, DiscoveryError> {
    std::fs::read(Path::new(path))
        .map_err(|e| DiscoveryError::NotConfigured(format!("{path} unreadable: {e}")))
}
