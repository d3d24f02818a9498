//! # Panoptes-Stream Discovery
//!
//! Cluster membership via a service registry with leader-style numeric
//! slot allocation, plus the consistent hash that partitions devices
//! across live instances.
//!
//! ## Adapters
//!
//! - [`ConsulRegistry`]: agent service registration with an HTTP health
//!   check, session-based global lock, blocking-query membership watch
//! - [`EtcdRegistry`]: lease-backed registration, native lock and watch
//!
//! Slot allocation runs under the distributed lock
//! `panoptes_global_lock`: an instance whose hostname is already
//! registered recovers its id; otherwise the lowest absent
//! non-negative integer is taken.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod consul;
pub mod etcd;
pub mod shard;

use std::collections::HashMap;

use async_trait::async_trait;
use panoptes_config::ShardConfig;
use tokio::sync::watch;
use tracing::warn;

pub use consul::ConsulRegistry;
pub use etcd::EtcdRegistry;
pub use shard::ShardRing;

/// The service name every collector registers under.
pub const SERVICE_NAME: &str = "panoptes";

/// The key of the distributed lock serializing slot allocation.
pub const GLOBAL_LOCK_KEY: &str = "panoptes_global_lock";

/// Session/lease TTL backing the distributed lock.
pub const LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(10);

/// Deadline for acquiring the distributed lock.
pub const LOCK_DEADLINE: std::time::Duration = std::time::Duration::from_secs(15);

/// A registered collector instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    /// Slot id as a decimal string: `"0"`, `"1"`, …
    pub id: String,
    /// Instance hostname.
    pub address: String,
    /// Registration metadata (`shard_enabled`, `shard_nodes`, `version`).
    pub meta: HashMap<String, String>,
    /// Aggregated health status (`passing` when healthy).
    pub status: String,
}

impl Instance {
    /// Whether the instance participates in the shard ring.
    #[must_use]
    pub fn is_passing(&self) -> bool {
        self.status == "passing"
    }
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery block is missing or malformed.
    #[error("discovery not configured: {0}")]
    NotConfigured(String),

    /// A registry request failed.
    #[error("registry request failed: {0}")]
    Request(String),

    /// The global lock could not be acquired within the deadline.
    #[error("could not acquire {GLOBAL_LOCK_KEY} within {LOCK_DEADLINE:?}")]
    LockTimeout,

    /// A recovered slot id falls outside the configured cluster size.
    #[error("recovered slot {id} exceeds shard.numberOfNodes {nodes}; refusing to register")]
    InvalidSlot {
        /// The recovered id.
        id: usize,
        /// The configured cluster size.
        nodes: usize,
    },
}

/// A service registry the collector registers with.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Registers the local instance, allocating or recovering its slot
    /// id under the global lock.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`]; the caller retries indefinitely and
    /// gates sharded workloads until registration succeeds.
    async fn register(&self) -> Result<(), DiscoveryError>;

    /// Removes the local instance from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Request`] when the registry call fails.
    async fn deregister(&self) -> Result<(), DiscoveryError>;

    /// Lists all registered instances with their health status.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Request`] when the registry call fails.
    async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError>;

    /// A receiver ticked on every membership change.
    fn watch(&self) -> watch::Receiver<u64>;

    /// The slot id assigned by [`register`](Discovery::register), when
    /// registered.
    fn id(&self) -> Option<String>;

    /// Stops background watcher tasks.
    fn stop(&self);
}

/// The local hostname used as the instance address.
#[must_use]
pub fn hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

/// The lowest non-negative integer absent from `ids`, as a decimal
/// string: first gap wins, else `len(ids)`.
#[must_use]
pub fn next_slot_id(mut ids: Vec<usize>) -> String {
    ids.sort_unstable();
    for (position, id) in ids.iter().enumerate() {
        if position != *id {
            return position.to_string();
        }
    }
    ids.len().to_string()
}

/// Outcome of slot allocation for the local instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDecision {
    /// The hostname was already registered; its id is reused.
    Recovered(String),
    /// A fresh id was allocated.
    New(String),
}

impl SlotDecision {
    /// The allocated id either way.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Recovered(id) | Self::New(id) => id,
        }
    }
}

/// Allocates the local slot from the current instance set.
///
/// Must be called while holding the global lock. Ids that do not parse
/// as integers are skipped with a warning, matching the registry's
/// tolerance for foreign registrations under the service name.
///
/// # Errors
///
/// [`DiscoveryError::InvalidSlot`] when sharding is enabled and the
/// recovered id falls outside `shard.numberOfNodes`.
pub fn allocate_slot(
    instances: &[Instance],
    local_hostname: &str,
    shard: &ShardConfig,
) -> Result<SlotDecision, DiscoveryError> {
    let mut ids = Vec::with_capacity(instances.len());

    for instance in instances {
        let Ok(id) = instance.id.parse::<usize>() else {
            warn!(id = %instance.id, "skipping instance with non-numeric id");
            continue;
        };
        if instance.address == local_hostname {
            if shard.enabled && shard.number_of_nodes > 0 && id >= shard.number_of_nodes {
                return Err(DiscoveryError::InvalidSlot {
                    id,
                    nodes: shard.number_of_nodes,
                });
            }
            return Ok(SlotDecision::Recovered(instance.id.clone()));
        }
        ids.push(id);
    }

    Ok(SlotDecision::New(next_slot_id(ids)))
}

/// Registration metadata published for the instance.
#[must_use]
pub fn registration_meta(global: &panoptes_config::Global) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    meta.insert("shard_enabled".to_string(), global.shard.enabled.to_string());
    meta.insert(
        "shard_nodes".to_string(),
        global.shard.number_of_nodes.to_string(),
    );
    meta.insert("version".to_string(), global.version.clone());
    meta
}

/// The health-check URL derived from the status block.
#[must_use]
pub fn healthcheck_url(status: &panoptes_config::StatusConfig) -> String {
    let scheme = if status.tls_config.enabled { "https" } else { "http" };
    format!("{scheme}://{}/healthcheck", status.addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, address: &str) -> Instance {
        Instance {
            id: id.to_string(),
            address: address.to_string(),
            meta: HashMap::new(),
            status: "passing".to_string(),
        }
    }

    #[test]
    fn test_next_slot_id() {
        assert_eq!(next_slot_id(vec![]), "0");
        assert_eq!(next_slot_id(vec![0]), "1");
        assert_eq!(next_slot_id(vec![0, 2]), "1");
        assert_eq!(next_slot_id(vec![0, 1, 2]), "3");
        assert_eq!(next_slot_id(vec![2, 0]), "1");
        assert_eq!(next_slot_id(vec![1, 2]), "0");
    }

    #[test]
    fn test_allocate_slot_recovers_existing_hostname() {
        let instances = vec![instance("0", "other"), instance("2", "local")];
        let decision = allocate_slot(&instances, "local", &ShardConfig::default()).unwrap();
        assert_eq!(decision, SlotDecision::Recovered("2".to_string()));
    }

    #[test]
    fn test_allocate_slot_takes_first_gap() {
        let instances = vec![instance("0", "a"), instance("2", "b")];
        let decision = allocate_slot(&instances, "local", &ShardConfig::default()).unwrap();
        assert_eq!(decision, SlotDecision::New("1".to_string()));
    }

    #[test]
    fn test_allocate_slot_skips_foreign_ids() {
        let instances = vec![instance("primary", "a"), instance("0", "b")];
        let decision = allocate_slot(&instances, "local", &ShardConfig::default()).unwrap();
        assert_eq!(decision, SlotDecision::New("1".to_string()));
    }

    #[test]
    fn test_allocate_slot_refuses_out_of_range_recovery() {
        let shard = ShardConfig {
            enabled: true,
            number_of_nodes: 2,
            initializing_shard: 0,
        };
        let instances = vec![instance("2", "local")];
        let err = allocate_slot(&instances, "local", &shard).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidSlot { id: 2, nodes: 2 }));
    }

    #[test]
    fn test_sequential_allocation_is_dense() {
        // N registrations serialized by the lock yield ids {0..N-1}.
        let mut instances = Vec::new();
        for n in 0..5 {
            let host = format!("host-{n}");
            let decision = allocate_slot(&instances, &host, &ShardConfig::default()).unwrap();
            let SlotDecision::New(id) = decision else {
                panic!("fresh hostname must allocate a new id");
            };
            instances.push(instance(&id, &host));
        }

        let mut ids: Vec<usize> = instances.iter().map(|i| i.id.parse().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_healthcheck_url_scheme() {
        let mut status = panoptes_config::StatusConfig {
            addr: "127.0.0.2:8081".into(),
            ..panoptes_config::StatusConfig::default()
        };
        assert_eq!(healthcheck_url(&status), "http://127.0.0.2:8081/healthcheck");
        status.tls_config.enabled = true;
        assert_eq!(healthcheck_url(&status), "https://127.0.0.2:8081/healthcheck");
    }
}
