//! # Panoptes-Stream Configuration
//!
//! The configuration plane: a pluggable store (local file, Consul KV,
//! or etcd) exposing devices, sensors, databases, producers, and the
//! global block as immutable snapshots, with change notification to the
//! running pipeline.
//!
//! ## Stores
//!
//! - [`FileConfigStore`]: bootstrap YAML/JSON file, mtime-polled
//! - [`ConsulConfigStore`]: KV tree under `<prefix>/config/`, watched
//!   via blocking queries
//! - [`EtcdConfigStore`]: same tree on etcd, watched natively
//!
//! All three share the reload discipline: read the full tree into a
//! [`RawBundle`], validate referential integrity, atomically swap the
//! published [`ConfigSnapshot`], and tick the informer only when the
//! new snapshot both differs and validated.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod consul;
pub mod etcd;
pub mod file;
pub mod model;
pub mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

pub use consul::ConsulConfigStore;
pub use etcd::EtcdConfigStore;
pub use file::FileConfigStore;
pub use model::{
    parse_output_route, Database, Device, DeviceConfig, DiscoveryConfig, Global, LoggerConfig,
    Producer, Sensor, ShardConfig, StatusConfig, SubscriptionMode, TlsConfig,
};
pub use snapshot::{ConfigSnapshot, RawBundle};

/// Environment variable overriding the Consul store address.
pub const ENV_CONSUL_ADDRESS: &str = "PANOPTES_CONFIG_CONSUL_ADDRESS";

/// Environment variable overriding the etcd store address.
pub const ENV_ETCD_ADDRESS: &str = "PANOPTES_CONFIG_ETCD_ADDRESS";

/// Debounce applied between a change notification and the reload.
pub const RELOAD_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(250);

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error while reading the bootstrap file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed JSON document.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A malformed YAML document.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The snapshot failed referential-integrity validation.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The `global` document is absent from the store.
    #[error("missing global configuration")]
    MissingGlobal,

    /// A backing-store request failed.
    #[error("store error: {0}")]
    Store(String),
}

/// A configuration store publishing consistent snapshots.
///
/// All five collections of a [`ConfigSnapshot`] reflect the same
/// generation; consumers hold the `Arc` for as long as they need a
/// stable view.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The current committed snapshot.
    fn snapshot(&self) -> Arc<ConfigSnapshot>;

    /// A receiver ticked with the new generation on every committed
    /// reload.
    fn informer(&self) -> watch::Receiver<u64>;

    /// Forces a synchronous reload.
    ///
    /// Returns `Ok(true)` when a new snapshot was committed, `Ok(false)`
    /// when the store contents were unchanged.
    ///
    /// # Errors
    ///
    /// Returns the load or validation error; the previous snapshot is
    /// retained either way.
    async fn update(&self) -> Result<bool, ConfigError>;

    /// Stops background watcher tasks.
    fn stop(&self);
}
