//! Configuration model shared by every store variant.
//!
//! All types deserialize from the JSON documents stored under the KV
//! prefix (or the equivalent blocks of the bootstrap file) and are
//! immutable once a snapshot is published.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// TLS settings for a device endpoint, a backing store, or the status
/// listener.
///
/// `cert_file`, `key_file`, and `ca_file` each hold either a filesystem
/// path or a remote secret reference (`vault::secret/panoptes/tls`);
/// the secret resolver decides which.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    /// Whether TLS is enabled for this endpoint.
    pub enabled: bool,
    /// Client certificate: path or remote reference.
    pub cert_file: String,
    /// Client key: path or remote reference.
    pub key_file: String,
    /// CA bundle: path or remote reference.
    pub ca_file: String,
    /// Skip server certificate verification.
    pub insecure_skip_verify: bool,
}

/// Subscription mode requested from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Periodic samples at `sample_interval`.
    #[default]
    Sample,
    /// Updates only when the value changes.
    OnChange,
    /// The target picks the mode per path.
    TargetDefined,
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sample => write!(f, "sample"),
            Self::OnChange => write!(f, "on_change"),
            Self::TargetDefined => write!(f, "target_defined"),
        }
    }
}

/// A subscription template installed on one or more devices.
///
/// Identity is the sensor's name within the config namespace (the map
/// key), not a field of the document itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sensor {
    /// Service dialect tag, e.g. `arista.gnmi`, `juniper.jti`, `cisco.mdt`.
    pub service: String,
    /// Optional path origin (gNMI `origin` field).
    pub origin: String,
    /// Telemetry path, slash-delimited with optional `[key=value]` selectors.
    pub path: String,
    /// Subscription mode.
    pub mode: SubscriptionMode,
    /// Sample interval in seconds. Required when `mode` is `sample`.
    pub sample_interval: u64,
    /// Heartbeat interval in seconds for `on_change` subscriptions.
    pub heartbeat_interval: u64,
    /// Ask the target to suppress unchanged values, and filter residual
    /// duplicates collector-side.
    pub suppress_redundant: bool,
    /// Output route in `adapter::name` form.
    pub output: String,
    /// Skip this sensor without removing it from the namespace.
    pub disabled: bool,
}

impl Sensor {
    /// Splits the output route into `(adapter, name)`.
    ///
    /// Returns `None` when the route is not of the `adapter::name` form.
    #[must_use]
    pub fn output_route(&self) -> Option<(&str, &str)> {
        parse_output_route(&self.output)
    }
}

/// Splits an `adapter::name` route string.
#[must_use]
pub fn parse_output_route(route: &str) -> Option<(&str, &str)> {
    let (adapter, name) = route.split_once("::")?;
    if adapter.is_empty() || name.is_empty() {
        return None;
    }
    Some((adapter, name))
}

/// Raw device document as stored in the KV tree: sensors are referenced
/// by name and resolved during snapshot build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Device hostname or address.
    pub host: String,
    /// gRPC port.
    pub port: u16,
    /// Username for metadata-based authentication (empty = none).
    pub username: String,
    /// Password for metadata-based authentication.
    pub password: String,
    /// Dial timeout in seconds (0 = engine default).
    pub timeout: u64,
    /// Device TLS settings.
    pub tls_config: TlsConfig,
    /// Names of sensors subscribed on this device.
    pub sensors: Vec<String>,
}

/// An addressable telemetry endpoint with its resolved sensors.
///
/// Identity is `host:port`. Devices are replaced, never mutated, on
/// reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    /// Device hostname or address.
    pub host: String,
    /// gRPC port.
    pub port: u16,
    /// Username for metadata-based authentication (empty = none).
    pub username: String,
    /// Password for metadata-based authentication.
    pub password: String,
    /// Dial timeout in seconds (0 = engine default).
    pub timeout: u64,
    /// Device TLS settings.
    pub tls_config: TlsConfig,
    /// Resolved sensors, keyed by sensor name.
    pub sensors: HashMap<String, Sensor>,
}

impl Device {
    /// The device identity used for sharding and the supervisor map.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Output adapter descriptor for a time-series database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Database {
    /// Adapter service tag, e.g. `influxdb`.
    pub service: String,
    /// Free-form adapter configuration.
    pub config: serde_json::Value,
}

/// Output adapter descriptor for a message producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Producer {
    /// Adapter service tag, e.g. `kafka` or `console`.
    pub service: String,
    /// Free-form adapter configuration.
    pub config: serde_json::Value,
}

/// Logger block of the global configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    /// Minimum level: `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Output encoding: `console` or `json`.
    pub encoding: String,
    /// Log destinations (only `stdout`/`stderr` are meaningful here).
    pub output_paths: Vec<String>,
    /// Error log destinations.
    pub error_output_paths: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            encoding: "console".into(),
            output_paths: vec!["stdout".into()],
            error_output_paths: vec!["stderr".into()],
        }
    }
}

/// Status endpoint block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusConfig {
    /// Listen address, `host:port`. Empty disables the endpoint.
    pub addr: String,
    /// TLS settings for the listener.
    pub tls_config: TlsConfig,
}

/// Shard block controlling cluster partitioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardConfig {
    /// Whether device sharding is enabled.
    pub enabled: bool,
    /// Expected cluster size.
    #[serde(alias = "number_of_nodes")]
    pub number_of_nodes: usize,
    /// Grace period in seconds before an initializing instance takes
    /// ownership.
    #[serde(alias = "initializing_shard")]
    pub initializing_shard: u64,
}

/// Discovery block selecting and configuring the service registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Registry service tag: `consul` or `etcd`. Empty disables discovery.
    pub service: String,
    /// Free-form registry configuration.
    pub config: serde_json::Value,
}

/// Process-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Global {
    /// Logger block.
    pub logger: LoggerConfig,
    /// Status endpoint block.
    pub status: StatusConfig,
    /// Shard block.
    pub shard: ShardConfig,
    /// Discovery block.
    pub discovery: DiscoveryConfig,
    /// Dispatch channel capacity (0 = default 1024).
    #[serde(alias = "buffer_size")]
    pub buffer_size: usize,
    /// Collector version string published in registry metadata.
    pub version: String,
}

/// Default dispatch channel capacity when `Global.buffer_size` is unset.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

impl Global {
    /// Dispatch channel capacity with the default applied.
    #[must_use]
    pub fn dispatch_capacity(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }
}
