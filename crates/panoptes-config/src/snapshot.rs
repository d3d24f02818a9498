//! Snapshot assembly, validation, and the atomic swap barrier.
//!
//! Every store variant loads the full tree into a [`RawBundle`], then
//! commits it through [`SharedState`]: build → validate → swap → tick.
//! A bundle that fails validation never replaces the published
//! snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::model::{
    parse_output_route, Database, Device, DeviceConfig, Global, Producer, Sensor,
    SubscriptionMode,
};
use crate::ConfigError;

/// An immutable, validated configuration generation.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// Monotonic generation counter, bumped per committed reload.
    pub generation: u64,
    /// Devices keyed by `host:port`.
    pub devices: HashMap<String, Device>,
    /// Sensors keyed by name.
    pub sensors: HashMap<String, Sensor>,
    /// Database adapters keyed by name.
    pub databases: HashMap<String, Database>,
    /// Producer adapters keyed by name.
    pub producers: HashMap<String, Producer>,
    /// Process-wide settings.
    pub global: Global,
}

impl ConfigSnapshot {
    /// Compares everything except the generation counter.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        self.devices == other.devices
            && self.sensors == other.sensors
            && self.databases == other.databases
            && self.producers == other.producers
            && self.global == other.global
    }
}

/// The raw documents of one load, before resolution and validation.
#[derive(Debug, Default)]
pub struct RawBundle {
    /// Device documents keyed by their KV entry name.
    pub devices: HashMap<String, DeviceConfig>,
    /// Sensor documents keyed by name.
    pub sensors: HashMap<String, Sensor>,
    /// Database documents keyed by name.
    pub databases: HashMap<String, Database>,
    /// Producer documents keyed by name.
    pub producers: HashMap<String, Producer>,
    /// The global document, when present.
    pub global: Option<Global>,
}

impl RawBundle {
    /// Routes one KV entry into the bundle.
    ///
    /// `key` is the path relative to `<prefix>/config/`, e.g.
    /// `devices/core1.bur` or `global`. Empty values (directory
    /// placeholders) and unknown key families are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] when the value is malformed.
    pub fn insert_entry(&mut self, key: &str, raw: &[u8]) -> Result<(), ConfigError> {
        if key.is_empty() || raw.is_empty() {
            return Ok(());
        }

        match key.split_once('/') {
            Some(("devices", name)) if !name.is_empty() => {
                self.devices.insert(name.to_string(), serde_json::from_slice(raw)?);
            }
            Some(("sensors", name)) if !name.is_empty() => {
                self.sensors.insert(name.to_string(), serde_json::from_slice(raw)?);
            }
            Some(("databases", name)) if !name.is_empty() => {
                self.databases.insert(name.to_string(), serde_json::from_slice(raw)?);
            }
            Some(("producers", name)) if !name.is_empty() => {
                self.producers.insert(name.to_string(), serde_json::from_slice(raw)?);
            }
            None if key == "global" => {
                self.global = Some(serde_json::from_slice(raw)?);
            }
            _ => {
                tracing::debug!(key, "ignoring unrecognized config entry");
            }
        }
        Ok(())
    }

    /// Resolves and validates the bundle into a snapshot.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingGlobal`] when no global document was
    /// loaded; [`ConfigError::Validation`] listing every referential
    /// problem found.
    pub fn build(self, generation: u64) -> Result<ConfigSnapshot, ConfigError> {
        let global = self.global.ok_or(ConfigError::MissingGlobal)?;

        let mut producers = self.producers;
        // The console producer is always available as a sink.
        producers
            .entry("console".to_string())
            .or_insert_with(|| Producer {
                service: "console".to_string(),
                config: serde_json::Value::Null,
            });

        let mut problems = Vec::new();

        for (name, sensor) in &self.sensors {
            match parse_output_route(&sensor.output) {
                Some((adapter, _)) => {
                    if !self.databases.contains_key(adapter) && !producers.contains_key(adapter) {
                        problems.push(format!(
                            "sensor {name}: output adapter {adapter} is not a configured database or producer"
                        ));
                    }
                }
                None => problems.push(format!(
                    "sensor {name}: output {:?} is not of the adapter::name form",
                    sensor.output
                )),
            }
            if sensor.mode == SubscriptionMode::Sample && sensor.sample_interval == 0 {
                problems.push(format!("sensor {name}: sample mode requires sampleInterval"));
            }
        }

        let mut devices = HashMap::with_capacity(self.devices.len());
        for (name, raw) in self.devices {
            if raw.host.is_empty() || raw.port == 0 {
                problems.push(format!("device {name}: host and port are required"));
                continue;
            }

            let mut sensors = HashMap::with_capacity(raw.sensors.len());
            for sensor_name in &raw.sensors {
                match self.sensors.get(sensor_name) {
                    Some(sensor) => {
                        sensors.insert(sensor_name.clone(), sensor.clone());
                    }
                    None => problems.push(format!(
                        "device {name}: references unknown sensor {sensor_name}"
                    )),
                }
            }

            let device = Device {
                host: raw.host,
                port: raw.port,
                username: raw.username,
                password: raw.password,
                timeout: raw.timeout,
                tls_config: raw.tls_config,
                sensors,
            };
            devices.insert(device.key(), device);
        }

        if !problems.is_empty() {
            return Err(ConfigError::Validation(problems.join("; ")));
        }

        Ok(ConfigSnapshot {
            generation,
            devices,
            sensors: self.sensors,
            databases: self.databases,
            producers,
            global,
        })
    }
}

/// The swap barrier shared between a store front-end and its watcher
/// task. Single writer per store; readers clone the `Arc`.
#[derive(Debug)]
pub(crate) struct SharedState {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    generation: AtomicU64,
    informer: watch::Sender<u64>,
}

impl SharedState {
    pub(crate) fn new(initial: ConfigSnapshot) -> Self {
        let generation = initial.generation;
        let (informer, _) = watch::channel(generation);
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
            generation: AtomicU64::new(generation),
            informer,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub(crate) fn informer(&self) -> watch::Receiver<u64> {
        self.informer.subscribe()
    }

    /// Builds and commits a bundle. Ticks the informer only when the
    /// snapshot both validated and differs from the published one.
    pub(crate) fn commit(&self, bundle: RawBundle) -> Result<bool, ConfigError> {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let next = bundle.build(generation)?;

        {
            let mut guard = self.snapshot.write();
            if guard.same_contents(&next) {
                return Ok(false);
            }
            *guard = Arc::new(next);
            self.generation.store(generation, Ordering::Release);
        }

        let _ = self.informer.send(generation);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_global() -> RawBundle {
        let mut bundle = RawBundle::default();
        bundle.global = Some(Global::default());
        bundle
    }

    fn populated_bundle() -> RawBundle {
        let mut bundle = bundle_with_global();
        bundle
            .insert_entry(
                "devices/core1.bur",
                br#"{"host": "core1.lhr", "port": 50051, "sensors": ["sensor1"]}"#,
            )
            .unwrap();
        bundle
            .insert_entry(
                "sensors/sensor1",
                br#"{"service": "juniper.jti", "path": "/interfaces/", "mode": "sample",
                     "sampleInterval": 10, "output":"console::stdout"}"#,
            )
            .unwrap();
        bundle
            .insert_entry(
                "databases/db1",
                br#"{"service": "influxdb", "config": {"server": "https://localhost:8086"}}"#,
            )
            .unwrap();
        bundle
            .insert_entry(
                "producers/kafka1",
                br#"{"service": "kafka", "config": {"brokers": ["127.0.0.1:9092"]}}"#,
            )
            .unwrap();
        bundle
    }

    #[test]
    fn test_build_resolves_devices_and_injects_console() {
        let snapshot = populated_bundle().build(1).unwrap();

        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.sensors.len(), 1);
        assert_eq!(snapshot.databases.len(), 1);
        // kafka1 plus the built-in console producer.
        assert_eq!(snapshot.producers.len(), 2);
        assert!(snapshot.producers.contains_key("console"));

        let device = &snapshot.devices["core1.lhr:50051"];
        assert_eq!(device.host, "core1.lhr");
        assert!(device.sensors.contains_key("sensor1"));
        assert_eq!(device.sensors["sensor1"].service, "juniper.jti");
    }

    #[test]
    fn test_build_requires_global() {
        let err = RawBundle::default().build(1).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGlobal));
    }

    #[test]
    fn test_build_rejects_unknown_sensor_reference() {
        let mut bundle = bundle_with_global();
        bundle
            .insert_entry(
                "devices/core1",
                br#"{"host": "core1", "port": 50051, "sensors": ["missing"]}"#,
            )
            .unwrap();
        let err = bundle.build(1).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_build_rejects_unresolved_output() {
        let mut bundle = bundle_with_global();
        bundle
            .insert_entry(
                "sensors/sensor1",
                br#"{"service": "arista.gnmi", "path": "/interfaces/", "mode": "on_change",
                     "output": "nosuch::topic"}"#,
            )
            .unwrap();
        let err = bundle.build(1).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("nosuch")));
    }

    #[test]
    fn test_build_rejects_sample_without_interval() {
        let mut bundle = bundle_with_global();
        bundle
            .insert_entry(
                "sensors/sensor1",
                br#"{"service": "arista.gnmi", "path": "/interfaces/", "mode": "sample",
                     "output": "console::stdout"}"#,
            )
            .unwrap();
        let err = bundle.build(1).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("sampleInterval")));
    }

    #[test]
    fn test_insert_entry_skips_placeholders() {
        let mut bundle = RawBundle::default();
        bundle.insert_entry("", b"").unwrap();
        bundle.insert_entry("devices/", b"{}").unwrap();
        bundle.insert_entry("unknown/key", b"{}").unwrap();
        assert!(bundle.devices.is_empty());
    }

    #[test]
    fn test_commit_skips_identical_snapshots() {
        let shared = SharedState::new(populated_bundle().build(1).unwrap());
        let mut informer = shared.informer();

        assert!(!shared.commit(populated_bundle()).unwrap());
        assert!(!informer.has_changed().unwrap());

        let mut changed = populated_bundle();
        changed
            .insert_entry(
                "sensors/sensor2",
                br#"{"service": "arista.gnmi", "path": "/system/", "mode": "on_change",
                     "output": "console::stdout"}"#,
            )
            .unwrap();
        assert!(shared.commit(changed).unwrap());
        assert!(informer.has_changed().unwrap());
        assert_eq!(*informer.borrow_and_update(), 2);
        assert_eq!(shared.snapshot().sensors.len(), 2);
    }

    #[test]
    fn test_commit_retains_previous_on_validation_failure() {
        let shared = SharedState::new(populated_bundle().build(1).unwrap());
        let mut informer = shared.informer();

        let mut bad = populated_bundle();
        bad.insert_entry(
            "devices/core2",
            br#"{"host": "core2", "port": 50051, "sensors": ["absent"]}"#,
        )
        .unwrap();

        assert!(shared.commit(bad).is_err());
        assert!(!informer.has_changed().unwrap());
        assert_eq!(shared.snapshot().generation, 1);
        assert_eq!(shared.snapshot().devices.len(), 1);
    }
}
