//! Local-file configuration store.
//!
//! Reads the bootstrap file (YAML, or JSON by extension) into a full
//! snapshot and polls its mtime for changes at the reload-debounce
//! cadence. The global block sits at the top level of the file, the
//! way operators write the bootstrap config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Database, DeviceConfig, Global, Producer, Sensor};
use crate::snapshot::{ConfigSnapshot, RawBundle, SharedState};
use crate::{ConfigError, ConfigStore, RELOAD_DEBOUNCE};

/// Interval between mtime polls of the bootstrap file.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// On-disk layout of the bootstrap file: device list plus named maps,
/// with the global settings flattened at the top level.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileBundle {
    devices: Vec<DeviceConfig>,
    sensors: HashMap<String, Sensor>,
    databases: HashMap<String, Database>,
    producers: HashMap<String, Producer>,
    #[serde(flatten)]
    global: Global,
}

/// Configuration store backed by a local file.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl FileConfigStore {
    /// Loads the bootstrap file and starts the mtime watcher.
    ///
    /// # Errors
    ///
    /// Returns the read, parse, or validation error of the initial
    /// load; the store does not start with an invalid bootstrap.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let snapshot = read_bundle(&path)?.build(1)?;
        info!(path = %path.display(), devices = snapshot.devices.len(), "configuration loaded");

        let shared = Arc::new(SharedState::new(snapshot));
        let cancel = CancellationToken::new();
        spawn_watcher(path.clone(), Arc::clone(&shared), cancel.clone());

        Ok(Self { path, shared, cancel })
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.shared.snapshot()
    }

    fn informer(&self) -> watch::Receiver<u64> {
        self.shared.informer()
    }

    async fn update(&self) -> Result<bool, ConfigError> {
        self.shared.commit(read_bundle(&self.path)?)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FileConfigStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads and converts the bootstrap file into a [`RawBundle`].
fn read_bundle(path: &Path) -> Result<RawBundle, ConfigError> {
    let raw = std::fs::read(path)?;
    let file: FileBundle = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_slice(&raw)?,
        _ => serde_yaml::from_slice(&raw)?,
    };

    let mut bundle = RawBundle {
        sensors: file.sensors,
        databases: file.databases,
        producers: file.producers,
        global: Some(file.global),
        ..RawBundle::default()
    };
    for device in file.devices {
        let name = format!("{}:{}", device.host, device.port);
        bundle.devices.insert(name, device);
    }
    Ok(bundle)
}

/// Polls the file mtime and commits a debounced reload on change.
fn spawn_watcher(path: PathBuf, shared: Arc<SharedState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut last_mtime = mtime(&path);
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let current = mtime(&path);
            if current == last_mtime {
                continue;
            }
            last_mtime = current;
            tokio::time::sleep(RELOAD_DEBOUNCE).await;

            match read_bundle(&path).and_then(|bundle| shared.commit(bundle)) {
                Ok(true) => info!(path = %path.display(), "configuration reloaded"),
                Ok(false) => debug!(path = %path.display(), "configuration unchanged"),
                Err(e) => warn!(path = %path.display(), error = %e, "reload rejected, previous snapshot retained"),
            }
        }
    });
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
