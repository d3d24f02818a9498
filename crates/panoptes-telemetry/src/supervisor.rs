//! The pipeline supervisor.
//!
//! One reconcile loop fans in configuration change ticks and registry
//! membership ticks, computes the devices this instance owns, and
//! converges the running worker set: leavers stop before joiners
//! start, and a device whose sensor set changed is cancelled and
//! restarted (subscription lists are immutable per worker lifetime).
//! Watch-channel semantics coalesce ticks arriving mid-reconcile.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panoptes_config::{ConfigStore, Device};
use panoptes_discovery::{Discovery, ShardRing};

use crate::dispatch::DispatchSender;
use crate::metrics::metrics;
use crate::worker;

/// A running device worker.
struct WorkerHandle {
    /// The config generation's view of the device; a differing view on
    /// reconcile forces cancel-then-start.
    device: Device,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Reconciles desired vs running device workers.
pub struct Supervisor {
    config: Arc<dyn ConfigStore>,
    discovery: Option<Arc<dyn Discovery>>,
    dispatch: DispatchSender,
    running: HashMap<String, WorkerHandle>,
}

impl Supervisor {
    /// Builds the supervisor. Without a registry every device is owned
    /// locally.
    #[must_use]
    pub fn new(
        config: Arc<dyn ConfigStore>,
        discovery: Option<Arc<dyn Discovery>>,
        dispatch: DispatchSender,
    ) -> Self {
        Self {
            config,
            discovery,
            dispatch,
            running: HashMap::new(),
        }
    }

    /// Runs the reconcile loop until cancellation, then stops every
    /// worker.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut informer = self.config.informer();
        let mut membership = self.discovery.as_ref().map(|discovery| discovery.watch());

        self.reconcile().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = informer.changed() => {
                    if changed.is_err() {
                        warn!("configuration informer closed, supervisor exiting");
                        break;
                    }
                    debug!(generation = *informer.borrow_and_update(), "configuration changed");
                    self.reconcile().await;
                }
                changed = membership_changed(membership.as_mut()) => {
                    if changed.is_err() {
                        warn!("membership watch closed, supervisor exiting");
                        break;
                    }
                    debug!("membership changed");
                    self.reconcile().await;
                }
            }
        }
        self.shutdown().await;
    }

    /// One reconcile pass: compute desired, stop leavers, start
    /// joiners.
    async fn reconcile(&mut self) {
        let snapshot = self.config.snapshot();

        let desired = match self.desired_devices(&snapshot).await {
            Some(desired) => desired,
            // Membership unavailable: keep the current workers rather
            // than flapping on registry outages.
            None => return,
        };

        let stop: Vec<String> = self
            .running
            .iter()
            .filter(|(key, handle)| match desired.get(*key) {
                Some(device) => *device != handle.device,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        // Leavers stop before joiners start, so a device never streams
        // twice during a handoff.
        for key in stop {
            self.stop_worker(&key).await;
        }

        for (key, device) in desired {
            if !self.running.contains_key(&key) {
                self.start_worker(device);
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        metrics().workers_running.set(self.running.len() as i64);
    }

    /// The devices this instance owns under the current snapshot, or
    /// `None` when membership cannot be read.
    async fn desired_devices(
        &self,
        snapshot: &panoptes_config::ConfigSnapshot,
    ) -> Option<HashMap<String, Device>> {
        let shard = &snapshot.global.shard;

        if !shard.enabled || self.discovery.is_none() {
            return Some(snapshot.devices.clone());
        }
        let discovery = self.discovery.as_ref()?;

        let Some(local_id) = discovery.id() else {
            // Not registered: sharded workloads stay gated.
            info!("instance not registered, sharded workloads gated");
            return Some(HashMap::new());
        };

        let instances = match discovery.instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "membership unavailable, keeping current workers");
                return None;
            }
        };
        #[allow(clippy::cast_possible_wrap)]
        metrics().membership_size.set(instances.len() as i64);

        let ring = ShardRing::new(&instances);
        Some(
            snapshot
                .devices
                .iter()
                .filter(|(key, _)| ring.owner(key) == Some(local_id.as_str()))
                .map(|(key, device)| (key.clone(), device.clone()))
                .collect(),
        )
    }

    fn start_worker(&mut self, device: Device) {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(worker::run_device(
            device.clone(),
            self.dispatch.clone(),
            cancel.clone(),
        ));
        info!(device = %device.key(), sensors = device.sensors.len(), "device worker started");
        self.running
            .insert(device.key(), WorkerHandle { device, cancel, join });
    }

    async fn stop_worker(&mut self, key: &str) {
        let Some(handle) = self.running.remove(key) else {
            return;
        };
        handle.cancel.cancel();
        if handle.join.await.is_err() {
            warn!(device = key, "device worker panicked during shutdown");
        }
        info!(device = key, "device worker stopped");
    }

    async fn shutdown(&mut self) {
        let keys: Vec<String> = self.running.keys().cloned().collect();
        for key in keys {
            self.stop_worker(&key).await;
        }
        metrics().workers_running.set(0);
    }
}

/// Awaits the membership watch when a registry is configured; pends
/// forever otherwise so the select arm never fires.
async fn membership_changed(
    watch: Option<&mut watch::Receiver<u64>>,
) -> Result<(), watch::error::RecvError> {
    match watch {
        Some(receiver) => receiver.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch;
    use async_trait::async_trait;
    use panoptes_config::{ConfigError, ConfigSnapshot, Global, Sensor, ShardConfig, SubscriptionMode};
    use panoptes_discovery::{DiscoveryError, Instance};
    use parking_lot::RwLock;

    struct MockStore {
        snapshot: RwLock<Arc<ConfigSnapshot>>,
        informer: watch::Sender<u64>,
    }

    impl MockStore {
        fn new(snapshot: ConfigSnapshot) -> Self {
            let (informer, _) = watch::channel(snapshot.generation);
            Self {
                snapshot: RwLock::new(Arc::new(snapshot)),
                informer,
            }
        }

        fn publish(&self, snapshot: ConfigSnapshot) {
            let generation = snapshot.generation;
            *self.snapshot.write() = Arc::new(snapshot);
            let _ = self.informer.send(generation);
        }
    }

    #[async_trait]
    impl ConfigStore for MockStore {
        fn snapshot(&self) -> Arc<ConfigSnapshot> {
            Arc::clone(&self.snapshot.read())
        }

        fn informer(&self) -> watch::Receiver<u64> {
            self.informer.subscribe()
        }

        async fn update(&self) -> Result<bool, ConfigError> {
            Ok(false)
        }

        fn stop(&self) {}
    }

    struct MockRegistry {
        id: Option<String>,
        instances: Vec<Instance>,
        membership: watch::Sender<u64>,
    }

    #[async_trait]
    impl Discovery for MockRegistry {
        async fn register(&self) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn deregister(&self) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
            Ok(self.instances.clone())
        }

        fn watch(&self) -> watch::Receiver<u64> {
            self.membership.subscribe()
        }

        fn id(&self) -> Option<String> {
            self.id.clone()
        }

        fn stop(&self) {}
    }

    fn device(host: &str) -> Device {
        let sensor = Sensor {
            service: "unsupported.for.test".into(),
            path: "/interfaces/".into(),
            mode: SubscriptionMode::Sample,
            sample_interval: 10,
            output: "console::stdout".into(),
            ..Sensor::default()
        };
        Device {
            host: host.into(),
            port: 50051,
            sensors: HashMap::from([("sensor1".to_string(), sensor)]),
            ..Device::default()
        }
    }

    fn snapshot_with(generation: u64, devices: Vec<Device>) -> ConfigSnapshot {
        ConfigSnapshot {
            generation,
            devices: devices.into_iter().map(|d| (d.key(), d)).collect(),
            global: Global::default(),
            ..ConfigSnapshot::default()
        }
    }

    fn supervisor_with(store: Arc<MockStore>) -> Supervisor {
        let (tx, _rx) = dispatch::channel(8);
        Supervisor::new(store, None, tx)
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_workers() {
        let store = Arc::new(MockStore::new(snapshot_with(1, vec![device("core1")])));
        let mut supervisor = supervisor_with(Arc::clone(&store));

        supervisor.reconcile().await;
        assert!(supervisor.running.contains_key("core1:50051"));

        store.publish(snapshot_with(2, vec![device("core2")]));
        supervisor.reconcile().await;
        assert!(!supervisor.running.contains_key("core1:50051"));
        assert!(supervisor.running.contains_key("core2:50051"));

        supervisor.shutdown().await;
        assert!(supervisor.running.is_empty());
    }

    #[tokio::test]
    async fn test_sensor_change_replaces_worker() {
        let store = Arc::new(MockStore::new(snapshot_with(1, vec![device("core1")])));
        let mut supervisor = supervisor_with(Arc::clone(&store));

        supervisor.reconcile().await;
        let first_cancel = supervisor.running["core1:50051"].cancel.clone();

        let mut changed = device("core1");
        changed
            .sensors
            .get_mut("sensor1")
            .unwrap()
            .sample_interval = 30;
        store.publish(snapshot_with(2, vec![changed]));
        supervisor.reconcile().await;

        // The old worker was cancelled and a fresh one started.
        assert!(first_cancel.is_cancelled());
        assert_eq!(
            supervisor.running["core1:50051"].device.sensors["sensor1"].sample_interval,
            30
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_sharding_gates_until_registered() {
        let mut snapshot = snapshot_with(1, vec![device("core1")]);
        snapshot.global.shard = ShardConfig {
            enabled: true,
            number_of_nodes: 2,
            initializing_shard: 0,
        };
        let store = Arc::new(MockStore::new(snapshot));

        let (membership, _) = watch::channel(0);
        let registry = Arc::new(MockRegistry {
            id: None,
            instances: vec![],
            membership,
        });

        let (tx, _rx) = dispatch::channel(8);
        let mut supervisor = Supervisor::new(store, Some(registry), tx);
        supervisor.reconcile().await;
        assert!(supervisor.running.is_empty());
    }

    #[tokio::test]
    async fn test_sharding_owns_subset() {
        let devices: Vec<Device> = (0..20).map(|n| device(&format!("core{n}"))).collect();
        let mut snapshot = snapshot_with(1, devices);
        snapshot.global.shard = ShardConfig {
            enabled: true,
            number_of_nodes: 2,
            initializing_shard: 0,
        };
        let store = Arc::new(MockStore::new(snapshot));

        let instances = vec![
            Instance {
                id: "0".into(),
                address: "a".into(),
                meta: HashMap::new(),
                status: "passing".into(),
            },
            Instance {
                id: "1".into(),
                address: "b".into(),
                meta: HashMap::new(),
                status: "passing".into(),
            },
        ];
        let (membership, _) = watch::channel(0);
        let registry = Arc::new(MockRegistry {
            id: Some("0".into()),
            instances,
            membership,
        });

        let (tx, _rx) = dispatch::channel(8);
        let mut supervisor = Supervisor::new(store, Some(registry), tx);
        supervisor.reconcile().await;

        let owned = supervisor.running.len();
        assert!(owned > 0, "instance 0 must own some devices");
        assert!(owned < 20, "instance 0 must not own every device");
        supervisor.shutdown().await;
    }
}
