//! # Panoptes-Stream Outputs
//!
//! Drains the dispatch channel and routes each record to the adapter
//! named by its `adapter::name` route. Every adapter runs in its own
//! task behind a bounded queue, so a slow or panicking adapter never
//! stalls the fabric or its peers; records are handed over and not
//! retained.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod console;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panoptes_config::{parse_output_route, ConfigSnapshot, ConfigStore};
use panoptes_telemetry::{DispatchReceiver, ExtDataPoint};

/// Queue depth between the demux and each adapter task.
const ADAPTER_QUEUE: usize = 1024;

/// One running adapter task.
struct AdapterHandle {
    tx: mpsc::Sender<ExtDataPoint>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Runs the output demux until cancellation.
///
/// Adapters are rebuilt on every configuration change tick; records
/// whose route names no running adapter are dropped with a debug log.
pub async fn run(
    mut receiver: DispatchReceiver,
    config: Arc<dyn ConfigStore>,
    cancel: CancellationToken,
) {
    let mut informer = config.informer();
    let mut adapters = build_adapters(&config.snapshot());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = informer.changed() => {
                if changed.is_err() {
                    break;
                }
                shutdown_adapters(&mut adapters).await;
                adapters = build_adapters(&config.snapshot());
            }
            point = receiver.recv() => {
                let Some(point) = point else { break };
                route(&adapters, point);
            }
        }
    }
    shutdown_adapters(&mut adapters).await;
}

fn route(adapters: &HashMap<String, AdapterHandle>, point: ExtDataPoint) {
    let Some((adapter, _)) = parse_output_route(&point.output) else {
        debug!(output = %point.output, "malformed output route, record dropped");
        return;
    };
    let adapter = adapter.to_string();
    let Some(handle) = adapters.get(&adapter) else {
        debug!(adapter, "no running adapter for route, record dropped");
        return;
    };
    // Adapters apply their own backpressure; the fabric stays
    // non-blocking end to end.
    if handle.tx.try_send(point).is_err() {
        debug!(adapter, "adapter queue full, record dropped");
    }
}

/// Spawns one task per configured adapter the engine can drive.
fn build_adapters(snapshot: &ConfigSnapshot) -> HashMap<String, AdapterHandle> {
    let mut adapters = HashMap::new();

    let descriptors = snapshot
        .producers
        .iter()
        .map(|(name, producer)| (name, producer.service.as_str()))
        .chain(
            snapshot
                .databases
                .iter()
                .map(|(name, database)| (name, database.service.as_str())),
        );

    for (name, service) in descriptors {
        match service {
            "console" => {
                let (tx, rx) = mpsc::channel(ADAPTER_QUEUE);
                let adapter_cancel = CancellationToken::new();
                let join = tokio::spawn(console::run(
                    name.clone(),
                    rx,
                    adapter_cancel.clone(),
                ));
                info!(adapter = %name, "console output adapter started");
                adapters.insert(
                    name.clone(),
                    AdapterHandle {
                        tx,
                        cancel: adapter_cancel,
                        join,
                    },
                );
            }
            other => {
                warn!(adapter = %name, service = other, "no adapter implementation for service, routes to it will drop");
            }
        }
    }
    adapters
}

async fn shutdown_adapters(adapters: &mut HashMap<String, AdapterHandle>) {
    for (name, handle) in adapters.drain() {
        handle.cancel.cancel();
        if handle.join.await.is_err() {
            // A panicked adapter only takes down its own task.
            warn!(adapter = %name, "output adapter panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panoptes_config::Producer;
    use std::collections::BTreeMap;

    fn snapshot_with_console() -> ConfigSnapshot {
        ConfigSnapshot {
            producers: HashMap::from([(
                "console".to_string(),
                Producer {
                    service: "console".into(),
                    config: serde_json::Value::Null,
                },
            )]),
            ..ConfigSnapshot::default()
        }
    }

    fn point(output: &str) -> ExtDataPoint {
        ExtDataPoint {
            output: output.into(),
            ds: panoptes_telemetry::DataPoint {
                system_id: "127.0.0.1".into(),
                timestamp: 1,
                prefix: "/interfaces".into(),
                labels: BTreeMap::new(),
                key: "out-octets".into(),
                value: panoptes_telemetry::FieldValue::Int(5),
            },
        }
    }

    #[tokio::test]
    async fn test_build_adapters_spawns_console_only() {
        let mut snapshot = snapshot_with_console();
        snapshot.producers.insert(
            "kafka1".to_string(),
            Producer {
                service: "kafka".into(),
                config: serde_json::Value::Null,
            },
        );

        let mut adapters = build_adapters(&snapshot);
        assert!(adapters.contains_key("console"));
        assert!(!adapters.contains_key("kafka1"));
        shutdown_adapters(&mut adapters).await;
    }

    #[tokio::test]
    async fn test_route_to_missing_adapter_drops() {
        let mut adapters = build_adapters(&snapshot_with_console());
        // Neither route panics nor blocks.
        route(&adapters, point("kafka1::bgp"));
        route(&adapters, point("not-a-route"));
        route(&adapters, point("console::stdout"));
        shutdown_adapters(&mut adapters).await;
    }
}
