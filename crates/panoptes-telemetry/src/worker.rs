//! Per-device worker: one long-lived task per owned device, one
//! subscription stream per dialect in its sensor set, each with an
//! independent reconnect schedule.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use panoptes_config::{Device, Sensor};

use crate::backoff::Backoff;
use crate::dispatch::DispatchSender;
use crate::metrics::metrics;
use crate::registry::Dialect;
use crate::{gnmi, jti, mdt, TelemetryError};

/// Streaming uptime after which the reconnect schedule resets.
const STEADY_STATE: Duration = Duration::from_secs(60);

/// Runs all of a device's subscriptions until cancellation.
pub(crate) async fn run_device(
    device: Device,
    dispatch: DispatchSender,
    cancel: CancellationToken,
) {
    let mut groups: HashMap<Dialect, Vec<(String, Sensor)>> = HashMap::new();
    for (name, sensor) in &device.sensors {
        if sensor.disabled {
            debug!(device = %device.key(), sensor = %name, "sensor disabled, skipped");
            continue;
        }
        let Some(dialect) = Dialect::from_service(&sensor.service) else {
            warn!(
                device = %device.key(),
                sensor = %name,
                service = %sensor.service,
                "unsupported telemetry service, sensor skipped"
            );
            continue;
        };
        groups
            .entry(dialect)
            .or_default()
            .push((name.clone(), sensor.clone()));
    }

    // Deterministic subscription order within each stream.
    for sensors in groups.values_mut() {
        sensors.sort_by(|a, b| a.0.cmp(&b.0));
    }

    let streams = groups
        .into_iter()
        .map(|(dialect, sensors)| run_dialect(dialect, &device, sensors, &dispatch, &cancel));
    futures::future::join_all(streams).await;
}

/// One dialect's connect → subscribe → stream loop with backoff.
async fn run_dialect(
    dialect: Dialect,
    device: &Device,
    sensors: Vec<(String, Sensor)>,
    dispatch: &DispatchSender,
    cancel: &CancellationToken,
) {
    let mut backoff = Backoff::new();
    loop {
        let attempt_started = Instant::now();
        let result = match dialect {
            Dialect::Gnmi => gnmi::run(device, &sensors, dispatch, cancel).await,
            Dialect::Jti => jti::run(device, &sensors, dispatch, cancel).await,
            Dialect::Mdt => mdt::run(device, &sensors, dispatch, cancel).await,
        };
        if cancel.is_cancelled() {
            return;
        }
        let Err(error) = result else {
            return;
        };

        // A stream that ran for a while earns a fresh schedule.
        if attempt_started.elapsed() >= STEADY_STATE {
            backoff.reset();
        }
        let device_key = device.key();
        metrics()
            .reconnects_total
            .with_label_values(&[device_key.as_str()])
            .inc();
        let delay = backoff.next_delay();
        log_stream_error(dialect, device, &error, backoff.attempt(), delay);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn log_stream_error(
    dialect: Dialect,
    device: &Device,
    error: &TelemetryError,
    attempt: u32,
    delay: Duration,
) {
    if error.is_auth() {
        error!(
            device = %device.key(),
            ?dialect,
            error = %error,
            "authentication or TLS failure, retrying while the operator rotates secrets"
        );
    } else if attempt <= 1 {
        info!(
            device = %device.key(),
            ?dialect,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "telemetry stream interrupted, reconnecting"
        );
    } else {
        debug!(
            device = %device.key(),
            ?dialect,
            error = %error,
            attempt,
            "telemetry stream still failing"
        );
    }
}
