//! Juniper JTI dialect subscriber (`juniper.jti`).
//!
//! Same ExtDS shape as gNMI; selectors arrive inside the kv frames
//! (`__prefix__` control keys plus `[k='v']` path selectors) and
//! timestamps are milliseconds scaled to nanoseconds.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use panoptes_config::{Device, Sensor};

use crate::datapoint::{DataPoint, ExtDataPoint, FieldValue};
use crate::dispatch::DispatchSender;
use crate::gnmi::{Decoded, SuppressCache};
use crate::metrics::metrics;
use crate::pathutil::{parse_path, PathSegment, SensorMatcher, SensorSpec};
use crate::proto::jti::{
    key_value, open_config_telemetry_client::OpenConfigTelemetryClient, OpenConfigData, Path,
    SubscriptionRequest,
};
use crate::transport::{attach_credentials, dial, SUBSCRIBE_TIMEOUT};
use crate::TelemetryError;

/// Bound on the suppress-redundant cache, as for gNMI.
const SUPPRESS_CACHE_CAPACITY: usize = 65_536;

/// Runs one JTI subscription stream until cancellation or an error.
pub(crate) async fn run(
    device: &Device,
    sensors: &[(String, Sensor)],
    dispatch: &DispatchSender,
    cancel: &CancellationToken,
) -> Result<(), TelemetryError> {
    let dial_started = std::time::Instant::now();
    let channel = dial(device).await?;
    let mut client = OpenConfigTelemetryClient::new(channel);

    let mut request = tonic::Request::new(build_subscription_request(sensors));
    attach_credentials(&mut request, device);

    let response = tokio::time::timeout(SUBSCRIBE_TIMEOUT, client.telemetry_subscribe(request))
        .await
        .map_err(|_| TelemetryError::SubscribeTimeout)??;
    metrics()
        .subscribe_latency
        .observe(dial_started.elapsed().as_secs_f64());
    info!(device = %device.key(), sensors = sensors.len(), "jti subscription streaming");

    let mut stream = response.into_inner();
    let decoder = Decoder::new(&device.host, sensors);
    let mut suppress = SuppressCache::new(SUPPRESS_CACHE_CAPACITY);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = stream.message() => message,
        };
        match message? {
            Some(data) => {
                for decoded in decoder.decode(&data) {
                    if decoded.suppress && suppress.is_duplicate(&decoded.point) {
                        continue;
                    }
                    dispatch.send(&decoded.sensor, decoded.point);
                }
            }
            None => return Err(TelemetryError::StreamClosed),
        }
    }
}

/// Builds the path list for a device's JTI sensors.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn build_subscription_request(sensors: &[(String, Sensor)]) -> SubscriptionRequest {
    let path_list = sensors
        .iter()
        .map(|(_, sensor)| Path {
            path: sensor.path.clone(),
            filter: String::new(),
            suppress_unchanged: sensor.suppress_redundant,
            max_silent_interval: 0,
            sample_frequency: sensor.sample_interval.saturating_mul(1000) as u32,
            need_eom: false,
        })
        .collect();
    SubscriptionRequest {
        input: None,
        path_list,
    }
}

/// Frame decoder bound to one device's JTI sensor set.
pub(crate) struct Decoder {
    matcher: SensorMatcher,
    fallback_system_id: String,
}

impl Decoder {
    pub(crate) fn new(fallback_system_id: &str, sensors: &[(String, Sensor)]) -> Self {
        let specs = sensors
            .iter()
            .map(|(name, sensor)| SensorSpec::new(name, sensor))
            .collect();
        Self {
            matcher: SensorMatcher::new(specs),
            fallback_system_id: fallback_system_id.to_string(),
        }
    }

    /// Decodes the kv frames of one `OpenConfigData` message.
    pub(crate) fn decode(&self, data: &OpenConfigData) -> Vec<Decoded> {
        let system_id = if data.system_id.is_empty() {
            self.fallback_system_id.clone()
        } else {
            // Juniper renders `hostname:address`.
            data.system_id
                .split(':')
                .next()
                .unwrap_or(&data.system_id)
                .to_string()
        };
        let timestamp = i64::try_from(data.timestamp.saturating_mul(1_000_000)).unwrap_or(i64::MAX);

        let mut prefix_segments: Vec<PathSegment> = Vec::new();
        let mut out = Vec::new();

        for kv in &data.kv {
            if kv.key == "__prefix__" {
                if let Some(key_value::Value::StrValue(prefix)) = &kv.value {
                    prefix_segments = parse_path(prefix);
                }
                continue;
            }
            if kv.key.starts_with("__") {
                continue;
            }

            let key_segments = parse_path(&kv.key);
            let names: Vec<&str> = prefix_segments
                .iter()
                .chain(&key_segments)
                .map(|segment| segment.name.as_str())
                .collect();

            let Some((spec, matched)) = self.matcher.longest_match(&names) else {
                debug!(key = %kv.key, "kv frame outside configured sensor paths");
                continue;
            };

            let mut labels = std::collections::BTreeMap::new();
            for segment in prefix_segments.iter().chain(&key_segments) {
                for (key, value) in &segment.keys {
                    labels.insert(key.clone(), value.clone());
                }
            }

            let Some(value) = kv.value.as_ref().map(decode_kv_value) else {
                metrics()
                    .drops_total
                    .with_label_values(&[spec.name.as_str()])
                    .inc();
                continue;
            };

            out.push(Decoded {
                sensor: spec.name.clone(),
                suppress: spec.suppress_redundant,
                point: ExtDataPoint {
                    output: spec.output.clone(),
                    ds: DataPoint {
                        system_id: system_id.clone(),
                        timestamp,
                        prefix: spec.path.clone(),
                        labels,
                        key: names[matched..].join("/"),
                        value,
                    },
                },
            });
        }
        out
    }
}

fn decode_kv_value(value: &key_value::Value) -> FieldValue {
    match value {
        key_value::Value::DoubleValue(v) => FieldValue::Double(*v),
        key_value::Value::IntValue(v) | key_value::Value::SintValue(v) => FieldValue::Int(*v),
        key_value::Value::UintValue(v) => FieldValue::Uint(*v),
        key_value::Value::BoolValue(v) => FieldValue::Bool(*v),
        key_value::Value::StrValue(v) => FieldValue::String(v.clone()),
        key_value::Value::BytesValue(v) => FieldValue::Bytes(v.clone()),
    }
}
