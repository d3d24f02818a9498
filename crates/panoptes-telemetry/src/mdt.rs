//! Cisco MDT dialect subscriber (`cisco.mdt`), gRPC dial-in.
//!
//! One `CreateSubs` stream per configured subscription; payloads are
//! self-describing GPB key/value trees whose `keys` children become
//! labels and whose `content` leaves become data points. The decode
//! path is shared with dial-out payloads, which carry the same
//! `Telemetry` message.

use std::collections::BTreeMap;

use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panoptes_config::{Device, Sensor};

use crate::datapoint::{DataPoint, ExtDataPoint, FieldValue};
use crate::dispatch::DispatchSender;
use crate::gnmi::Decoded;
use crate::metrics::metrics;
use crate::proto::mdt::{
    grpc_config_oper_client::GrpcConfigOperClient, telemetry_field, CreateSubsArgs, Telemetry,
    TelemetryField, ENCODE_GPBKV,
};
use crate::transport::{attach_credentials, dial, SUBSCRIBE_TIMEOUT};
use crate::TelemetryError;

/// Runs the device's dial-in subscriptions until cancellation or the
/// first stream error.
pub(crate) async fn run(
    device: &Device,
    sensors: &[(String, Sensor)],
    dispatch: &DispatchSender,
    cancel: &CancellationToken,
) -> Result<(), TelemetryError> {
    let dial_started = std::time::Instant::now();
    let channel = dial(device).await?;

    let subscriptions = sensors.iter().enumerate().map(|(index, (name, sensor))| {
        let channel = channel.clone();
        let subscription = subscription_id(&sensor.path);
        let sensor_name = name.clone();
        let sensor = sensor.clone();
        async move {
            let mut client = GrpcConfigOperClient::new(channel);
            let mut request = tonic::Request::new(CreateSubsArgs {
                req_id: i64::try_from(index).unwrap_or(0) + 1,
                encode: ENCODE_GPBKV,
                subidstr: subscription.clone(),
            });
            attach_credentials(&mut request, device);

            let response = tokio::time::timeout(SUBSCRIBE_TIMEOUT, client.create_subs(request))
                .await
                .map_err(|_| TelemetryError::SubscribeTimeout)??;
            info!(device = %device.key(), subscription, "mdt dial-in streaming");

            let mut stream = response.into_inner();
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    message = stream.message() => message,
                };
                match message? {
                    Some(reply) => {
                        if !reply.errors.is_empty() {
                            warn!(subscription, errors = %reply.errors, "mdt stream reported errors");
                            continue;
                        }
                        match Telemetry::decode(reply.data.as_slice()) {
                            Ok(telemetry) => {
                                for decoded in
                                    decode_telemetry(&telemetry, &sensor_name, &sensor, &device.host)
                                {
                                    dispatch.send(&decoded.sensor, decoded.point);
                                }
                            }
                            Err(e) => {
                                metrics()
                                    .drops_total
                                    .with_label_values(&[sensor_name.as_str()])
                                    .inc();
                                debug!(subscription, error = %e, "undecodable mdt payload dropped");
                            }
                        }
                    }
                    None => return Err(TelemetryError::StreamClosed),
                }
            }
        }
    });

    let result = futures::future::try_join_all(subscriptions).await;
    if result.is_ok() {
        metrics()
            .subscribe_latency
            .observe(dial_started.elapsed().as_secs_f64());
    }
    result.map(|_| ())
}

/// The device-side subscription name for a sensor path.
fn subscription_id(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Decodes one `Telemetry` message into data points for its sensor.
pub(crate) fn decode_telemetry(
    telemetry: &Telemetry,
    sensor_name: &str,
    sensor: &Sensor,
    fallback_system_id: &str,
) -> Vec<Decoded> {
    let system_id = if telemetry.node_id_str.is_empty() {
        fallback_system_id.to_string()
    } else {
        telemetry.node_id_str.clone()
    };

    let mut out = Vec::new();
    for row in &telemetry.data_gpbkv {
        let timestamp_ms = if row.timestamp == 0 {
            telemetry.msg_timestamp
        } else {
            row.timestamp
        };
        let timestamp =
            i64::try_from(timestamp_ms.saturating_mul(1_000_000)).unwrap_or(i64::MAX);

        let mut labels = BTreeMap::new();
        let mut content = None;
        for field in &row.fields {
            match field.name.as_str() {
                "keys" => {
                    for key_field in &field.fields {
                        if let Some(value) = scalar_label(key_field) {
                            labels.insert(key_field.name.clone(), value);
                        }
                    }
                }
                "content" => content = Some(field),
                _ => {}
            }
        }

        let Some(content) = content else {
            continue;
        };
        collect_leaves(content, String::new(), &mut |key, value| match value {
            Some(value) => out.push(Decoded {
                sensor: sensor_name.to_string(),
                suppress: sensor.suppress_redundant,
                point: ExtDataPoint {
                    output: sensor.output.clone(),
                    ds: DataPoint {
                        system_id: system_id.clone(),
                        timestamp,
                        prefix: sensor.path.clone(),
                        labels: labels.clone(),
                        key,
                        value,
                    },
                },
            }),
            None => {
                metrics().drops_total.with_label_values(&[sensor_name]).inc();
            }
        });
    }
    out
}

/// Walks a `content` subtree, invoking `emit` per leaf with the
/// slash-joined relative key.
fn collect_leaves(
    field: &TelemetryField,
    prefix: String,
    emit: &mut impl FnMut(String, Option<FieldValue>),
) {
    for child in &field.fields {
        let key = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{prefix}/{}", child.name)
        };
        if child.fields.is_empty() {
            emit(key, child.value_by_type.as_ref().map(decode_field_value));
        } else {
            collect_leaves(child, key, emit);
        }
    }
}

fn decode_field_value(value: &telemetry_field::ValueByType) -> FieldValue {
    match value {
        telemetry_field::ValueByType::BytesValue(v) => FieldValue::Bytes(v.clone()),
        telemetry_field::ValueByType::StringValue(v) => FieldValue::String(v.clone()),
        telemetry_field::ValueByType::BoolValue(v) => FieldValue::Bool(*v),
        telemetry_field::ValueByType::Uint32Value(v) => FieldValue::Uint(u64::from(*v)),
        telemetry_field::ValueByType::Uint64Value(v) => FieldValue::Uint(*v),
        telemetry_field::ValueByType::Sint32Value(v) => FieldValue::Int(i64::from(*v)),
        telemetry_field::ValueByType::Sint64Value(v) => FieldValue::Int(*v),
        telemetry_field::ValueByType::DoubleValue(v) => FieldValue::Double(*v),
        telemetry_field::ValueByType::FloatValue(v) => FieldValue::Float(*v),
    }
}

fn scalar_label(field: &TelemetryField) -> Option<String> {
    match field.value_by_type.as_ref()? {
        telemetry_field::ValueByType::StringValue(v) => Some(v.clone()),
        telemetry_field::ValueByType::Uint32Value(v) => Some(v.to_string()),
        telemetry_field::ValueByType::Uint64Value(v) => Some(v.to_string()),
        telemetry_field::ValueByType::Sint32Value(v) => Some(v.to_string()),
        telemetry_field::ValueByType::Sint64Value(v) => Some(v.to_string()),
        telemetry_field::ValueByType::BoolValue(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panoptes_config::SubscriptionMode;

    fn sensor() -> Sensor {
        Sensor {
            service: "cisco.mdt".into(),
            path: "Cisco-IOS-XR-infra-statsd-oper:infra-statistics/interfaces/interface/latest/generic-counters".into(),
            mode: SubscriptionMode::Sample,
            sample_interval: 10,
            output: "console::stdout".into(),
            ..Sensor::default()
        }
    }

    fn leaf(name: &str, value: telemetry_field::ValueByType) -> TelemetryField {
        TelemetryField {
            timestamp: 0,
            name: name.into(),
            value_by_type: Some(value),
            fields: vec![],
        }
    }

    fn branch(name: &str, fields: Vec<TelemetryField>) -> TelemetryField {
        TelemetryField {
            timestamp: 0,
            name: name.into(),
            value_by_type: None,
            fields,
        }
    }

    fn counters_message() -> Telemetry {
        Telemetry {
            node_id_str: "ios-xr-1".into(),
            subscription_id_str: "sub1".into(),
            encoding_path: sensor().path,
            collection_id: 1,
            collection_start_time: 0,
            msg_timestamp: 1_595_363_593_437,
            data_gpbkv: vec![branch(
                "",
                vec![
                    branch(
                        "keys",
                        vec![leaf(
                            "interface-name",
                            telemetry_field::ValueByType::StringValue("GigabitEthernet0/0/0/0".into()),
                        )],
                    ),
                    branch(
                        "content",
                        vec![
                            leaf(
                                "packets-received",
                                telemetry_field::ValueByType::Uint64Value(1_023),
                            ),
                            branch(
                                "errors",
                                vec![leaf(
                                    "crc-errors",
                                    telemetry_field::ValueByType::Uint32Value(2),
                                )],
                            ),
                        ],
                    ),
                ],
            )],
            collection_end_time: 0,
        }
    }

    #[test]
    fn test_decode_keys_and_content() {
        let decoded = decode_telemetry(&counters_message(), "counters", &sensor(), "10.0.0.1");
        assert_eq!(decoded.len(), 2);

        let first = &decoded[0].point.ds;
        assert_eq!(first.system_id, "ios-xr-1");
        assert_eq!(first.timestamp, 1_595_363_593_437_000_000);
        assert_eq!(first.prefix, sensor().path);
        assert_eq!(first.labels["interface-name"], "GigabitEthernet0/0/0/0");
        assert_eq!(first.key, "packets-received");
        assert_eq!(first.value, FieldValue::Uint(1_023));

        let nested = &decoded[1].point.ds;
        assert_eq!(nested.key, "errors/crc-errors");
        assert_eq!(nested.value, FieldValue::Uint(2));
    }

    #[test]
    fn test_system_id_falls_back_to_device_host() {
        let mut message = counters_message();
        message.node_id_str = String::new();
        let decoded = decode_telemetry(&message, "counters", &sensor(), "10.0.0.1");
        assert_eq!(decoded[0].point.ds.system_id, "10.0.0.1");
    }

    #[test]
    fn test_row_without_content_is_skipped() {
        let mut message = counters_message();
        message.data_gpbkv = vec![branch("", vec![branch("keys", vec![])])];
        assert!(decode_telemetry(&message, "counters", &sensor(), "10.0.0.1").is_empty());
    }

    #[test]
    fn test_subscription_id_trims_slashes() {
        assert_eq!(subscription_id("/sub1/"), "sub1");
        assert_eq!(subscription_id("sub1"), "sub1");
    }

    #[test]
    fn test_telemetry_payload_round_trip() {
        let message = counters_message();
        let bytes = message.encode_to_vec();
        let back = Telemetry::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, message);
    }
}
