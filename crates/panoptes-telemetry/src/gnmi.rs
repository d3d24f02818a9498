//! gNMI dialect subscriber.
//!
//! Serves `arista.gnmi`, `cisco.gnmi`, and `juniper.gnmi`: one
//! streaming subscription per device carrying one `Subscription` per
//! configured sensor path, with notifications decoded into the uniform
//! data point. Path selectors become labels, the leaf path is taken
//! relative to the most specific matching sensor prefix, and the
//! typed-value table is decoded in full.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use panoptes_config::{Device, Sensor, SubscriptionMode};

use crate::datapoint::{DataPoint, ExtDataPoint, FieldValue};
use crate::dispatch::DispatchSender;
use crate::metrics::metrics;
use crate::pathutil::{parse_element, parse_path, PathSegment, SensorMatcher, SensorSpec};
use crate::proto::gnmi::{
    gnmi_client::GnmiClient, subscribe_request, subscribe_response, subscription_list,
    typed_value, Encoding, Notification, Path, PathElem, SubscribeRequest, SubscribeResponse,
    Subscription, SubscriptionList, SubscriptionMode as GnmiSubscriptionMode, TypedValue,
};
use crate::transport::{attach_credentials, dial, SUBSCRIBE_TIMEOUT};
use crate::TelemetryError;

/// Bound on the suppress-redundant cache; evicted keys degrade to
/// pass-through.
const SUPPRESS_CACHE_CAPACITY: usize = 65_536;

/// Runs one subscription stream until cancellation or a stream error.
///
/// Cancellation returns `Ok(())`; every other exit is an error the
/// caller feeds into its reconnect backoff.
pub(crate) async fn run(
    device: &Device,
    sensors: &[(String, Sensor)],
    dispatch: &DispatchSender,
    cancel: &CancellationToken,
) -> Result<(), TelemetryError> {
    let dial_started = std::time::Instant::now();
    let channel = dial(device).await?;
    let mut client = GnmiClient::new(channel);

    // The request stream stays open for the subscription's lifetime;
    // dropping the sender would half-close it on some targets.
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(1);
    let _ = request_tx.send(build_subscribe_request(sensors)).await;

    let mut request = tonic::Request::new(ReceiverStream::new(request_rx));
    attach_credentials(&mut request, device);

    let response = tokio::time::timeout(SUBSCRIBE_TIMEOUT, client.subscribe(request))
        .await
        .map_err(|_| TelemetryError::SubscribeTimeout)??;
    metrics()
        .subscribe_latency
        .observe(dial_started.elapsed().as_secs_f64());
    info!(device = %device.key(), sensors = sensors.len(), "gnmi subscription streaming");

    let mut stream = response.into_inner();
    let decoder = Decoder::new(&device.host, sensors);
    let mut suppress = SuppressCache::new(SUPPRESS_CACHE_CAPACITY);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = stream.message() => message,
        };
        match message? {
            Some(response) => {
                handle_response(&decoder, &mut suppress, dispatch, &response);
            }
            None => return Err(TelemetryError::StreamClosed),
        }
    }
}

fn handle_response(
    decoder: &Decoder,
    suppress: &mut SuppressCache,
    dispatch: &DispatchSender,
    response: &SubscribeResponse,
) {
    match &response.response {
        Some(subscribe_response::Response::Update(notification)) => {
            for decoded in decoder.decode(notification) {
                if decoded.suppress && suppress.is_duplicate(&decoded.point) {
                    continue;
                }
                dispatch.send(&decoded.sensor, decoded.point);
            }
        }
        Some(subscribe_response::Response::SyncResponse(_)) => {
            debug!("gnmi initial sync complete");
        }
        None => {}
    }
}

/// Builds the subscription list for a device's gNMI sensors.
pub(crate) fn build_subscribe_request(sensors: &[(String, Sensor)]) -> SubscribeRequest {
    let subscription = sensors
        .iter()
        .map(|(_, sensor)| Subscription {
            path: Some(path_from_config(&sensor.path, &sensor.origin)),
            mode: gnmi_mode(sensor.mode) as i32,
            sample_interval: sensor.sample_interval.saturating_mul(1_000_000_000),
            suppress_redundant: sensor.suppress_redundant,
            heartbeat_interval: sensor.heartbeat_interval.saturating_mul(1_000_000_000),
        })
        .collect();

    SubscribeRequest {
        request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
            prefix: None,
            subscription,
            mode: subscription_list::Mode::Stream as i32,
            encoding: Encoding::Proto as i32,
            updates_only: false,
        })),
    }
}

fn gnmi_mode(mode: SubscriptionMode) -> GnmiSubscriptionMode {
    match mode {
        SubscriptionMode::Sample => GnmiSubscriptionMode::Sample,
        SubscriptionMode::OnChange => GnmiSubscriptionMode::OnChange,
        SubscriptionMode::TargetDefined => GnmiSubscriptionMode::TargetDefined,
    }
}

fn path_from_config(path: &str, origin: &str) -> Path {
    let elem = parse_path(path)
        .into_iter()
        .map(|segment| PathElem {
            name: segment.name,
            key: segment.keys.into_iter().collect(),
        })
        .collect();
    Path {
        origin: origin.to_string(),
        elem,
        target: String::new(),
    }
}

/// One decoded update, tagged with its sensor for accounting.
pub(crate) struct Decoded {
    pub(crate) sensor: String,
    pub(crate) suppress: bool,
    pub(crate) point: ExtDataPoint,
}

/// Notification decoder bound to one device's sensor set.
pub(crate) struct Decoder {
    matcher: SensorMatcher,
    system_id: String,
}

impl Decoder {
    pub(crate) fn new(system_id: &str, sensors: &[(String, Sensor)]) -> Self {
        let specs = sensors
            .iter()
            .map(|(name, sensor)| SensorSpec::new(name, sensor))
            .collect();
        Self {
            matcher: SensorMatcher::new(specs),
            system_id: system_id.to_string(),
        }
    }

    /// Decodes every update of a notification into data points.
    ///
    /// Updates without a matching sensor are skipped; matched updates
    /// whose value cannot be decoded drop and count against the
    /// sensor.
    pub(crate) fn decode(&self, notification: &Notification) -> Vec<Decoded> {
        let prefix_segments = segments_from_path(notification.prefix.as_ref());
        let mut out = Vec::with_capacity(notification.update.len());

        for update in &notification.update {
            let update_segments = segments_from_path(update.path.as_ref());
            let names: Vec<&str> = prefix_segments
                .iter()
                .chain(&update_segments)
                .map(|segment| segment.name.as_str())
                .collect();

            let Some((spec, matched)) = self.matcher.longest_match(&names) else {
                debug!(path = names.join("/"), "update outside configured sensor paths");
                continue;
            };

            let mut labels = std::collections::BTreeMap::new();
            for segment in prefix_segments.iter().chain(&update_segments) {
                for (key, value) in &segment.keys {
                    labels.insert(key.clone(), value.clone());
                }
            }
            // Structural hint: a keyed protocol entry names its
            // top-level container (`protocol[identifier=BGP]` → BGP).
            if let Some(identifier) = labels.get("identifier").cloned() {
                labels.insert("_name".to_string(), identifier);
            }

            let Some(value) = update.val.as_ref().and_then(decode_typed_value) else {
                metrics()
                    .drops_total
                    .with_label_values(&[spec.name.as_str()])
                    .inc();
                debug!(sensor = %spec.name, "undecodable value variant dropped");
                continue;
            };

            out.push(Decoded {
                sensor: spec.name.clone(),
                suppress: spec.suppress_redundant,
                point: ExtDataPoint {
                    output: spec.output.clone(),
                    ds: DataPoint {
                        system_id: self.system_id.clone(),
                        timestamp: notification.timestamp,
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

fn segments_from_path(path: Option<&Path>) -> Vec<PathSegment> {
    let Some(path) = path else {
        return Vec::new();
    };
    path.elem
        .iter()
        .map(|elem| {
            let mut segment = parse_element(&elem.name);
            for (key, value) in &elem.key {
                segment.keys.push((key.clone(), value.clone()));
            }
            segment
        })
        .collect()
}

/// Decodes a typed value; `None` means an unknown or malformed variant.
pub(crate) fn decode_typed_value(val: &TypedValue) -> Option<FieldValue> {
    use typed_value::Value;

    Some(match val.value.as_ref()? {
        Value::StringVal(v) | Value::AsciiVal(v) => FieldValue::String(v.clone()),
        Value::IntVal(v) => FieldValue::Int(*v),
        Value::UintVal(v) => FieldValue::Uint(*v),
        Value::BoolVal(v) => FieldValue::Bool(*v),
        Value::BytesVal(v) => FieldValue::Bytes(v.clone()),
        Value::FloatVal(v) => FieldValue::Float(*v),
        Value::DoubleVal(v) => FieldValue::Double(*v),
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
        Value::DecimalVal(d) => {
            FieldValue::Double(d.digits as f64 / 10f64.powi(d.precision as i32))
        }
        Value::JsonVal(raw) | Value::JsonIetfVal(raw) => {
            let parsed: serde_json::Value = serde_json::from_slice(raw).ok()?;
            FieldValue::Json(numbers_as_double(parsed))
        }
        Value::LeaflistVal(list) => FieldValue::List(
            list.element
                .iter()
                .filter_map(decode_typed_value)
                .collect(),
        ),
        Value::AnyVal(any) => FieldValue::Bytes(any.value.clone()),
    })
}

/// Re-types every JSON number as a 64-bit float, the shape downstream
/// consumers expect regardless of how the device rendered it.
fn numbers_as_double(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(numbers_as_double).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, numbers_as_double(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Bounded last-value cache backing suppress-redundant sensors.
pub(crate) struct SuppressCache {
    cache: LruCache<u64, FieldValue>,
}

impl SuppressCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Records the point's value and reports whether it repeats the
    /// last emission for the same series. Structured values never
    /// suppress.
    pub(crate) fn is_duplicate(&mut self, point: &ExtDataPoint) -> bool {
        if !point.ds.value.is_scalar() {
            return false;
        }

        let mut hasher = DefaultHasher::new();
        point.ds.prefix.hash(&mut hasher);
        point.ds.key.hash(&mut hasher);
        for (key, value) in &point.ds.labels {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        let series = hasher.finish();

        let previous = self.cache.put(series, point.ds.value.clone());
        previous.as_ref() == Some(&point.ds.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::gnmi::{Decimal64, ScalarArray, Update};
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    fn sensor(path: &str) -> Sensor {
        Sensor {
            service: "arista.gnmi".into(),
            path: path.into(),
            mode: SubscriptionMode::Sample,
            sample_interval: 10,
            output: "console::stdout".into(),
            ..Sensor::default()
        }
    }

    fn elem(name: &str, keys: &[(&str, &str)]) -> PathElem {
        PathElem {
            name: name.into(),
            key: keys
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn typed(value: typed_value::Value) -> Option<TypedValue> {
        Some(TypedValue { value: Some(value) })
    }

    /// The interface-counters notification every Arista scenario uses.
    fn arista_update() -> Notification {
        Notification {
            timestamp: 1_595_363_593_437_180_059,
            prefix: Some(Path {
                origin: String::new(),
                elem: vec![
                    elem("interfaces", &[]),
                    elem("interface", &[("name", "Ethernet1")]),
                    elem("state", &[]),
                    elem("counters", &[]),
                ],
                target: String::new(),
            }),
            update: vec![Update {
                path: Some(Path {
                    origin: String::new(),
                    elem: vec![elem("out-octets", &[])],
                    target: String::new(),
                }),
                val: typed(typed_value::Value::IntVal(50_302_030_597)),
                duplicates: 0,
            }],
            delete: vec![],
            atomic: false,
        }
    }

    fn arista_bgp_update() -> Notification {
        Notification {
            timestamp: 1_595_363_593_413_814_979,
            prefix: Some(Path {
                origin: String::new(),
                elem: vec![
                    elem("network-instances", &[]),
                    elem("network-instance", &[("name", "default")]),
                ],
                target: String::new(),
            }),
            update: vec![Update {
                path: Some(Path {
                    origin: String::new(),
                    elem: vec![
                        elem("protocols", &[]),
                        elem("protocol", &[("identifier", "BGP")]),
                        elem("bgp", &[]),
                        elem("global", &[]),
                        elem("afi-safis", &[]),
                        elem("afi-safi", &[("afi-safi-name", "IPV6_UNICAST")]),
                        elem("config", &[]),
                        elem("afi-safi-name", &[]),
                    ],
                    target: String::new(),
                }),
                val: typed(typed_value::Value::StringVal(
                    "openconfig-bgp-types:IPV6_UNICAST".into(),
                )),
                duplicates: 0,
            }],
            delete: vec![],
            atomic: false,
        }
    }

    #[test]
    fn test_arista_simple_path() {
        let sensors = vec![(
            "ifcounters".to_string(),
            sensor("/interfaces/interface/state/counters"),
        )];
        let decoder = Decoder::new("127.0.0.1", &sensors);

        let decoded = decoder.decode(&arista_update());
        assert_eq!(decoded.len(), 1);
        let ds = &decoded[0].point.ds;
        assert_eq!(ds.prefix, "/interfaces/interface/state/counters");
        assert_eq!(ds.system_id, "127.0.0.1");
        assert_eq!(ds.timestamp, 1_595_363_593_437_180_059);
        assert_eq!(ds.labels["name"], "Ethernet1");
        assert_eq!(ds.key, "out-octets");
        assert_eq!(ds.value, FieldValue::Int(50_302_030_597));
        assert_eq!(decoded[0].point.output, "console::stdout");
    }

    #[test]
    fn test_arista_selector_path_keeps_bracketed_prefix() {
        let sensors = vec![(
            "ifcounters".to_string(),
            sensor("/interfaces/interface[name=Ethernet1]/state/counters"),
        )];
        let decoder = Decoder::new("127.0.0.1", &sensors);

        let decoded = decoder.decode(&arista_update());
        assert_eq!(decoded.len(), 1);
        let ds = &decoded[0].point.ds;
        assert_eq!(ds.prefix, "/interfaces/interface[name=Ethernet1]/state/counters");
        assert_eq!(ds.labels["name"], "Ethernet1");
        assert_eq!(ds.key, "out-octets");
        assert_eq!(ds.value, FieldValue::Int(50_302_030_597));
    }

    #[test]
    fn test_arista_bgp_structural_labels() {
        let sensors = vec![(
            "bgp".to_string(),
            sensor("/network-instances/network-instance"),
        )];
        let decoder = Decoder::new("127.0.0.1", &sensors);

        let decoded = decoder.decode(&arista_bgp_update());
        assert_eq!(decoded.len(), 1);
        let ds = &decoded[0].point.ds;
        assert_eq!(ds.prefix, "/network-instances/network-instance");
        assert_eq!(ds.timestamp, 1_595_363_593_413_814_979);
        assert_eq!(ds.labels["name"], "default");
        assert_eq!(ds.labels["identifier"], "BGP");
        assert_eq!(ds.labels["afi-safi-name"], "IPV6_UNICAST");
        assert_eq!(ds.labels["_name"], "BGP");
        assert_eq!(
            ds.key,
            "protocols/protocol/bgp/global/afi-safis/afi-safi/config/afi-safi-name"
        );
        assert_eq!(
            ds.value,
            FieldValue::String("openconfig-bgp-types:IPV6_UNICAST".into())
        );
    }

    #[test]
    fn test_unmatched_update_is_skipped() {
        let sensors = vec![("sys".to_string(), sensor("/system/processes"))];
        let decoder = Decoder::new("127.0.0.1", &sensors);
        assert!(decoder.decode(&arista_update()).is_empty());
    }

    #[test]
    fn test_typed_value_table() {
        let cases: Vec<(typed_value::Value, FieldValue)> = vec![
            (typed_value::Value::IntVal(505), FieldValue::Int(505)),
            (typed_value::Value::UintVal(5), FieldValue::Uint(5)),
            (typed_value::Value::BoolVal(true), FieldValue::Bool(true)),
            (
                typed_value::Value::StringVal("test".into()),
                FieldValue::String("test".into()),
            ),
            (
                typed_value::Value::AsciiVal("test".into()),
                FieldValue::String("test".into()),
            ),
            (
                typed_value::Value::BytesVal(b"test".to_vec()),
                FieldValue::Bytes(b"test".to_vec()),
            ),
            (typed_value::Value::FloatVal(5.5), FieldValue::Float(5.5)),
            (typed_value::Value::DoubleVal(5.5), FieldValue::Double(5.5)),
            (
                typed_value::Value::DecimalVal(Decimal64 {
                    digits: 5,
                    precision: 1,
                }),
                FieldValue::Double(0.5),
            ),
            (
                typed_value::Value::JsonVal(br#"{"test":5}"#.to_vec()),
                FieldValue::Json(serde_json::json!({"test": 5.0})),
            ),
            (
                typed_value::Value::JsonIetfVal(br#"{"test":5}"#.to_vec()),
                FieldValue::Json(serde_json::json!({"test": 5.0})),
            ),
            (
                typed_value::Value::LeaflistVal(ScalarArray {
                    element: vec![TypedValue {
                        value: Some(typed_value::Value::UintVal(5)),
                    }],
                }),
                FieldValue::List(vec![FieldValue::Uint(5)]),
            ),
            (
                typed_value::Value::AnyVal(::prost_types::Any {
                    type_url: "example/opaque".into(),
                    value: vec![1, 2, 3],
                }),
                FieldValue::Bytes(vec![1, 2, 3]),
            ),
        ];

        for (wire, expected) in cases {
            let decoded = decode_typed_value(&TypedValue { value: Some(wire) }).unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_typed_value_wire_round_trip() {
        use prost::Message;

        let scalars = vec![
            typed_value::Value::IntVal(505),
            typed_value::Value::UintVal(5),
            typed_value::Value::BoolVal(true),
            typed_value::Value::StringVal("test".into()),
            typed_value::Value::FloatVal(5.5),
            typed_value::Value::DoubleVal(5.5),
            typed_value::Value::BytesVal(b"test".to_vec()),
        ];
        for scalar in scalars {
            let value = TypedValue {
                value: Some(scalar),
            };
            let back = TypedValue::decode(value.encode_to_vec().as_slice()).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_malformed_json_drops() {
        let value = TypedValue {
            value: Some(typed_value::Value::JsonVal(b"{broken".to_vec())),
        };
        assert!(decode_typed_value(&value).is_none());
        assert!(decode_typed_value(&TypedValue { value: None }).is_none());
    }

    #[test]
    fn test_subscribe_request_mode_mapping() {
        let sensors = vec![
            ("sampled".to_string(), sensor("/interfaces")),
            (
                "events".to_string(),
                Sensor {
                    mode: SubscriptionMode::OnChange,
                    heartbeat_interval: 30,
                    suppress_redundant: true,
                    ..sensor("/system/alarms")
                },
            ),
        ];
        let request = build_subscribe_request(&sensors);

        let Some(subscribe_request::Request::Subscribe(list)) = request.request else {
            panic!("expected a subscribe request");
        };
        assert_eq!(list.mode, subscription_list::Mode::Stream as i32);
        assert_eq!(list.subscription.len(), 2);

        let sampled = &list.subscription[0];
        assert_eq!(sampled.mode, GnmiSubscriptionMode::Sample as i32);
        assert_eq!(sampled.sample_interval, 10_000_000_000);

        let events = &list.subscription[1];
        assert_eq!(events.mode, GnmiSubscriptionMode::OnChange as i32);
        assert_eq!(events.heartbeat_interval, 30_000_000_000);
        assert!(events.suppress_redundant);
    }

    #[test]
    fn test_suppress_cache_filters_repeats() {
        let mut cache = SuppressCache::new(16);
        let point = |value: FieldValue| ExtDataPoint {
            output: "console::stdout".into(),
            ds: DataPoint {
                system_id: "127.0.0.1".into(),
                timestamp: 0,
                prefix: "/interfaces".into(),
                labels: BTreeMap::from([("name".to_string(), "Ethernet1".to_string())]),
                key: "oper-status".into(),
                value,
            },
        };

        assert!(!cache.is_duplicate(&point(FieldValue::String("UP".into()))));
        assert!(cache.is_duplicate(&point(FieldValue::String("UP".into()))));
        assert!(!cache.is_duplicate(&point(FieldValue::String("DOWN".into()))));
        // Structured payloads always pass through.
        let json = FieldValue::Json(serde_json::json!({"a": 1.0}));
        assert!(!cache.is_duplicate(&point(json.clone())));
        assert!(!cache.is_duplicate(&point(json)));
    }

    #[test]
    fn test_suppress_cache_eviction_degrades_to_pass_through() {
        let mut cache = SuppressCache::new(1);
        let point = |key: &str| ExtDataPoint {
            output: "console::stdout".into(),
            ds: DataPoint {
                system_id: "127.0.0.1".into(),
                timestamp: 0,
                prefix: "/interfaces".into(),
                labels: BTreeMap::new(),
                key: key.into(),
                value: FieldValue::Int(1),
            },
        };

        assert!(!cache.is_duplicate(&point("a")));
        assert!(!cache.is_duplicate(&point("b"))); // evicts a
        assert!(!cache.is_duplicate(&point("a"))); // a was evicted: passes
    }
}
