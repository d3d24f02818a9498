//! The uniform data-point representation emitted by every dialect.

use std::collections::BTreeMap;

use serde::Serialize;

/// A decoded telemetry value.
///
/// Covers every wire variant the dialects decode; JSON payloads keep
/// their parsed structure and leaf-lists recurse element-wise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Boolean.
    Bool(bool),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float (also decimal `digits × 10^-precision`).
    Double(f64),
    /// UTF-8 string (also ASCII values).
    String(String),
    /// Verbatim byte sequence (also opaque protobuf payloads).
    Bytes(Vec<u8>),
    /// Parsed JSON; numbers decode as 64-bit floats.
    Json(serde_json::Value),
    /// Ordered sequence of decoded scalars.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Whether two values compare equal for suppress-redundant
    /// purposes. Structured payloads never suppress.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::Json(_) | Self::List(_) | Self::Bytes(_))
    }
}

/// One decoded telemetry observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    /// The reporting device, host part of the dial target.
    pub system_id: String,
    /// Nanoseconds since epoch, as stamped by the device.
    pub timestamp: i64,
    /// The matching sensor's configured path.
    pub prefix: String,
    /// Selector values and list keys discovered along the path.
    pub labels: BTreeMap<String, String>,
    /// Leaf path relative to `prefix`.
    pub key: String,
    /// The decoded value.
    pub value: FieldValue,
}

/// A data point coupled with its output route, the unit carried on the
/// dispatch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtDataPoint {
    /// The matching sensor's `adapter::name` route.
    pub output: String,
    /// The decoded observation.
    pub ds: DataPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_classification() {
        assert!(FieldValue::Int(5).is_scalar());
        assert!(FieldValue::String("up".into()).is_scalar());
        assert!(!FieldValue::Json(serde_json::json!({"a": 1})).is_scalar());
        assert!(!FieldValue::List(vec![FieldValue::Uint(5)]).is_scalar());
        assert!(!FieldValue::Bytes(vec![1, 2]).is_scalar());
    }

    #[test]
    fn test_json_rendering_is_untagged() {
        let point = ExtDataPoint {
            output: "console::stdout".into(),
            ds: DataPoint {
                system_id: "127.0.0.1".into(),
                timestamp: 1_595_363_593_437_180_059,
                prefix: "/interfaces/interface/state/counters".into(),
                labels: BTreeMap::from([("name".to_string(), "Ethernet1".to_string())]),
                key: "out-octets".into(),
                value: FieldValue::Int(50_302_030_597),
            },
        };
        let rendered = serde_json::to_value(&point).unwrap();
        assert_eq!(rendered["ds"]["value"], serde_json::json!(50_302_030_597_i64));
        assert_eq!(rendered["ds"]["labels"]["name"], "Ethernet1");
        assert_eq!(rendered["output"], "console::stdout");
    }
}
