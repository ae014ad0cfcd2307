//! Hybrid JSON / MessagePack values
//!
//! Values that serialize to plain JSON are kept readable. Anything `serde_json`
//! refuses (non-string map keys, for example) or would silently alter (NaN and
//! infinite floats become `null`) falls back to MessagePack, which round-trips
//! through the same `Serialize`/`Deserialize` impls. The binary form
//! is hex-encoded when the surrounding structure is written as JSON.

use serde::de::{DeserializeOwned, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{ClearstoneError, Result};

/// Default upper bound for a captured span snapshot (1 MiB)
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 1024 * 1024;

/// Encoding used for a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    Json,
    Msgpack,
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationFormat::Json => write!(f, "json"),
            SerializationFormat::Msgpack => write!(f, "msgpack"),
        }
    }
}

/// A value encoded as JSON when possible and MessagePack otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum HybridValue {
    Json { value: Value },
    Msgpack {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

impl HybridValue {
    /// Encode a value, preferring JSON.
    ///
    /// # Errors
    ///
    /// Returns an `Encoding` error when neither format can represent the value.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(json) if !contains_null(&json) => Ok(HybridValue::Json { value: json }),
            Ok(json) => match rmp_serde::to_vec_named(value) {
                Ok(data) if has_non_finite_float(&data) => {
                    tracing::debug!("value holds a non-finite float, using msgpack");
                    Ok(HybridValue::Msgpack { data })
                }
                _ => Ok(HybridValue::Json { value: json }),
            },
            Err(json_err) => {
                tracing::debug!(error = %json_err, "value is not JSON-representable, using msgpack");
                let data = rmp_serde::to_vec_named(value)?;
                Ok(HybridValue::Msgpack { data })
            }
        }
    }

    /// Build from raw MessagePack bytes
    pub fn from_msgpack(data: Vec<u8>) -> Self {
        HybridValue::Msgpack { data }
    }

    /// Decode into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored encoding does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            HybridValue::Json { value } => Ok(serde_json::from_value(value.clone())?),
            HybridValue::Msgpack { data } => Ok(rmp_serde::from_slice(data)?),
        }
    }

    /// View the value as JSON, decoding MessagePack when necessary.
    ///
    /// # Errors
    ///
    /// Fails when the binary form has no JSON equivalent.
    pub fn to_json(&self) -> Result<Value> {
        match self {
            HybridValue::Json { value } => Ok(value.clone()),
            HybridValue::Msgpack { data } => rmp_serde::from_slice::<Value>(data).map_err(|e| {
                ClearstoneError::Encoding(format!("msgpack value has no JSON form: {e}"))
            }),
        }
    }

    pub fn format(&self) -> SerializationFormat {
        match self {
            HybridValue::Json { .. } => SerializationFormat::Json,
            HybridValue::Msgpack { .. } => SerializationFormat::Msgpack,
        }
    }

    /// Size of the encoded form in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            HybridValue::Json { value } => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            HybridValue::Msgpack { data } => data.len(),
        }
    }
}

/// A recorded input or output value attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Snapshot {
    /// The value was encoded within the size limit
    Captured { value: HybridValue, size_bytes: usize },
    /// The value was not recorded; the reason and type are kept
    Omitted { reason: String, type_name: String },
}

impl Snapshot {
    /// The captured value, if any
    pub fn value(&self) -> Option<&HybridValue> {
        match self {
            Snapshot::Captured { value, .. } => Some(value),
            Snapshot::Omitted { .. } => None,
        }
    }

    pub fn is_captured(&self) -> bool {
        matches!(self, Snapshot::Captured { .. })
    }
}

/// Size-limited snapshot capture
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCapture {
    max_bytes: usize,
}

impl Default for SnapshotCapture {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOT_BYTES)
    }
}

impl SnapshotCapture {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Capture a value. Never fails: unencodable or oversized values become `Omitted`.
    pub fn capture<T: Serialize + ?Sized>(&self, value: &T) -> Snapshot {
        let type_name = std::any::type_name::<T>().to_string();
        match HybridValue::encode(value) {
            Ok(encoded) => {
                let size_bytes = encoded.encoded_len();
                if size_bytes > self.max_bytes {
                    Snapshot::Omitted {
                        reason: format!(
                            "value is {size_bytes} bytes, limit is {} bytes",
                            self.max_bytes
                        ),
                        type_name,
                    }
                } else {
                    Snapshot::Captured {
                        value: encoded,
                        size_bytes,
                    }
                }
            }
            Err(e) => Snapshot::Omitted {
                reason: format!("serialization failed: {e}"),
                type_name,
            },
        }
    }
}

fn contains_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().any(contains_null),
        Value::Object(map) => map.values().any(contains_null),
        _ => false,
    }
}

fn has_non_finite_float(msgpack: &[u8]) -> bool {
    rmp_serde::from_slice::<NonFiniteScan>(msgpack).is_ok_and(|scan| scan.0)
}

/// Walks a self-describing value, noting whether any float is NaN or infinite
struct NonFiniteScan(bool);

impl<'de> Deserialize<'de> for NonFiniteScan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(NonFiniteVisitor)
    }
}

struct NonFiniteVisitor;

impl<'de> Visitor<'de> for NonFiniteVisitor {
    type Value = NonFiniteScan;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any value")
    }

    fn visit_bool<E: serde::de::Error>(self, _: bool) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_i64<E: serde::de::Error>(self, _: i64) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_u64<E: serde::de::Error>(self, _: u64) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(!v.is_finite()))
    }

    fn visit_str<E: serde::de::Error>(self, _: &str) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_bytes<E: serde::de::Error>(self, _: &[u8]) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_none<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(NonFiniteScan(false))
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        NonFiniteScan::deserialize(deserializer)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Self::Value, D::Error> {
        NonFiniteScan::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut found = false;
        while let Some(NonFiniteScan(item)) = seq.next_element()? {
            found |= item;
        }
        Ok(NonFiniteScan(found))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut found = false;
        while let Some((NonFiniteScan(key), NonFiniteScan(value))) = map.next_entry()? {
            found |= key || value;
        }
        Ok(NonFiniteScan(found))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_plain_values_stay_json() {
        let note = Note {
            title: "draft".to_string(),
            tags: vec!["a".to_string()],
        };
        let encoded = HybridValue::encode(&note).unwrap();
        assert_eq!(encoded.format(), SerializationFormat::Json);
        assert_eq!(encoded.to_json().unwrap(), json!({"title": "draft", "tags": ["a"]}));
        assert_eq!(encoded.decode::<Note>().unwrap(), note);
    }

    #[test]
    fn test_tuple_keys_fall_back_to_msgpack() {
        let mut grid: HashMap<(u32, u32), String> = HashMap::new();
        grid.insert((1, 2), "x".to_string());

        let encoded = HybridValue::encode(&grid).unwrap();
        assert_eq!(encoded.format(), SerializationFormat::Msgpack);

        let decoded: HashMap<(u32, u32), String> = encoded.decode().unwrap();
        assert_eq!(decoded, grid);
    }

    #[test]
    fn test_non_finite_floats_fall_back_to_msgpack() {
        let encoded = HybridValue::encode(&f64::NAN).unwrap();
        assert_eq!(encoded.format(), SerializationFormat::Msgpack);
        assert!(encoded.decode::<f64>().unwrap().is_nan());

        let ceiling = HybridValue::encode(&Some(f64::INFINITY)).unwrap();
        assert_eq!(ceiling.format(), SerializationFormat::Msgpack);
        assert_eq!(ceiling.decode::<Option<f64>>().unwrap(), Some(f64::INFINITY));

        let mut readings: HashMap<String, Vec<f64>> = HashMap::new();
        readings.insert("sensor".to_string(), vec![1.5, f64::NEG_INFINITY]);
        let nested = HybridValue::encode(&readings).unwrap();
        assert_eq!(nested.format(), SerializationFormat::Msgpack);
        assert_eq!(nested.decode::<HashMap<String, Vec<f64>>>().unwrap(), readings);
    }

    #[test]
    fn test_real_nulls_stay_json() {
        let encoded = HybridValue::encode(&(None::<f64>, 2.5f64)).unwrap();
        assert_eq!(encoded.format(), SerializationFormat::Json);
        assert_eq!(encoded.to_json().unwrap(), json!([null, 2.5]));
    }

    #[test]
    fn test_msgpack_survives_json_envelope() {
        let encoded = HybridValue::from_msgpack(vec![0x92, 0x01, 0x02]);
        let text = serde_json::to_string(&encoded).unwrap();
        assert!(text.contains("\"920102\""));

        let parsed: HybridValue = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, encoded);
        assert_eq!(parsed.to_json().unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_snapshot_respects_limit() {
        let capture = SnapshotCapture::new(16);
        assert!(capture.capture("short").is_captured());

        let large = "x".repeat(64);
        match capture.capture(&large) {
            Snapshot::Omitted { reason, type_name } => {
                assert!(reason.contains("limit"));
                assert!(type_name.contains("String"));
            }
            other => panic!("expected omitted snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_records_size() {
        let snapshot = SnapshotCapture::default().capture(&json!({"a": 1}));
        match snapshot {
            Snapshot::Captured { size_bytes, .. } => assert_eq!(size_bytes, 7),
            other => panic!("expected captured snapshot, got {other:?}"),
        }
    }
}
