//! Span attribute values
//!
//! Attributes are a closed set of JSON-representable kinds: scalars, arrays of
//! scalars and string-keyed maps of scalars. Values are validated when they are
//! inserted so that every stored span serializes without loss.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ClearstoneError, Result};

/// Attribute map attached to spans and span events. Keys are kept sorted.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// A permitted attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Scalar>),
    Map(BTreeMap<String, Scalar>),
}

impl Scalar {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Scalar::Float(f) if !f.is_finite() => Err(format!("non-finite float {f}")),
            _ => Ok(()),
        }
    }

    fn from_json(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(Scalar::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Scalar::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Scalar::Float(f))
                } else {
                    Err(format!("unrepresentable number {n}"))
                }
            }
            Value::String(s) => Ok(Scalar::String(s.clone())),
            Value::Null => Err("null is not a permitted value".to_string()),
            Value::Array(_) | Value::Object(_) => {
                Err("nested arrays and maps are not permitted".to_string())
            }
        }
    }
}

impl AttributeValue {
    /// Check that the value can be stored and serialized without loss.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAttribute` for non-finite floats.
    pub fn validate(&self, key: &str) -> Result<()> {
        let outcome = match self {
            AttributeValue::Float(f) if !f.is_finite() => Err(format!("non-finite float {f}")),
            AttributeValue::Array(items) => items.iter().try_for_each(Scalar::validate),
            AttributeValue::Map(entries) => entries.values().try_for_each(Scalar::validate),
            _ => Ok(()),
        };
        outcome.map_err(|reason| ClearstoneError::InvalidAttribute {
            key: key.to_string(),
            reason,
        })
    }

    /// Convert an arbitrary JSON value, rejecting kinds outside the permitted set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAttribute` for nulls, nested containers and non-finite numbers.
    pub fn from_json(key: &str, value: &Value) -> Result<Self> {
        let invalid = |reason: String| ClearstoneError::InvalidAttribute {
            key: key.to_string(),
            reason,
        };

        let converted = match value {
            Value::Array(items) => AttributeValue::Array(
                items
                    .iter()
                    .map(Scalar::from_json)
                    .collect::<std::result::Result<_, _>>()
                    .map_err(invalid)?,
            ),
            Value::Object(map) => AttributeValue::Map(
                map.iter()
                    .map(|(k, v)| Scalar::from_json(v).map(|s| (k.clone(), s)))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(invalid)?,
            ),
            other => match Scalar::from_json(other).map_err(invalid)? {
                Scalar::Bool(b) => AttributeValue::Bool(b),
                Scalar::Int(i) => AttributeValue::Int(i),
                Scalar::Float(f) => AttributeValue::Float(f),
                Scalar::String(s) => AttributeValue::String(s),
            },
        };
        converted.validate(key)?;
        Ok(converted)
    }

    /// Get the value as a string slice, if it is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl<T: Into<Scalar>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        AttributeValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Scalar>> for AttributeValue {
    fn from(map: BTreeMap<String, Scalar>) -> Self {
        AttributeValue::Map(map)
    }
}
