// src/value.rs - Values carried from OPC UA data changes to MQTT payloads
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw value reported by the source for a monitored node.
///
/// The bridge does not interpret units or engineering ranges; it only
/// distinguishes scalars, arrays and structures so the payload can be
/// rendered faithfully.
///
/// # Examples
///
/// ```rust
/// use petra_bridge::Value;
///
/// let temp = Value::Float(21.5);
/// assert_eq!(temp.as_float(), Some(21.5));
/// assert_eq!(temp.to_json(), serde_json::json!(21.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// No value (null variant on the server)
    Empty,
    /// Boolean value
    Bool(bool),
    /// Signed integer value (64-bit)
    Int(i64),
    /// Unsigned integer value (64-bit)
    UInt(u64),
    /// Floating-point value (64-bit)
    Float(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp value
    Timestamp(DateTime<Utc>),
    /// Array of values
    Array(Vec<Value>),
    /// Structure (named fields)
    Struct(BTreeMap<String, Value>),
}

/// Quality of a reported value, collapsed from the OPC UA status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Good
    }
}

/// One data-change notification for one monitored node.
///
/// Produced by the source session, consumed once by the delivery task and
/// never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeEvent {
    pub source_node_id: String,
    pub value: Value,
    /// Source timestamp when the server supplied one, otherwise receive time
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    /// Intake order assigned by the source connection
    pub sequence: u64,
}

impl DataChangeEvent {
    /// Build an event with a good quality and the current time
    pub fn new(source_node_id: impl Into<String>, value: Value) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            value,
            timestamp: Utc::now(),
            quality: Quality::Good,
            sequence: 0,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Value {
    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Whether the value is a scalar (renders as a single token)
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Struct(_))
    }

    /// Convert to a JSON value for payload rendering
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Empty => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::UInt(u) => Json::from(*u),
            // NaN and infinities have no JSON form
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Struct(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a value from a JSON document, the inverse of [`Value::to_json`]
    /// for everything except bytes and timestamps, which arrive as arrays and strings
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Empty,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
