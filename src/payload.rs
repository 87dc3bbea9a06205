// Payload decoding and the typed key/value records that the storage layer
// writes into the "latest" and "history" tables of each data kind.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Decoded message body: JSON object keys mapped to arbitrary JSON values.
pub type DecodedPayload = Map<String, Value>;

/// The two message categories understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    Telemetry,
    Attribute,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Telemetry => "telemetry",
            DataKind::Attribute => "attribute",
        }
    }

    /// Table holding the current value per device and key.
    pub fn latest_table(&self) -> &'static str {
        match self {
            DataKind::Telemetry => "telemetry_latest",
            DataKind::Attribute => "attribute_latest",
        }
    }

    /// Append-only series table.
    pub fn history_table(&self) -> &'static str {
        match self {
            DataKind::Telemetry => "telemetry_history",
            DataKind::Attribute => "attribute_history",
        }
    }
}

/// Which side of the link produced the data. Everything received over the
/// broker is client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSide {
    ClientSide,
    ServerSide,
}

impl DataSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSide::ClientSide => "client",
            DataSide::ServerSide => "server",
        }
    }
}

/// Decode a raw payload as a UTF-8 JSON object. Arrays, scalars and invalid
/// text are rejected.
pub fn decode_payload(raw: &[u8]) -> Result<DecodedPayload, DecodeError> {
    Ok(serde_json::from_slice::<DecodedPayload>(raw)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Long,
    Double,
    String,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Json => "json",
        }
    }
}

/// One payload entry split into typed columns. Exactly one of the value
/// columns is populated, matching `value_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value_type: ValueType,
    pub boolean: Option<bool>,
    pub long: Option<i64>,
    pub double: Option<f64>,
    pub string: Option<String>,
    pub json: Option<String>,
}

impl KeyValue {
    fn empty(key: &str, value_type: ValueType) -> Self {
        Self {
            key: key.to_string(),
            value_type,
            boolean: None,
            long: None,
            double: None,
            string: None,
            json: None,
        }
    }

    pub fn from_entry(key: &str, value: &Value) -> Self {
        match value {
            Value::Bool(b) => Self {
                boolean: Some(*b),
                ..Self::empty(key, ValueType::Boolean)
            },
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self {
                    long: Some(i),
                    ..Self::empty(key, ValueType::Long)
                },
                // u64 beyond i64 range and all floats land here
                None => Self {
                    double: n.as_f64(),
                    ..Self::empty(key, ValueType::Double)
                },
            },
            Value::String(s) => Self {
                string: Some(s.clone()),
                ..Self::empty(key, ValueType::String)
            },
            other => Self {
                json: Some(other.to_string()),
                ..Self::empty(key, ValueType::Json)
            },
        }
    }
}

/// Flatten a decoded payload into one typed record per top-level key.
pub fn key_values(payload: &DecodedPayload) -> Vec<KeyValue> {
    payload
        .iter()
        .map(|(key, value)| KeyValue::from_entry(key, value))
        .collect()
}
