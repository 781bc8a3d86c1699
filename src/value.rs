//! Canonical value representation shared by the builder, binder, coordinator
//! and response transformer.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Typed value tagged with explicit type information so the wire format remains
/// unambiguous across drivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Arbitrary binary payload represented as bytes.
    Bytes(Vec<u8>),
    /// Nanoseconds since Unix epoch in UTC.
    DateTime(i128),
    /// Sequential collection.
    List(Vec<Value>),
    /// Associative collection.
    Map(BTreeMap<String, Value>),
}

/// How a value is physically stored in a graph property.
///
/// Flat sequential collections become native lists; associative or nested
/// collections are serialized to a JSON string. The same rule drives writes
/// (binder) and JSON predicates (operator translator).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StorageRepr {
    /// Scalar stored as-is.
    Scalar,
    /// Flat list stored as the driver's native list type.
    NativeList,
    /// Associative or nested structure stored as a JSON string.
    JsonString,
}

impl Value {
    /// Returns true for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true for values that are neither lists nor maps.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Storage representation chosen by the hybrid coercion rule.
    pub fn storage_repr(&self) -> StorageRepr {
        match self {
            Value::List(items) if items.iter().all(Value::is_scalar) => StorageRepr::NativeList,
            Value::List(_) | Value::Map(_) => StorageRepr::JsonString,
            _ => StorageRepr::Scalar,
        }
    }

    /// Stable textual identity used to deduplicate bindings.
    pub(crate) fn fingerprint(&self) -> String {
        format!("{self:?}")
    }

    /// Converts into an untagged JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Value::DateTime(nanos) => match format_datetime(*nanos) {
                Some(text) => Json::String(text),
                None => Json::String(nanos.to_string()),
            },
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Builds a value from an untagged JSON document.
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Serializes into the JSON-in-a-string form used for nested properties.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Parses the JSON-in-a-string form. Returns `None` when the text is not JSON.
    pub fn from_json_str(text: &str) -> Option<Self> {
        serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .map(Value::from_json)
    }

    /// Borrows the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

fn format_datetime(nanos: i128) -> Option<String> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::DateTime(nanos) => match format_datetime(*nanos) {
                Some(text) => write!(f, "datetime({text})"),
                None => write!(f, "datetime({nanos})"),
            },
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::DateTime(value.unix_timestamp_nanos())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordered property map used for writes and hydrated rows.
pub type PropertyMap = BTreeMap<String, Value>;

/// Builds a [`PropertyMap`] from `(name, value)` pairs.
pub fn props<I, K, V>(pairs: I) -> PropertyMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn flat_lists_are_native_and_nested_are_json() {
        let flat = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(flat.storage_repr(), StorageRepr::NativeList);
        let nested = Value::List(vec![Value::List(vec![Value::Int(1)])]);
        assert_eq!(nested.storage_repr(), StorageRepr::JsonString);
        let map = Value::Map(props([("a", 1i64)]));
        assert_eq!(map.storage_repr(), StorageRepr::JsonString);
        assert_eq!(Value::Int(3).storage_repr(), StorageRepr::Scalar);
        assert_eq!(Value::List(vec![]).storage_repr(), StorageRepr::NativeList);
    }

    #[test]
    fn json_string_roundtrips_nested_structures() {
        let value = Value::Map(props([
            ("lang", Value::from("en")),
            ("tags", Value::List(vec![Value::from("a"), Value::from("b")])),
        ]));
        let text = value.to_json_string();
        assert_eq!(Value::from_json_str(&text), Some(value));
        assert_eq!(Value::from_json_str("not json"), None);
    }

    #[test]
    fn datetime_renders_rfc3339() {
        let value = Value::from(datetime!(2024-01-02 03:04:05 UTC));
        assert_eq!(value.to_string(), "datetime(2024-01-02T03:04:05Z)");
    }
}
