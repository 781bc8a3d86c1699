#![forbid(unsafe_code)]

//! Driver boundary.
//!
//! The engine never speaks a wire protocol itself. A [`Driver`] executes
//! statement text with a parameter map and hands back loosely typed records;
//! everything above it (retry, batching, transaction counting) lives in the
//! coordinator.

use std::collections::BTreeMap;
use std::fmt;

use crate::query::statement::CompiledStatement;
use crate::value::Value;

/// Opaque handle for a driver-side transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransactionHandle(pub u64);

/// Graph node as returned by the driver.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RawNode {
    /// Driver-assigned identity.
    pub id: i64,
    /// Full label set, in driver order.
    pub labels: Vec<String>,
    /// Stored properties.
    pub properties: BTreeMap<String, RawValue>,
}

/// Graph edge as returned by the driver.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RawEdge {
    /// Driver-assigned identity.
    pub id: i64,
    /// Edge type.
    pub edge_type: String,
    /// Start node identity.
    pub start: i64,
    /// End node identity.
    pub end: i64,
    /// Stored properties.
    pub properties: BTreeMap<String, RawValue>,
}

/// Record value vocabulary shared by every driver.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
    Node(RawNode),
    Edge(RawEdge),
}

impl RawValue {
    /// Converts a scalar or collection into an engine value. Nodes and edges
    /// collapse to their property maps.
    pub fn into_value(self) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(b),
            RawValue::Int(i) => Value::Int(i),
            RawValue::Float(f) => Value::Float(f),
            RawValue::String(s) => Value::String(s),
            RawValue::Bytes(b) => Value::Bytes(b),
            RawValue::List(items) => Value::List(items.into_iter().map(RawValue::into_value).collect()),
            RawValue::Map(map) | RawValue::Node(RawNode { properties: map, .. }) | RawValue::Edge(RawEdge { properties: map, .. }) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, v.into_value())).collect())
            }
        }
    }

    /// True for [`RawValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Int(i) => RawValue::Int(i),
            Value::Float(f) => RawValue::Float(f),
            Value::String(s) => RawValue::String(s),
            Value::Bytes(b) => RawValue::Bytes(b),
            Value::DateTime(_) => RawValue::String(value.to_string()),
            Value::List(items) => RawValue::List(items.into_iter().map(RawValue::from).collect()),
            Value::Map(map) => RawValue::Map(map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_owned())
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

/// One result record: ordered `(column, value)` pairs.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RawRecord {
    /// Columns in `RETURN` order.
    pub fields: Vec<(String, RawValue)>,
}

impl RawRecord {
    /// Builds a record from `(column, value)` pairs.
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<RawValue>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `column`, if returned.
    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Records returned by one statement.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RawResult {
    /// Rows in driver order.
    pub records: Vec<RawRecord>,
}

impl RawResult {
    /// Result without records.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Result wrapping `records`.
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    /// Single record with a single `affected` count, the shape writes return.
    pub fn affected(count: i64) -> Self {
        Self::from_records(vec![RawRecord::new([("affected", RawValue::Int(count))])])
    }
}

/// Failure category driving the retry decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorClass {
    /// Deadlock, lock timeout, leader switch: expected to succeed on retry.
    Transient,
    /// Stale or broken connection: reconnect, then retry.
    Connection,
    /// Unique or key constraint breach.
    Constraint,
    /// Credentials rejected.
    Authentication,
    /// Syntax errors and everything else that will fail again.
    Permanent,
}

/// Error reported by a driver, optionally pre-classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverError {
    /// Vendor status code such as `Neo.TransientError.Transaction.DeadlockDetected`.
    pub code: Option<String>,
    /// Human readable message.
    pub message: String,
    /// Classification supplied by the driver; classified from code and message when absent.
    pub class: Option<ErrorClass>,
}

impl DriverError {
    /// Unclassified error with a vendor code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            class: None,
        }
    }

    /// Error carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            class: None,
        }
    }

    /// Pre-classified error.
    pub fn classified(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            class: Some(class),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Operations the engine consumes from a graph database client.
///
/// Implementations must be usable from several threads; one checked-out
/// transaction handle is only ever used by one logical call at a time.
pub trait Driver: Send + Sync {
    /// Executes one statement, inside `tx` when given.
    fn execute(
        &self,
        text: &str,
        parameters: &BTreeMap<String, Value>,
        tx: Option<TransactionHandle>,
    ) -> Result<RawResult, DriverError>;

    /// Whether [`Driver::execute_batch`] sends one request for many statements.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Executes statements in order, stopping at the first failure.
    fn execute_batch(
        &self,
        statements: &[CompiledStatement],
        tx: Option<TransactionHandle>,
    ) -> Result<Vec<RawResult>, DriverError> {
        statements
            .iter()
            .map(|stmt| self.execute(stmt.text(), stmt.parameters(), tx))
            .collect()
    }

    /// Opens a transaction.
    fn begin_transaction(&self) -> Result<TransactionHandle, DriverError>;

    /// Commits `tx`.
    fn commit(&self, tx: TransactionHandle) -> Result<(), DriverError>;

    /// Rolls back `tx`.
    fn rollback(&self, tx: TransactionHandle) -> Result<(), DriverError>;

    /// Liveness probe.
    fn ping(&self) -> bool;

    /// Re-establishes the underlying connection after a connection-class failure.
    fn reconnect(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_collapse_to_property_maps() {
        let mut properties = BTreeMap::new();
        properties.insert("name".to_owned(), RawValue::from("ada"));
        let node = RawValue::Node(RawNode {
            id: 1,
            labels: vec!["users".into()],
            properties,
        });
        let Value::Map(map) = node.into_value() else {
            panic!("expected map");
        };
        assert_eq!(map["name"], Value::from("ada"));
    }

    #[test]
    fn record_lookup_by_column() {
        let record = RawRecord::new([("aggregate", RawValue::Int(3)), ("__matched", RawValue::Int(3))]);
        assert_eq!(record.get("aggregate"), Some(&RawValue::Int(3)));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.len(), 2);
    }
}
