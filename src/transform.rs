#![forbid(unsafe_code)]

//! Response transformation: driver records to flat rows.
//!
//! Nodes and edges are flattened into property maps, JSON-string properties
//! are decoded, internal `__` columns are consumed, and aggregate results
//! collapse to a bare scalar.

use std::collections::BTreeSet;

use crate::exec::driver::{RawRecord, RawValue};
use crate::query::ast::AggregateFunction;
use crate::query::compiler::{AGGREGATE_COLUMN, MATCHED_COLUMN, PARENT_COLUMN, PIVOT_COLUMN};
use crate::query::writes::AFFECTED_COLUMN;
use crate::relation::{ResolvedRelationship, VirtualPivot};
use crate::schema::EntitySchema;
use crate::value::{PropertyMap, Value};

/// One transformed result row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    /// Entity properties, or projected columns for projection queries.
    pub attributes: PropertyMap,
    /// Type discriminator: the expected entity name when the node carries its
    /// label, otherwise the node's first label.
    pub entity_type: Option<String>,
    /// Full label list of the returned node.
    pub labels: Vec<String>,
    /// Association properties on related loads of many-to-many relationships.
    pub pivot: Option<VirtualPivot>,
    /// Key of the parent this row was loaded for (related loads).
    pub parent_key: Option<Value>,
}

impl Row {
    /// Attribute value, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// What the caller expects back.
#[derive(Clone, Debug, Default)]
pub struct ResultShape<'a> {
    entity: Option<&'a EntitySchema>,
    relation: Option<&'a ResolvedRelationship>,
    json: BTreeSet<String>,
}

impl<'a> ResultShape<'a> {
    /// Rows of `entity` (whole nodes or projected columns).
    pub fn entity(entity: &'a EntitySchema) -> Self {
        Self {
            entity: Some(entity),
            relation: None,
            json: entity.json_properties.clone(),
        }
    }

    /// Related entities loaded through `relation`.
    pub fn related(relation: &'a ResolvedRelationship) -> Self {
        Self {
            entity: Some(relation.related.as_ref()),
            relation: Some(relation),
            json: relation.related.json_properties.clone(),
        }
    }

    /// Plain columns without an entity.
    pub fn columns() -> Self {
        Self::default()
    }

    /// Additional properties known to hold JSON strings.
    pub fn with_json<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.json.extend(props.into_iter().map(Into::into));
        self
    }

    fn decode(&self, name: &str, value: Value) -> Value {
        match value {
            Value::String(text) if self.json.contains(name) => {
                Value::from_json_str(&text).unwrap_or(Value::String(text))
            }
            other => other,
        }
    }

    fn decode_map(&self, properties: impl IntoIterator<Item = (String, RawValue)>) -> PropertyMap {
        properties
            .into_iter()
            .map(|(k, v)| {
                let value = self.decode(&k, v.into_value());
                (k, value)
            })
            .collect()
    }

    fn entity_type(&self, labels: &[String]) -> Option<String> {
        match self.entity {
            Some(entity) if labels.iter().any(|l| l == entity.primary_label()) => Some(entity.name.clone()),
            _ => labels.first().cloned(),
        }
    }

    fn pivot(&self, raw: RawValue) -> Option<VirtualPivot> {
        let relation = self.relation?;
        let stored: PropertyMap = match raw {
            RawValue::Map(map) => self.decode_map(map),
            RawValue::Edge(edge) => self.decode_map(edge.properties),
            RawValue::Node(node) => self.decode_map(node.properties),
            _ => return None,
        };
        let mut pivot = VirtualPivot::from_stored(relation, stored);
        if !relation.pivot_properties.is_empty() {
            let declared: PropertyMap = pivot
                .properties()
                .iter()
                .filter(|(k, _)| relation.pivot_properties.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            pivot = VirtualPivot::new(relation.name.clone(), relation.edge_type.clone(), declared);
        }
        Some(pivot)
    }
}

/// Transforms driver records into rows.
pub fn transform(records: Vec<RawRecord>, shape: &ResultShape<'_>) -> Vec<Row> {
    records.into_iter().map(|record| transform_record(record, shape)).collect()
}

fn transform_record(record: RawRecord, shape: &ResultShape<'_>) -> Row {
    let mut row = Row::default();
    for (name, raw) in record.fields {
        if name == PARENT_COLUMN {
            row.parent_key = Some(raw.into_value());
            continue;
        }
        if name == PIVOT_COLUMN {
            row.pivot = shape.pivot(raw);
            continue;
        }
        if name.starts_with("__") {
            continue;
        }
        match raw {
            RawValue::Node(node) => {
                row.entity_type = shape.entity_type(&node.labels);
                row.labels = node.labels;
                row.attributes.extend(shape.decode_map(node.properties));
            }
            RawValue::Edge(edge) => {
                row.entity_type = Some(edge.edge_type.clone());
                row.labels = vec![edge.edge_type];
                row.attributes.extend(shape.decode_map(edge.properties));
            }
            other => {
                let value = shape.decode(&name, other.into_value());
                row.attributes.insert(name, value);
            }
        }
    }
    row
}

/// Collapses an ungrouped aggregate result to one scalar.
///
/// Zero matched rows report the function's empty value: `0` for counts, an
/// empty list for `collect`, `null` for everything else.
pub fn aggregate_scalar(records: Vec<RawRecord>, function: AggregateFunction) -> Value {
    let Some(record) = records.into_iter().next() else {
        return function.empty_value();
    };
    if let Some(RawValue::Int(0)) = record.get(MATCHED_COLUMN) {
        return function.empty_value();
    }
    let raw = match record.get(AGGREGATE_COLUMN) {
        Some(value) => value.clone(),
        None => record
            .fields
            .into_iter()
            .find(|(name, _)| !name.starts_with("__"))
            .map(|(_, value)| value)
            .unwrap_or(RawValue::Null),
    };
    match raw.into_value() {
        Value::Null => function.empty_value(),
        value => value,
    }
}

/// Reads the affected count written by write statements.
pub fn affected_count(records: &[RawRecord]) -> u64 {
    records
        .iter()
        .filter_map(|r| match r.get(AFFECTED_COLUMN) {
            Some(RawValue::Int(n)) => u64::try_from(*n).ok(),
            _ => None,
        })
        .sum()
}
