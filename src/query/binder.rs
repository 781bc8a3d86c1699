//! Parameter binding.
//!
//! Placeholders follow one canonical scheme: `$p0`, `$p1`, ... in the order
//! values are first bound within a statement. Raw fragments may add
//! caller-named bindings, which must not collide with that scheme.
//!
//! Coercion before binding: scalars pass through, flat sequential collections
//! stay native lists, associative or nested collections become JSON strings
//! (and the written property is tagged so reads can decode it).

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::naming;
use crate::query::ast::Operator;
use crate::query::errors::CompilationError;
use crate::value::{StorageRepr, Value};

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct BindKey {
    column: String,
    operator: Operator,
    position: usize,
    fingerprint: String,
}

/// Collects literal values for one statement into a flat name → value map.
#[derive(Debug, Default)]
pub struct ParameterBinder {
    parameters: BTreeMap<String, Value>,
    reuse: FxHashMap<BindKey, String>,
    json_encoded: BTreeSet<String>,
    next: usize,
}

impl ParameterBinder {
    /// Empty binder.
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, value: Value) -> String {
        loop {
            let name = format!("p{}", self.next);
            self.next += 1;
            if !self.parameters.contains_key(&name) {
                self.parameters.insert(name.clone(), value);
                return format!("${name}");
            }
        }
    }

    /// Binds a predicate operand.
    ///
    /// An identical `(column, operator, position, value)` already bound in this
    /// statement reuses its placeholder.
    pub fn bind_operand(
        &mut self,
        column: &str,
        operator: Operator,
        position: usize,
        value: Value,
    ) -> String {
        let (value, _) = coerce(value);
        let key = BindKey {
            column: column.to_owned(),
            operator,
            position,
            fingerprint: value.fingerprint(),
        };
        if let Some(existing) = self.reuse.get(&key) {
            return existing.clone();
        }
        let placeholder = self.fresh(value);
        self.reuse.insert(key, placeholder.clone());
        placeholder
    }

    /// Binds a list operand as one native list, dropping repeated elements.
    pub fn bind_list(&mut self, column: &str, operator: Operator, values: Vec<Value>) -> String {
        let mut seen = BTreeSet::new();
        let mut items = Vec::with_capacity(values.len());
        for value in values {
            let (value, _) = coerce(value);
            if seen.insert(value.fingerprint()) {
                items.push(value);
            }
        }
        self.bind_operand(column, operator, 0, Value::List(items))
    }

    /// Binds a property value for a write and tags JSON-encoded properties.
    pub fn bind_property(&mut self, property: &str, value: Value) -> String {
        let (value, repr) = coerce(value);
        if repr == StorageRepr::JsonString {
            self.json_encoded.insert(property.to_owned());
        }
        self.fresh(value)
    }

    /// Binds an arbitrary value under a fresh placeholder.
    pub fn bind_value(&mut self, value: Value) -> String {
        let (value, _) = coerce(value);
        self.fresh(value)
    }

    /// Binds a caller-named value used by a raw fragment.
    pub fn bind_named(&mut self, name: &str, value: Value) -> Result<String, CompilationError> {
        let reserved = name
            .strip_prefix('p')
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
        if !naming::is_identifier(name) || reserved {
            return Err(CompilationError::InvalidBindingName {
                name: name.to_owned(),
            });
        }
        let (value, _) = coerce(value);
        match self.parameters.get(name) {
            Some(existing) if *existing != value => Err(CompilationError::InvalidBindingName {
                name: name.to_owned(),
            }),
            _ => {
                self.parameters.insert(name.to_owned(), value);
                Ok(format!("${name}"))
            }
        }
    }

    /// Number of bound parameters so far.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Consumes the binder, returning the parameter map and JSON-encoded property names.
    pub fn finish(self) -> (BTreeMap<String, Value>, BTreeSet<String>) {
        (self.parameters, self.json_encoded)
    }
}

/// Applies the hybrid storage coercion rule.
pub fn coerce(value: Value) -> (Value, StorageRepr) {
    let repr = value.storage_repr();
    match repr {
        StorageRepr::JsonString => (Value::String(value.to_json_string()), repr),
        StorageRepr::NativeList | StorageRepr::Scalar => (value, repr),
    }
}

/// Binds `values` under fresh placeholders, returning placeholders and parameters.
pub fn bind<I>(values: I) -> (Vec<String>, BTreeMap<String, Value>)
where
    I: IntoIterator<Item = Value>,
{
    let mut binder = ParameterBinder::new();
    let placeholders = values
        .into_iter()
        .map(|value| binder.bind_value(value))
        .collect();
    (placeholders, binder.finish().0)
}
