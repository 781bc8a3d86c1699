//! Virtual pivot objects surfaced on many-to-many results.

use std::fmt;

use crate::query::errors::CompilationError;
use crate::relation::resolver::ResolvedRelationship;
use crate::value::{PropertyMap, Value};

/// Read-only view over the properties of one many-to-many association.
///
/// Built from the edge in `NativeEdge` mode, from the pivot node in
/// `ForeignKey` mode, and from whichever exists (edge first) in `Hybrid`
/// mode. Mutating the association is an explicit call
/// (`GraphConnection::update_edge`), which returns a fresh pivot.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualPivot {
    relation: String,
    edge_type: String,
    properties: PropertyMap,
}

impl VirtualPivot {
    /// Wraps already filtered properties.
    pub fn new(relation: impl Into<String>, edge_type: impl Into<String>, properties: PropertyMap) -> Self {
        Self {
            relation: relation.into(),
            edge_type: edge_type.into(),
            properties,
        }
    }

    /// Builds a pivot from stored properties, dropping the key bookkeeping a
    /// pivot node carries.
    pub fn from_stored(rel: &ResolvedRelationship, mut stored: PropertyMap) -> Self {
        stored.remove(&rel.foreign_key);
        stored.remove(&rel.related_pivot_key);
        if let Some((type_key, _)) = &rel.morph {
            stored.remove(type_key);
        }
        Self::new(rel.name.clone(), rel.edge_type.clone(), stored)
    }

    /// Relationship name.
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Edge type of the association.
    pub fn edge_type(&self) -> &str {
        &self.edge_type
    }

    /// Property value, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// All pivot properties.
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }
}

impl fmt::Display for VirtualPivot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{{", self.relation, self.edge_type)?;
        for (i, (k, v)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        f.write_str("}")
    }
}

/// Rejects pivot properties on relationships without a pivot or not declared on it.
pub(crate) fn check_pivot_properties(
    rel: &ResolvedRelationship,
    properties: &PropertyMap,
) -> Result<(), CompilationError> {
    if properties.is_empty() {
        return Ok(());
    }
    if !rel.kind.is_many_to_many() {
        return Err(CompilationError::PivotNotSupported {
            relation: rel.name.clone(),
        });
    }
    if let Some(unknown) = properties
        .keys()
        .find(|key| !rel.pivot_properties.contains_key(*key))
    {
        return Err(CompilationError::UnknownPivotProperty {
            relation: rel.name.clone(),
            property: unknown.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relation::descriptor::{PropertyType, RelationshipDescriptor, StorageMode};
    use crate::relation::resolver::{resolve, ResolutionContext};
    use crate::schema::EntitySchema;
    use crate::value::props;

    fn roles(mode: StorageMode) -> ResolvedRelationship {
        let users = Arc::new(EntitySchema::new("User", "users"));
        let roles = Arc::new(EntitySchema::new("Role", "roles"));
        let descriptor = RelationshipDescriptor::belongs_to_many("roles", &users, &roles)
            .with_pivot("since", PropertyType::DateTime);
        resolve(&descriptor, &ResolutionContext::new(mode)).unwrap()
    }

    #[test]
    fn stored_pivot_node_keys_are_hidden() {
        let rel = roles(StorageMode::ForeignKey);
        let pivot = VirtualPivot::from_stored(
            &rel,
            props([
                ("user_id", Value::Int(1)),
                ("role_id", Value::Int(2)),
                ("since", Value::from("2024")),
            ]),
        );
        assert_eq!(pivot.get("since"), Some(&Value::from("2024")));
        assert_eq!(pivot.get("user_id"), None);
        assert_eq!(pivot.properties().len(), 1);
        assert_eq!(pivot.edge_type(), "HAS_ROLES");
    }

    #[test]
    fn undeclared_pivot_properties_are_rejected() {
        let rel = roles(StorageMode::NativeEdge);
        let err = check_pivot_properties(&rel, &props([("level", Value::Int(1))])).unwrap_err();
        assert_eq!(err.code(), "UnknownPivotProperty");
        assert!(check_pivot_properties(&rel, &props([("since", Value::from("x"))])).is_ok());
    }
}
