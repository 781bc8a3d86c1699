//! Entity metadata supplied by the model layer: label sets, identifying
//! property, soft-delete and JSON property declarations, and the registry of
//! relationship descriptors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::naming;
use crate::query::errors::CompilationError;
use crate::relation::{RelationshipDescriptor, StorageMode};

/// Label set of an entity; the first label is the primary one.
pub type LabelSet = SmallVec<[String; 2]>;

/// Graph-side description of one entity type.
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySchema {
    /// Model name, also used as the polymorphic type discriminator.
    pub name: String,
    /// Full label set matched on every query; primary label first.
    pub labels: LabelSet,
    /// Identifying property.
    pub primary_key: String,
    /// Properties guaranteed unique besides the primary key.
    pub unique_properties: BTreeSet<String>,
    /// Owning-model default for relationship storage.
    pub default_storage_mode: Option<StorageMode>,
    /// Soft-delete marker property, if the entity soft deletes.
    pub soft_delete: Option<String>,
    /// Properties persisted as JSON strings.
    pub json_properties: BTreeSet<String>,
}

impl EntitySchema {
    /// New entity with a single label and `id` as primary key.
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        let mut labels = LabelSet::new();
        labels.push(label.into());
        Self {
            name: name.into(),
            labels,
            primary_key: "id".to_owned(),
            unique_properties: BTreeSet::new(),
            default_storage_mode: None,
            soft_delete: None,
            json_properties: BTreeSet::new(),
        }
    }

    /// Adds a secondary label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Overrides the identifying property.
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// Declares a unique property.
    pub fn unique(mut self, prop: impl Into<String>) -> Self {
        self.unique_properties.insert(prop.into());
        self
    }

    /// Sets the owning-model default storage mode.
    pub fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.default_storage_mode = Some(mode);
        self
    }

    /// Enables soft deletes using `prop` as marker.
    pub fn soft_deletes(mut self, prop: impl Into<String>) -> Self {
        self.soft_delete = Some(prop.into());
        self
    }

    /// Declares a property stored as a JSON string.
    pub fn json(mut self, prop: impl Into<String>) -> Self {
        self.json_properties.insert(prop.into());
        self
    }

    /// Primary label.
    pub fn primary_label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or_default()
    }

    /// `:a:b` label pattern over the full label set.
    pub fn label_pattern(&self) -> String {
        naming::label_pattern(&self.labels)
    }

    /// True when `prop` is the primary key or declared unique.
    pub fn is_unique(&self, prop: &str) -> bool {
        prop == self.primary_key || self.unique_properties.contains(prop)
    }

    pub(crate) fn ensure_labels(&self) -> Result<(), CompilationError> {
        if self.labels.is_empty() {
            return Err(CompilationError::EmptyLabels {
                entity: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Registry of entities and the relationships declared on them.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
    relations: BTreeMap<(String, String), Arc<RelationshipDescriptor>>,
}

impl SchemaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an entity and returns the shared handle.
    pub fn register_entity(&mut self, schema: EntitySchema) -> Arc<EntitySchema> {
        let schema = Arc::new(schema);
        self.entities
            .insert(schema.name.clone(), Arc::clone(&schema));
        schema
    }

    /// Registers a relationship under its parent entity.
    pub fn register_relation(&mut self, descriptor: RelationshipDescriptor) -> Arc<RelationshipDescriptor> {
        let key = (descriptor.parent.name.clone(), descriptor.name.clone());
        let descriptor = Arc::new(descriptor);
        self.relations.insert(key, Arc::clone(&descriptor));
        descriptor
    }

    /// Looks up an entity by model name.
    pub fn entity(&self, name: &str) -> Result<Arc<EntitySchema>, CompilationError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| CompilationError::UnknownEntity {
                entity: name.to_owned(),
            })
    }

    /// Looks up a relationship declared on `entity`.
    pub fn relation(
        &self,
        entity: &str,
        name: &str,
    ) -> Result<Arc<RelationshipDescriptor>, CompilationError> {
        self.relations
            .get(&(entity.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| CompilationError::UnknownRelationship {
                entity: entity.to_owned(),
                relation: name.to_owned(),
            })
    }

    /// All relationships declared on `entity`, sorted by name.
    pub fn relations_of<'a>(
        &'a self,
        entity: &'a str,
    ) -> impl Iterator<Item = &'a Arc<RelationshipDescriptor>> + 'a {
        self.relations
            .iter()
            .filter(move |((owner, _), _)| owner == entity)
            .map(|(_, descriptor)| descriptor)
    }

    /// Every declared relationship, nested existence filters included.
    pub fn all_relations(&self) -> Vec<Arc<RelationshipDescriptor>> {
        self.relations.values().cloned().collect()
    }

    /// All registered entities.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_pattern_covers_full_label_set() {
        let admin = EntitySchema::new("Admin", "users").with_label("admins");
        assert_eq!(admin.label_pattern(), ":users:admins");
        assert_eq!(admin.primary_label(), "users");
    }

    #[test]
    fn registry_reports_unknown_names() {
        let mut registry = SchemaRegistry::new();
        registry.register_entity(EntitySchema::new("User", "users"));
        assert!(registry.entity("User").is_ok());
        assert_eq!(
            registry.entity("Ghost").unwrap_err().code(),
            "UnknownEntity"
        );
        assert_eq!(
            registry.relation("User", "posts").unwrap_err().code(),
            "UnknownRelationship"
        );
    }
}
