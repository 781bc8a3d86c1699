//! Relationship descriptors.
//!
//! A descriptor is built once at model-definition time and never mutated. The
//! resolver reads it on every query that touches the relationship.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::naming;
use crate::schema::EntitySchema;

/// How an association is physically represented.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Duplicated key property on the dependent entity (or a pivot node).
    #[default]
    ForeignKey,
    /// First-class typed edge.
    NativeEdge,
    /// Both, written together.
    Hybrid,
}

impl StorageMode {
    /// All modes, in declaration order.
    pub const ALL: [StorageMode; 3] = [
        StorageMode::ForeignKey,
        StorageMode::NativeEdge,
        StorageMode::Hybrid,
    ];

    /// Lower-case name.
    pub fn name(self) -> &'static str {
        match self {
            StorageMode::ForeignKey => "foreign_key",
            StorageMode::NativeEdge => "native_edge",
            StorageMode::Hybrid => "hybrid",
        }
    }

    /// True when an edge is written/read.
    pub fn uses_edge(self) -> bool {
        matches!(self, StorageMode::NativeEdge | StorageMode::Hybrid)
    }

    /// True when a key property (or pivot node) is written/read.
    pub fn uses_foreign_key(self) -> bool {
        matches!(self, StorageMode::ForeignKey | StorageMode::Hybrid)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relationship kinds, closed set dispatched by the resolver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RelationshipKind {
    /// Parent owns at most one related entity.
    HasOne,
    /// Parent owns many related entities.
    HasMany,
    /// Parent is owned by the related entity.
    BelongsTo,
    /// Many-to-many with optional pivot properties.
    BelongsToMany,
    /// Two-hop ownership through an intermediate entity. Read-only.
    HasManyThrough,
    /// Polymorphic has-one.
    MorphOne,
    /// Polymorphic has-many.
    MorphMany,
    /// Polymorphic inverse; `related` is the concrete owner type for this query.
    MorphTo,
    /// Polymorphic many-to-many.
    MorphToMany,
}

impl RelationshipKind {
    /// Whether the kind is polymorphic.
    pub fn is_polymorphic(self) -> bool {
        matches!(
            self,
            RelationshipKind::MorphOne
                | RelationshipKind::MorphMany
                | RelationshipKind::MorphTo
                | RelationshipKind::MorphToMany
        )
    }

    /// Whether the association carries pivot properties.
    pub fn is_many_to_many(self) -> bool {
        matches!(
            self,
            RelationshipKind::BelongsToMany | RelationshipKind::MorphToMany
        )
    }

    /// Whether the parent holds the key property (inverse side).
    pub fn is_inverse(self) -> bool {
        matches!(self, RelationshipKind::BelongsTo | RelationshipKind::MorphTo)
    }

    /// Name used in logs and introspection.
    pub fn name(self) -> &'static str {
        match self {
            RelationshipKind::HasOne => "has_one",
            RelationshipKind::HasMany => "has_many",
            RelationshipKind::BelongsTo => "belongs_to",
            RelationshipKind::BelongsToMany => "belongs_to_many",
            RelationshipKind::HasManyThrough => "has_many_through",
            RelationshipKind::MorphOne => "morph_one",
            RelationshipKind::MorphMany => "morph_many",
            RelationshipKind::MorphTo => "morph_to",
            RelationshipKind::MorphToMany => "morph_to_many",
        }
    }
}

/// Declared type of a pivot property.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyType {
    /// UTF-8 string.
    String,
    /// Integer.
    Int,
    /// Float.
    Float,
    /// Boolean.
    Bool,
    /// Date or datetime.
    DateTime,
    /// Any value.
    Any,
}

/// Intermediate hop of a has-many-through relationship.
#[derive(Clone, Debug, PartialEq)]
pub struct Through {
    /// Intermediate entity.
    pub entity: Arc<EntitySchema>,
    /// Key on the intermediate entity referencing the parent.
    pub first_key: String,
    /// Key on the related entity referencing the intermediate entity.
    pub second_key: String,
    /// Edge type of the second hop; defaults from the related label.
    pub second_edge_type: Option<String>,
}

/// Immutable description of one relationship.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipDescriptor {
    /// Relationship name on the parent entity.
    pub name: String,
    /// Kind.
    pub kind: RelationshipKind,
    /// Entity declaring the relationship.
    pub parent: Arc<EntitySchema>,
    /// Entity on the other side.
    pub related: Arc<EntitySchema>,
    /// Explicit edge type; defaults to a naming convention.
    pub edge_type: Option<String>,
    /// Relationship-level declared storage mode.
    pub storage_mode: Option<StorageMode>,
    /// Key on the owning side: the parent for has/many-to-many kinds, the related
    /// entity for inverse kinds.
    pub local_key: String,
    /// Key property on the dependent side (or on the pivot node, referencing the parent).
    pub foreign_key: String,
    /// Pivot key referencing the related entity (many-to-many).
    pub related_pivot_key: Option<String>,
    /// Key on the related entity referenced by the pivot (many-to-many).
    pub related_key: String,
    /// Label of the pivot node used in foreign-key mode (many-to-many).
    pub pivot_label: Option<String>,
    /// Declared pivot properties surfaced through the virtual pivot.
    pub pivot_properties: BTreeMap<String, PropertyType>,
    /// Polymorphic prefix (`commentable` → `commentable_id`/`commentable_type`).
    pub morph_name: Option<String>,
    /// Intermediate hop for has-many-through.
    pub through: Option<Through>,
}

fn key_for(entity: &EntitySchema) -> String {
    format!("{}_id", naming::snake_case(&entity.name))
}

impl RelationshipDescriptor {
    fn base(
        name: &str,
        kind: RelationshipKind,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            parent: Arc::clone(parent),
            related: Arc::clone(related),
            edge_type: None,
            storage_mode: None,
            local_key: parent.primary_key.clone(),
            foreign_key: key_for(parent),
            related_pivot_key: None,
            related_key: related.primary_key.clone(),
            pivot_label: None,
            pivot_properties: BTreeMap::new(),
            morph_name: None,
            through: None,
        }
    }

    /// `parent` owns one `related`; key `<parent>_id` on the related entity.
    pub fn has_one(name: &str, parent: &Arc<EntitySchema>, related: &Arc<EntitySchema>) -> Self {
        Self::base(name, RelationshipKind::HasOne, parent, related)
    }

    /// `parent` owns many `related`; key `<parent>_id` on the related entity.
    pub fn has_many(name: &str, parent: &Arc<EntitySchema>, related: &Arc<EntitySchema>) -> Self {
        Self::base(name, RelationshipKind::HasMany, parent, related)
    }

    /// `parent` is owned by `related`; key `<name>_id` on the parent.
    pub fn belongs_to(name: &str, parent: &Arc<EntitySchema>, related: &Arc<EntitySchema>) -> Self {
        let mut d = Self::base(name, RelationshipKind::BelongsTo, parent, related);
        d.local_key = related.primary_key.clone();
        d.foreign_key = format!("{}_id", naming::snake_case(name));
        d
    }

    /// Many-to-many; pivot node label defaults to both model names, sorted and joined.
    pub fn belongs_to_many(
        name: &str,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
    ) -> Self {
        let mut d = Self::base(name, RelationshipKind::BelongsToMany, parent, related);
        let mut names = [
            naming::snake_case(&parent.name),
            naming::snake_case(&related.name),
        ];
        names.sort();
        d.pivot_label = Some(names.join("_"));
        d.related_pivot_key = Some(key_for(related));
        d
    }

    /// Two-hop read-only relationship.
    pub fn has_many_through(
        name: &str,
        parent: &Arc<EntitySchema>,
        through: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
    ) -> Self {
        let mut d = Self::base(name, RelationshipKind::HasManyThrough, parent, related);
        d.through = Some(Through {
            entity: Arc::clone(through),
            first_key: key_for(parent),
            second_key: key_for(through),
            second_edge_type: None,
        });
        d
    }

    fn morph(
        name: &str,
        kind: RelationshipKind,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
        morph_name: &str,
    ) -> Self {
        let mut d = Self::base(name, kind, parent, related);
        d.morph_name = Some(morph_name.to_owned());
        d.foreign_key = format!("{morph_name}_id");
        d
    }

    /// Polymorphic has-one keyed by `<morph_name>_id` / `<morph_name>_type`.
    pub fn morph_one(
        name: &str,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
        morph_name: &str,
    ) -> Self {
        Self::morph(name, RelationshipKind::MorphOne, parent, related, morph_name)
    }

    /// Polymorphic has-many keyed by `<morph_name>_id` / `<morph_name>_type`.
    pub fn morph_many(
        name: &str,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
        morph_name: &str,
    ) -> Self {
        Self::morph(name, RelationshipKind::MorphMany, parent, related, morph_name)
    }

    /// Polymorphic inverse towards the concrete owner type `related`.
    pub fn morph_to(name: &str, parent: &Arc<EntitySchema>, related: &Arc<EntitySchema>) -> Self {
        let mut d = Self::morph(name, RelationshipKind::MorphTo, parent, related, name);
        d.local_key = related.primary_key.clone();
        d
    }

    /// Polymorphic many-to-many through a `<morph_name>s` pivot node.
    pub fn morph_to_many(
        name: &str,
        parent: &Arc<EntitySchema>,
        related: &Arc<EntitySchema>,
        morph_name: &str,
    ) -> Self {
        let mut d = Self::morph(name, RelationshipKind::MorphToMany, parent, related, morph_name);
        d.pivot_label = Some(naming::pluralize(morph_name));
        d.related_pivot_key = Some(key_for(related));
        d
    }

    /// Overrides the edge type.
    pub fn edge_type(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_type = Some(edge_type.into());
        self
    }

    /// Declares the relationship-level storage mode.
    pub fn storage(mut self, mode: StorageMode) -> Self {
        self.storage_mode = Some(mode);
        self
    }

    /// Overrides the foreign key.
    pub fn foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = key.into();
        self
    }

    /// Overrides the owning-side key.
    pub fn local_key(mut self, key: impl Into<String>) -> Self {
        self.local_key = key.into();
        self
    }

    /// Overrides the pivot node label.
    pub fn pivot_label(mut self, label: impl Into<String>) -> Self {
        self.pivot_label = Some(label.into());
        self
    }

    /// Overrides the pivot key referencing the related entity.
    pub fn related_pivot_key(mut self, key: impl Into<String>) -> Self {
        self.related_pivot_key = Some(key.into());
        self
    }

    /// Declares a pivot property.
    pub fn with_pivot(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.pivot_properties.insert(name.into(), ty);
        self
    }

    /// Property holding the polymorphic type discriminator.
    pub fn morph_type_key(&self) -> Option<String> {
        self.morph_name.as_ref().map(|m| format!("{m}_type"))
    }

    /// Edge type from the naming convention, ignoring any override.
    ///
    /// Edges always point from the owning side to the dependent side. For
    /// owning kinds the type is `HAS_` plus the pluralized, upper-snake-cased
    /// relationship name; inverse kinds derive it from the parent's primary
    /// label so both sides of an association agree.
    pub fn conventional_edge_type(&self) -> String {
        let stem = if self.kind.is_inverse() {
            naming::pluralize(&naming::snake_case(self.parent.primary_label()))
        } else if self.kind == RelationshipKind::HasManyThrough {
            let through = self
                .through
                .as_ref()
                .map(|t| t.entity.primary_label().to_owned())
                .unwrap_or_else(|| self.name.clone());
            naming::pluralize(&naming::snake_case(&through))
        } else {
            naming::pluralize(&naming::snake_case(&self.name))
        };
        format!("HAS_{}", naming::upper_snake_case(&stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities() -> (Arc<EntitySchema>, Arc<EntitySchema>, Arc<EntitySchema>) {
        (
            Arc::new(EntitySchema::new("User", "users")),
            Arc::new(EntitySchema::new("Post", "posts")),
            Arc::new(EntitySchema::new("Role", "roles")),
        )
    }

    #[test]
    fn conventional_keys() {
        let (users, posts, roles) = entities();
        let has_many = RelationshipDescriptor::has_many("posts", &users, &posts);
        assert_eq!(has_many.foreign_key, "user_id");
        assert_eq!(has_many.local_key, "id");
        let belongs = RelationshipDescriptor::belongs_to("author", &posts, &users);
        assert_eq!(belongs.foreign_key, "author_id");
        let btm = RelationshipDescriptor::belongs_to_many("roles", &users, &roles);
        assert_eq!(btm.pivot_label.as_deref(), Some("role_user"));
        assert_eq!(btm.related_pivot_key.as_deref(), Some("role_id"));
    }

    #[test]
    fn edge_type_convention_agrees_across_sides() {
        let (users, posts, _) = entities();
        let has_many = RelationshipDescriptor::has_many("posts", &users, &posts);
        let belongs = RelationshipDescriptor::belongs_to("user", &posts, &users);
        assert_eq!(has_many.conventional_edge_type(), "HAS_POSTS");
        assert_eq!(belongs.conventional_edge_type(), "HAS_POSTS");
        let camel = RelationshipDescriptor::has_many("blogPost", &users, &posts);
        assert_eq!(camel.conventional_edge_type(), "HAS_BLOG_POSTS");
    }

    #[test]
    fn storage_mode_serde_names() {
        let mode: StorageMode = serde_json::from_str("\"native_edge\"").unwrap();
        assert_eq!(mode, StorageMode::NativeEdge);
        assert_eq!(StorageMode::Hybrid.to_string(), "hybrid");
    }
}
