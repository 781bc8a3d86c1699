#![forbid(unsafe_code)]
//! Relationship storage resolution.
//!
//! Resolution is a pure function of the descriptor and the layered
//! configuration passed in; nothing is read from ambient state. Precedence,
//! highest first: per-query override, relationship declaration, owning-model
//! default, process default.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::query::binder::ParameterBinder;
use crate::query::errors::CompilationError;
use crate::relation::descriptor::{
    PropertyType, RelationshipDescriptor, RelationshipKind, StorageMode,
};
use crate::relation::mutation::link_clauses;
use crate::relation::patterns::{link_pattern, LinkPattern};
use crate::schema::EntitySchema;
use crate::value::PropertyMap;

/// Configuration levels consulted for one resolution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StorageLayers {
    /// Level 1: explicit per-query override.
    pub query_override: Option<StorageMode>,
    /// Level 2: relationship-specific declared mode.
    pub relationship: Option<StorageMode>,
    /// Level 3: owning-model default.
    pub model: Option<StorageMode>,
    /// Level 4: process-wide default (always set).
    pub process: StorageMode,
}

/// Which level decided the mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeSource {
    /// Per-query override.
    QueryOverride,
    /// Relationship declaration.
    Relationship,
    /// Owning-model default.
    Model,
    /// Process default.
    Process,
    /// Polymorphic relationships always use foreign keys.
    Polymorphic,
}

impl StorageLayers {
    /// Picks the highest-precedence non-empty level.
    pub fn pick(&self) -> (StorageMode, ModeSource) {
        if let Some(mode) = self.query_override {
            (mode, ModeSource::QueryOverride)
        } else if let Some(mode) = self.relationship {
            (mode, ModeSource::Relationship)
        } else if let Some(mode) = self.model {
            (mode, ModeSource::Model)
        } else {
            (self.process, ModeSource::Process)
        }
    }
}

/// Per-call inputs that are not part of the descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolutionContext {
    /// Level 1 override for this call only.
    pub query_override: Option<StorageMode>,
    /// Level 4 process default, taken from the configuration snapshot.
    pub process_default: StorageMode,
}

impl ResolutionContext {
    /// Context with only the process default set.
    pub fn new(process_default: StorageMode) -> Self {
        Self {
            query_override: None,
            process_default,
        }
    }

    /// Adds a per-query override.
    pub fn with_override(mut self, mode: Option<StorageMode>) -> Self {
        self.query_override = mode;
        self
    }
}

/// Plain-data result of resolution, held constant for the lifetime of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRelationship {
    /// Relationship name.
    pub name: String,
    /// Kind.
    pub kind: RelationshipKind,
    /// Active storage mode.
    pub mode: StorageMode,
    /// Level that decided `mode`.
    pub source: ModeSource,
    /// Edge type (meaningful when `mode` uses edges).
    pub edge_type: String,
    /// Declaring entity.
    pub parent: Arc<EntitySchema>,
    /// Entity on the other side.
    pub related: Arc<EntitySchema>,
    /// Owning-side key.
    pub local_key: String,
    /// Dependent-side (or pivot) key.
    pub foreign_key: String,
    /// Pivot key referencing the related entity.
    pub related_pivot_key: String,
    /// Key on the related entity referenced by the pivot.
    pub related_key: String,
    /// Pivot node label for foreign-key many-to-many.
    pub pivot_label: String,
    /// Declared pivot properties.
    pub pivot_properties: BTreeMap<String, PropertyType>,
    /// Polymorphic discriminator property and the value this side writes/reads.
    pub morph: Option<(String, String)>,
    /// Has-many-through hop: (entity, first key, second key, second edge type).
    pub through: Option<ResolvedThrough>,
}

/// Resolved intermediate hop.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedThrough {
    /// Intermediate entity.
    pub entity: Arc<EntitySchema>,
    /// Key on the intermediate entity referencing the parent.
    pub first_key: String,
    /// Key on the related entity referencing the intermediate entity.
    pub second_key: String,
    /// Edge type from intermediate to related.
    pub second_edge_type: String,
}

impl ResolvedRelationship {
    /// Whether edges are part of the active representation.
    pub fn uses_edge(&self) -> bool {
        self.mode.uses_edge()
    }

    /// Whether key properties/pivot nodes are part of the active representation.
    pub fn uses_foreign_key(&self) -> bool {
        self.mode.uses_foreign_key()
    }

    /// Read-side pattern linking bound `parent` to `related` in the active mode.
    pub fn match_pattern(&self, parent: &str, related: &str, binder: &mut ParameterBinder) -> LinkPattern {
        link_pattern(self, parent, related, binder)
    }

    /// `MERGE`/`SET` clauses linking bound `parent` and `related`, pivot included.
    pub fn merge_pattern(
        &self,
        parent: &str,
        related: &str,
        pivot: &PropertyMap,
        binder: &mut ParameterBinder,
    ) -> Result<Vec<String>, CompilationError> {
        link_clauses(self, parent, related, pivot, binder)
    }
}

/// Resolves the active storage mode and graph vocabulary for a relationship.
pub fn resolve(
    descriptor: &RelationshipDescriptor,
    context: &ResolutionContext,
) -> Result<ResolvedRelationship, CompilationError> {
    descriptor.parent.ensure_labels()?;
    descriptor.related.ensure_labels()?;

    let layers = StorageLayers {
        query_override: context.query_override,
        relationship: descriptor.storage_mode,
        model: descriptor.parent.default_storage_mode,
        process: context.process_default,
    };

    let (mode, source) = if descriptor.kind.is_polymorphic() {
        for requested in [layers.query_override, layers.relationship]
            .into_iter()
            .flatten()
        {
            if requested != StorageMode::ForeignKey {
                return Err(CompilationError::UnsupportedStorageMode {
                    relation: descriptor.name.clone(),
                    mode: requested.name(),
                    reason: "polymorphic relationships are stored as foreign keys",
                });
            }
        }
        (StorageMode::ForeignKey, ModeSource::Polymorphic)
    } else {
        layers.pick()
    };

    let edge_type = descriptor
        .edge_type
        .clone()
        .unwrap_or_else(|| descriptor.conventional_edge_type());

    let morph = descriptor.morph_type_key().map(|key| {
        let owner_type = if descriptor.kind == RelationshipKind::MorphTo {
            descriptor.related.name.clone()
        } else {
            descriptor.parent.name.clone()
        };
        (key, owner_type)
    });

    let through = match (&descriptor.through, descriptor.kind) {
        (Some(t), _) => Some(ResolvedThrough {
            entity: Arc::clone(&t.entity),
            first_key: t.first_key.clone(),
            second_key: t.second_key.clone(),
            second_edge_type: t.second_edge_type.clone().unwrap_or_else(|| {
                format!(
                    "HAS_{}",
                    crate::naming::upper_snake_case(&crate::naming::pluralize(
                        &crate::naming::snake_case(descriptor.related.primary_label())
                    ))
                )
            }),
        }),
        (None, RelationshipKind::HasManyThrough) => {
            return Err(CompilationError::UnsupportedStorageMode {
                relation: descriptor.name.clone(),
                mode: mode.name(),
                reason: "has-many-through requires an intermediate entity",
            })
        }
        (None, _) => None,
    };

    debug!(
        relation = %descriptor.name,
        kind = descriptor.kind.name(),
        mode = mode.name(),
        source = ?source,
        edge_type = %edge_type,
        "resolved relationship storage"
    );

    Ok(ResolvedRelationship {
        name: descriptor.name.clone(),
        kind: descriptor.kind,
        mode,
        source,
        edge_type,
        parent: Arc::clone(&descriptor.parent),
        related: Arc::clone(&descriptor.related),
        local_key: descriptor.local_key.clone(),
        foreign_key: descriptor.foreign_key.clone(),
        related_pivot_key: descriptor
            .related_pivot_key
            .clone()
            .unwrap_or_else(|| format!("{}_id", crate::naming::snake_case(&descriptor.related.name))),
        related_key: descriptor.related_key.clone(),
        pivot_label: descriptor
            .pivot_label
            .clone()
            .unwrap_or_else(|| descriptor.name.clone()),
        pivot_properties: descriptor.pivot_properties.clone(),
        morph,
        through,
    })
}
