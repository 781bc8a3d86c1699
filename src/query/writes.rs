//! Write statements: inserts, query-scoped updates and deletes, upserts and
//! nested creates.
//!
//! Every property is bound under its own placeholder. Multi-statement writes
//! return self-contained statements that can be replayed one by one.

use std::sync::Arc;

use tracing::debug;

use crate::query::ast::{Operator, QueryState, TrashedScope};
use crate::query::binder::ParameterBinder;
use crate::query::compiler::{match_prefix, ENTITY_VAR, RELATED_VAR};
use crate::query::errors::CompilationError;
use crate::query::statement::{CompiledStatement, Intent};
use crate::relation::descriptor::RelationshipKind;
use crate::relation::patterns::prop;
use crate::relation::{RelationshipDescriptor, ResolutionContext, ResolvedRelationship};
use crate::schema::EntitySchema;
use crate::value::{PropertyMap, Value};

/// Column carrying the number of affected entities.
pub const AFFECTED_COLUMN: &str = "affected";

fn finish(text: String, binder: ParameterBinder) -> Result<CompiledStatement, CompilationError> {
    let (params, encoded) = binder.finish();
    Ok(CompiledStatement::new(text, params, Intent::Write, true)?.with_json_encoded(encoded))
}

fn assignments(var: &str, values: &PropertyMap, binder: &mut ParameterBinder) -> Vec<String> {
    values
        .iter()
        .map(|(key, value)| {
            let p = binder.bind_property(key, value.clone());
            format!("{} = {p}", prop(var, key))
        })
        .collect()
}

fn create_clause(
    entity: &EntitySchema,
    var: &str,
    row: &PropertyMap,
    binder: &mut ParameterBinder,
) -> Result<String, CompilationError> {
    entity.ensure_labels()?;
    if row.is_empty() {
        return Err(CompilationError::EmptyWrite { operation: "insert" });
    }
    Ok(format!(
        "CREATE ({var}{}) SET {}",
        entity.label_pattern(),
        assignments(var, row, binder).join(", ")
    ))
}

/// One `CREATE` statement per row, meant to run as one batch.
pub fn insert(entity: &EntitySchema, rows: &[PropertyMap]) -> Result<Vec<CompiledStatement>, CompilationError> {
    if rows.is_empty() {
        return Err(CompilationError::EmptyWrite { operation: "insert" });
    }
    let statements = rows
        .iter()
        .map(|row| {
            let mut binder = ParameterBinder::new();
            let text = format!(
                "{} RETURN {ENTITY_VAR}",
                create_clause(entity, ENTITY_VAR, row, &mut binder)?
            );
            finish(text, binder)
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(entity = %entity.name, rows = statements.len(), "compiled insert");
    Ok(statements)
}

/// Sets `values` on every entity matched by `state`.
pub fn update(
    state: &QueryState,
    values: &PropertyMap,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<CompiledStatement, CompilationError> {
    if values.is_empty() {
        return Err(CompilationError::EmptyWrite { operation: "update" });
    }
    let (prefix, mut binder) = match_prefix(state, relations, context)?;
    let sets = assignments(ENTITY_VAR, values, &mut binder);
    let text = format!(
        "{prefix} SET {} RETURN count({ENTITY_VAR}) AS {AFFECTED_COLUMN}",
        sets.join(", ")
    );
    debug!(entity = %state.entity.name, properties = values.len(), "compiled update");
    finish(text, binder)
}

/// Adds `by` to a numeric property, treating a missing property as zero.
pub fn increment(
    state: &QueryState,
    column: &str,
    by: Value,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<CompiledStatement, CompilationError> {
    if !crate::naming::is_identifier(column) {
        return Err(CompilationError::invalid_column(column));
    }
    if !matches!(by, Value::Int(_) | Value::Float(_)) {
        return Err(CompilationError::OperandShape {
            operator: "increment",
            expected: "a numeric amount",
        });
    }
    let (prefix, mut binder) = match_prefix(state, relations, context)?;
    let p = binder.bind_operand(column, Operator::Eq, 0, by);
    let target = prop(ENTITY_VAR, column);
    let text = format!(
        "{prefix} SET {target} = coalesce({target}, 0) + {p} RETURN count({ENTITY_VAR}) AS {AFFECTED_COLUMN}"
    );
    finish(text, binder)
}

/// Deletes matched entities: soft delete when the entity declares a marker,
/// `DETACH DELETE` otherwise.
pub fn delete(
    state: &QueryState,
    deleted_at: Value,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<CompiledStatement, CompilationError> {
    let Some(marker) = state.entity.soft_delete.clone() else {
        return force_delete(state, relations, context);
    };
    let (prefix, mut binder) = match_prefix(state, relations, context)?;
    let p = binder.bind_property(&marker, deleted_at);
    let text = format!(
        "{prefix} SET {} = {p} RETURN count({ENTITY_VAR}) AS {AFFECTED_COLUMN}",
        prop(ENTITY_VAR, &marker)
    );
    debug!(entity = %state.entity.name, "compiled soft delete");
    finish(text, binder)
}

/// Detaches and deletes matched entities, soft-deleted ones included.
pub fn force_delete(
    state: &QueryState,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<CompiledStatement, CompilationError> {
    let mut scoped = state.clone();
    if scoped.trashed == TrashedScope::Exclude {
        scoped.trashed = TrashedScope::Include;
    }
    let (prefix, binder) = match_prefix(&scoped, relations, context)?;
    let text = format!(
        "{prefix} DETACH DELETE {ENTITY_VAR} RETURN count({ENTITY_VAR}) AS {AFFECTED_COLUMN}"
    );
    debug!(entity = %state.entity.name, "compiled delete");
    finish(text, binder)
}

/// Clears the soft-delete marker on matched, soft-deleted entities.
pub fn restore(
    state: &QueryState,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<CompiledStatement, CompilationError> {
    let Some(marker) = state.entity.soft_delete.clone() else {
        return Err(CompilationError::SoftDeleteNotEnabled {
            entity: state.entity.name.clone(),
        });
    };
    let mut scoped = state.clone();
    scoped.trashed = TrashedScope::Only;
    let (prefix, binder) = match_prefix(&scoped, relations, context)?;
    let text = format!(
        "{prefix} SET {} = null RETURN count({ENTITY_VAR}) AS {AFFECTED_COLUMN}",
        prop(ENTITY_VAR, &marker)
    );
    finish(text, binder)
}

/// `MERGE` on the `unique_by` properties, setting the rest on create and match.
pub fn upsert(
    entity: &EntitySchema,
    unique_by: &[&str],
    values: &PropertyMap,
) -> Result<CompiledStatement, CompilationError> {
    entity.ensure_labels()?;
    if unique_by.is_empty() {
        return Err(CompilationError::MissingPrimaryKey {
            entity: entity.name.clone(),
            key: entity.primary_key.clone(),
        });
    }
    let mut binder = ParameterBinder::new();
    let mut keys = Vec::new();
    for key in unique_by {
        let value = values
            .get(*key)
            .cloned()
            .ok_or_else(|| CompilationError::MissingPrimaryKey {
                entity: entity.name.clone(),
                key: (*key).to_owned(),
            })?;
        let p = binder.bind_property(key, value);
        keys.push(format!("{}: {p}", crate::naming::quote(key)));
    }
    let rest: PropertyMap = values
        .iter()
        .filter(|(k, _)| !unique_by.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut text = format!(
        "MERGE ({ENTITY_VAR}{} {{{}}})",
        entity.label_pattern(),
        keys.join(", ")
    );
    if !rest.is_empty() {
        let sets = assignments(ENTITY_VAR, &rest, &mut binder).join(", ");
        text.push_str(&format!(" ON CREATE SET {sets} ON MATCH SET {sets}"));
    }
    text.push_str(&format!(" RETURN {ENTITY_VAR}"));
    debug!(entity = %entity.name, keys = unique_by.len(), "compiled upsert");
    finish(text, binder)
}

/// Creates a parent and its related children as N+1 self-contained statements.
///
/// The parent's primary key must be present in `attributes` so every child
/// statement can re-match the parent on its own.
pub fn create_with_related(
    rel: &ResolvedRelationship,
    attributes: &PropertyMap,
    children: &[PropertyMap],
) -> Result<Vec<CompiledStatement>, CompilationError> {
    if rel.kind.is_inverse() || rel.kind == RelationshipKind::HasManyThrough {
        return Err(CompilationError::UnsupportedOperation {
            relation: rel.name.clone(),
            operation: "create_with_related",
        });
    }
    let parent = &rel.parent;
    let parent_key = attributes
        .get(&parent.primary_key)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| CompilationError::MissingPrimaryKey {
            entity: parent.name.clone(),
            key: parent.primary_key.clone(),
        })?;

    let mut statements = Vec::with_capacity(children.len() + 1);
    let mut binder = ParameterBinder::new();
    let text = format!(
        "{} RETURN {ENTITY_VAR}",
        create_clause(parent, ENTITY_VAR, attributes, &mut binder)?
    );
    statements.push(finish(text, binder)?);

    for child in children {
        let mut binder = ParameterBinder::new();
        let key = binder.bind_operand(&parent.primary_key, Operator::Eq, 0, parent_key.clone());
        let mut clauses = vec![
            format!(
                "MATCH (p{}) WHERE {} = {key}",
                parent.label_pattern(),
                prop("p", &parent.primary_key)
            ),
            create_clause(&rel.related, RELATED_VAR, child, &mut binder)?,
        ];
        clauses.extend(rel.merge_pattern("p", RELATED_VAR, &PropertyMap::new(), &mut binder)?);
        clauses.push(format!("RETURN {RELATED_VAR}"));
        statements.push(finish(clauses.join(" "), binder)?);
    }
    debug!(
        relation = %rel.name,
        mode = rel.mode.name(),
        children = children.len(),
        "compiled nested create"
    );
    Ok(statements)
}
