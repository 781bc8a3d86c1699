//! Relationship writes: attach, detach, sync and pivot updates.
//!
//! Every operation writes the representation(s) of the active storage mode in
//! a single statement, so a hybrid association never ends up with only one
//! half written. Attach is idempotent: edges and pivot nodes are merged, key
//! properties are set.

use tracing::debug;

use crate::query::ast::Operator;
use crate::query::binder::ParameterBinder;
use crate::query::errors::CompilationError;
use crate::query::statement::{CompiledStatement, Intent};
use crate::relation::descriptor::RelationshipKind;
use crate::relation::patterns::{edge_between, edge_var, pivot_node_condition, pivot_var, prop};
use crate::relation::pivot::check_pivot_properties;
use crate::relation::resolver::ResolvedRelationship;
use crate::naming::quote;
use crate::value::{PropertyMap, Value};

/// Which associations a detach removes, by related key.
#[derive(Clone, Debug, PartialEq)]
pub enum DetachFilter {
    /// Every association of the parent.
    All,
    /// Only associations with these related keys.
    Only(Vec<Value>),
    /// Every association except those with these related keys.
    Except(Vec<Value>),
}

fn ensure_writable(rel: &ResolvedRelationship) -> Result<(), CompilationError> {
    if rel.kind == RelationshipKind::HasManyThrough {
        return Err(CompilationError::ReadOnlyRelationship {
            relation: rel.name.clone(),
        });
    }
    Ok(())
}

fn match_by_key(var: &str, entity: &crate::schema::EntitySchema, key: Value, binder: &mut ParameterBinder) -> String {
    let p = binder.bind_operand(&entity.primary_key, Operator::Eq, 0, key);
    format!(
        "MATCH ({var}{}) WHERE {} = {p}",
        entity.label_pattern(),
        prop(var, &entity.primary_key)
    )
}

fn morph_value(rel: &ResolvedRelationship, binder: &mut ParameterBinder) -> Option<(String, String)> {
    rel.morph.as_ref().map(|(key, owner)| {
        let p = binder.bind_operand(key, Operator::Eq, 0, Value::String(owner.clone()));
        (key.clone(), p)
    })
}

/// Clauses linking bound `parent` and `related` variables in the active mode.
pub(crate) fn link_clauses(
    rel: &ResolvedRelationship,
    parent: &str,
    related: &str,
    pivot: &PropertyMap,
    binder: &mut ParameterBinder,
) -> Result<Vec<String>, CompilationError> {
    ensure_writable(rel)?;
    check_pivot_properties(rel, pivot)?;
    let bound: Vec<(String, String)> = pivot
        .iter()
        .map(|(k, v)| (k.clone(), binder.bind_property(k, v.clone())))
        .collect();
    let set_pivot = |var: &str| -> Option<String> {
        if bound.is_empty() {
            return None;
        }
        let assignments: Vec<String> = bound
            .iter()
            .map(|(k, p)| format!("{} = {p}", prop(var, k)))
            .collect();
        Some(format!("SET {}", assignments.join(", ")))
    };

    let mut clauses = Vec::new();
    let edge = edge_var(related);

    if rel.uses_edge() {
        clauses.push(format!("MERGE {}", edge_between(rel, parent, related, &edge)));
        clauses.extend(set_pivot(&edge));
    }

    if rel.uses_foreign_key() {
        let morph = morph_value(rel, binder);
        match rel.kind {
            RelationshipKind::BelongsToMany | RelationshipKind::MorphToMany => {
                let node = pivot_var(related);
                let mut keys = vec![format!(
                    "{}: {}",
                    quote(&rel.foreign_key),
                    prop(parent, &rel.local_key)
                )];
                if let Some((type_key, p)) = &morph {
                    keys.push(format!("{}: {p}", quote(type_key)));
                }
                keys.push(format!(
                    "{}: {}",
                    quote(&rel.related_pivot_key),
                    prop(related, &rel.related_key)
                ));
                clauses.push(format!(
                    "MERGE ({node}:{} {{{}}})",
                    quote(&rel.pivot_label),
                    keys.join(", ")
                ));
                clauses.extend(set_pivot(&node));
            }
            RelationshipKind::BelongsTo | RelationshipKind::MorphTo => {
                let mut sets = vec![format!(
                    "{} = {}",
                    prop(parent, &rel.foreign_key),
                    prop(related, &rel.local_key)
                )];
                if let Some((type_key, p)) = &morph {
                    sets.push(format!("{} = {p}", prop(parent, type_key)));
                }
                clauses.push(format!("SET {}", sets.join(", ")));
            }
            _ => {
                let mut sets = vec![format!(
                    "{} = {}",
                    prop(related, &rel.foreign_key),
                    prop(parent, &rel.local_key)
                )];
                if let Some((type_key, p)) = &morph {
                    sets.push(format!("{} = {p}", prop(related, type_key)));
                }
                clauses.push(format!("SET {}", sets.join(", ")));
            }
        }
    }
    Ok(clauses)
}

/// Clauses dropping edges that a new single-owner link supersedes.
///
/// The dependent side of a one-to-one or one-to-many association has at most
/// one owner, and a has-one parent at most one dependent. Key properties are
/// overwritten by the link itself; edges have to be removed explicitly. In
/// hybrid mode a displaced has-one dependent also loses its key.
fn release_clauses(rel: &ResolvedRelationship, parent: &str, related: &str) -> Vec<String> {
    if !rel.uses_edge() || rel.kind.is_many_to_many() {
        return Vec::new();
    }
    let owner = format!("{related}_o");
    let stale = format!("{related}_s");
    let carry = format!("WITH DISTINCT {parent}, {related}");
    if rel.kind.is_inverse() {
        return vec![
            format!(
                "OPTIONAL MATCH {} WHERE {owner} <> {related} DELETE {stale}",
                edge_between(rel, parent, &format!("{owner}{}", rel.related.label_pattern()), &stale)
            ),
            carry,
        ];
    }

    let mut clauses = vec![
        format!(
            "OPTIONAL MATCH {} WHERE {owner} <> {parent} DELETE {stale}",
            edge_between(rel, &format!("{owner}{}", rel.parent.label_pattern()), related, &stale)
        ),
        carry.clone(),
    ];
    if matches!(rel.kind, RelationshipKind::HasOne | RelationshipKind::MorphOne) {
        let previous = format!("{related}_p");
        let previous_edge = format!("{related}_ps");
        let mut clause = format!(
            "OPTIONAL MATCH {} WHERE {previous} <> {related} DELETE {previous_edge}",
            edge_between(rel, parent, &format!("{previous}{}", rel.related.label_pattern()), &previous_edge)
        );
        if rel.uses_foreign_key() {
            clause.push_str(&format!(" SET {} = null", prop(&previous, &rel.foreign_key)));
        }
        clauses.push(clause);
        clauses.push(carry);
    }
    clauses
}

/// Associates one related entity with the parent (`attach`, `associate`, `save`).
///
/// Edges left behind by a previous owner are removed in the same statement.
pub fn attach(
    rel: &ResolvedRelationship,
    parent_key: Value,
    related_key: Value,
    pivot: &PropertyMap,
) -> Result<CompiledStatement, CompilationError> {
    let mut binder = ParameterBinder::new();
    let mut clauses = vec![
        match_by_key("p", &rel.parent, parent_key, &mut binder),
        match_by_key("r", &rel.related, related_key, &mut binder),
    ];
    ensure_writable(rel)?;
    clauses.extend(release_clauses(rel, "p", "r"));
    clauses.extend(link_clauses(rel, "p", "r", pivot, &mut binder)?);
    clauses.push("RETURN count(*) AS affected".to_owned());
    debug!(relation = %rel.name, mode = rel.mode.name(), "compiled attach");
    finish(clauses, binder)
}

/// Removes associations of the parent (`detach`, `dissociate`).
///
/// Returns one row with the number of associations removed.
pub fn detach(
    rel: &ResolvedRelationship,
    parent_key: Value,
    filter: &DetachFilter,
) -> Result<CompiledStatement, CompilationError> {
    ensure_writable(rel)?;
    let mut binder = ParameterBinder::new();
    let mut clauses = vec![match_by_key("p", &rel.parent, parent_key, &mut binder)];
    let related_pk = rel.related.primary_key.clone();
    let key_filter = |target: &str, binder: &mut ParameterBinder| -> Option<String> {
        match filter {
            DetachFilter::All => None,
            DetachFilter::Only(keys) => {
                let p = binder.bind_list(&related_pk, Operator::In, keys.clone());
                Some(format!("{target} IN {p}"))
            }
            DetachFilter::Except(keys) => {
                let p = binder.bind_list(&related_pk, Operator::In, keys.clone());
                Some(format!("NOT {target} IN {p}"))
            }
        }
    };
    let mut counters: Vec<&str> = Vec::new();

    if rel.uses_edge() {
        let edge = edge_var("r");
        let node = format!("r{}", rel.related.label_pattern());
        let mut clause = format!("OPTIONAL MATCH {}", edge_between(rel, "p", &node, &edge));
        if let Some(condition) = key_filter(&prop("r", &related_pk), &mut binder) {
            clause.push_str(&format!(" WHERE {condition}"));
        }
        clauses.push(clause);
        clauses.push(format!("DELETE {edge}"));
        clauses.push(format!("WITH p, count({edge}) AS edges"));
        counters.push("edges");
    }

    if rel.uses_foreign_key() {
        let carried = if counters.is_empty() { String::new() } else { "edges, ".to_owned() };
        let morph = morph_value(rel, &mut binder);
        match rel.kind {
            RelationshipKind::BelongsToMany | RelationshipKind::MorphToMany => {
                let node = pivot_var("r");
                let mut conditions = vec![format!(
                    "{} = {}",
                    prop(&node, &rel.foreign_key),
                    prop("p", &rel.local_key)
                )];
                if let Some((type_key, p)) = &morph {
                    conditions.push(format!("{} = {p}", prop(&node, type_key)));
                }
                conditions.extend(key_filter(&prop(&node, &rel.related_pivot_key), &mut binder));
                clauses.push(format!(
                    "OPTIONAL MATCH ({node}:{}) WHERE {}",
                    quote(&rel.pivot_label),
                    conditions.join(" AND ")
                ));
                clauses.push(format!("DELETE {node}"));
                clauses.push(format!("WITH p, {carried}count({node}) AS keys"));
            }
            RelationshipKind::BelongsTo | RelationshipKind::MorphTo => {
                let fk = prop("p", &rel.foreign_key);
                let mut conditions = vec![format!("{fk} IS NOT NULL")];
                let mut resets = vec![format!("{fk} = null")];
                if let Some((type_key, p)) = &morph {
                    conditions.push(format!("{} = {p}", prop("p", type_key)));
                    resets.push(format!("{} = null", prop("p", type_key)));
                }
                conditions.extend(key_filter(&fk, &mut binder));
                clauses.push(format!(
                    "WITH p, {carried}CASE WHEN {} THEN 1 ELSE 0 END AS keys",
                    conditions.join(" AND ")
                ));
                clauses.push(format!(
                    "FOREACH (ignored IN CASE WHEN keys = 1 THEN [1] ELSE [] END | SET {})",
                    resets.join(", ")
                ));
            }
            _ => {
                let fk = prop("r", &rel.foreign_key);
                let mut conditions = vec![format!("{fk} = {}", prop("p", &rel.local_key))];
                let mut resets = vec![format!("{fk} = null")];
                if let Some((type_key, p)) = &morph {
                    conditions.push(format!("{} = {p}", prop("r", type_key)));
                    resets.push(format!("{} = null", prop("r", type_key)));
                }
                conditions.extend(key_filter(&prop("r", &related_pk), &mut binder));
                clauses.push(format!(
                    "OPTIONAL MATCH (r{}) WHERE {}",
                    rel.related.label_pattern(),
                    conditions.join(" AND ")
                ));
                clauses.push(format!("SET {}", resets.join(", ")));
                clauses.push(format!("WITH p, {carried}count(r) AS keys"));
            }
        }
        counters.push("keys");
    }

    clauses.push(match counters.as_slice() {
        [single] => format!("RETURN {single} AS affected"),
        _ => "RETURN CASE WHEN edges > keys THEN edges ELSE keys END AS affected".to_owned(),
    });
    debug!(relation = %rel.name, mode = rel.mode.name(), filter = ?filter, "compiled detach");
    finish(clauses, binder)
}

/// Replaces the parent's associations with exactly `entries`.
///
/// Produces a detach of everything not listed followed by one attach per
/// entry; the caller runs them in one transaction.
pub fn sync(
    rel: &ResolvedRelationship,
    parent_key: Value,
    entries: Vec<(Value, PropertyMap)>,
) -> Result<Vec<CompiledStatement>, CompilationError> {
    let keys: Vec<Value> = entries.iter().map(|(key, _)| key.clone()).collect();
    let mut statements = vec![detach(rel, parent_key.clone(), &DetachFilter::Except(keys))?];
    for (key, pivot) in entries {
        statements.push(attach(rel, parent_key.clone(), key, &pivot)?);
    }
    Ok(statements)
}

/// Updates pivot properties of one association, returning the stored pivot.
pub fn update_edge(
    rel: &ResolvedRelationship,
    parent_key: Value,
    related_key: Value,
    changes: &PropertyMap,
) -> Result<CompiledStatement, CompilationError> {
    ensure_writable(rel)?;
    if !rel.kind.is_many_to_many() {
        return Err(CompilationError::PivotNotSupported {
            relation: rel.name.clone(),
        });
    }
    if changes.is_empty() {
        return Err(CompilationError::EmptyWrite {
            operation: "update_edge",
        });
    }
    check_pivot_properties(rel, changes)?;

    let mut binder = ParameterBinder::new();
    let mut clauses = vec![
        match_by_key("p", &rel.parent, parent_key, &mut binder),
        match_by_key("r", &rel.related, related_key, &mut binder),
    ];
    let edge = edge_var("r");
    let node = pivot_var("r");
    let mut carriers = Vec::new();
    if rel.uses_edge() {
        clauses.push(format!("OPTIONAL MATCH {}", edge_between(rel, "p", "r", &edge)));
        carriers.push(edge.clone());
    }
    if rel.uses_foreign_key() {
        clauses.push(format!(
            "OPTIONAL MATCH ({node}:{}) WHERE {}",
            quote(&rel.pivot_label),
            pivot_node_condition(rel, "p", "r", &node, &mut binder)
        ));
        carriers.push(node.clone());
    }
    let mut assignments = Vec::new();
    for (key, value) in changes {
        let p = binder.bind_property(key, value.clone());
        for carrier in &carriers {
            assignments.push(format!("{} = {p}", prop(carrier, key)));
        }
    }
    clauses.push(format!("SET {}", assignments.join(", ")));
    let source = if carriers.len() == 1 {
        carriers.join("")
    } else {
        format!("coalesce({})", carriers.join(", "))
    };
    clauses.push(format!("RETURN properties({source}) AS pivot"));
    debug!(relation = %rel.name, mode = rel.mode.name(), "compiled pivot update");
    finish(clauses, binder)
}

fn finish(clauses: Vec<String>, binder: ParameterBinder) -> Result<CompiledStatement, CompilationError> {
    let (params, encoded) = binder.finish();
    Ok(CompiledStatement::new(clauses.join(" "), params, Intent::Write, true)?.with_json_encoded(encoded))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relation::descriptor::{PropertyType, RelationshipDescriptor, StorageMode};
    use crate::relation::resolver::{resolve, ResolutionContext};
    use crate::schema::EntitySchema;
    use crate::value::props;

    fn entities() -> (Arc<EntitySchema>, Arc<EntitySchema>, Arc<EntitySchema>) {
        (
            Arc::new(EntitySchema::new("User", "users")),
            Arc::new(EntitySchema::new("Post", "posts")),
            Arc::new(EntitySchema::new("Role", "roles")),
        )
    }

    fn resolved(descriptor: RelationshipDescriptor, mode: StorageMode) -> ResolvedRelationship {
        resolve(&descriptor, &ResolutionContext::new(mode)).unwrap()
    }

    fn roles(mode: StorageMode) -> ResolvedRelationship {
        let (users, _, roles) = entities();
        resolved(
            RelationshipDescriptor::belongs_to_many("roles", &users, &roles)
                .with_pivot("since", PropertyType::DateTime),
            mode,
        )
    }

    #[test]
    fn hybrid_attach_writes_edge_and_key_together() {
        let (users, posts, _) = entities();
        let rel = resolved(
            RelationshipDescriptor::has_many("posts", &users, &posts),
            StorageMode::Hybrid,
        );
        let stmt = attach(&rel, Value::Int(1), Value::Int(9), &PropertyMap::new()).unwrap();
        assert_eq!(
            stmt.text(),
            "MATCH (p:users) WHERE p.id = $p0 MATCH (r:posts) WHERE r.id = $p1 \
             OPTIONAL MATCH (r_o:users)-[r_s:HAS_POSTS]->(r) WHERE r_o <> p DELETE r_s \
             WITH DISTINCT p, r \
             MERGE (p)-[r_e:HAS_POSTS]->(r) SET r.user_id = p.id RETURN count(*) AS affected"
        );
        assert_eq!(stmt.intent(), Intent::Write);
    }

    #[test]
    fn has_one_attach_displaces_the_previous_dependent() {
        let users = Arc::new(EntitySchema::new("User", "users"));
        let profiles = Arc::new(EntitySchema::new("Profile", "profiles"));
        let rel = resolved(
            RelationshipDescriptor::has_one("profile", &users, &profiles),
            StorageMode::Hybrid,
        );
        let stmt = attach(&rel, Value::Int(1), Value::Int(3), &PropertyMap::new()).unwrap();
        let text = stmt.text();
        assert!(
            text.contains(
                "OPTIONAL MATCH (p)-[r_ps:HAS_PROFILES]->(r_p:profiles) WHERE r_p <> r \
                 DELETE r_ps SET r_p.user_id = null WITH DISTINCT p, r"
            ),
            "{text}"
        );
        assert!(text.contains("WHERE r_o <> p DELETE r_s"), "{text}");

        let edges_only = resolved(
            RelationshipDescriptor::has_one("profile", &users, &profiles),
            StorageMode::NativeEdge,
        );
        let text = attach(&edges_only, Value::Int(1), Value::Int(3), &PropertyMap::new())
            .unwrap()
            .text()
            .to_owned();
        assert!(text.contains("DELETE r_ps WITH DISTINCT p, r"), "{text}");
    }

    #[test]
    fn many_to_many_attach_keeps_other_associations() {
        let stmt = attach(&roles(StorageMode::NativeEdge), Value::Int(1), Value::Int(2), &PropertyMap::new())
            .unwrap();
        assert!(!stmt.text().contains("DELETE"), "{}", stmt.text());
    }

    #[test]
    fn pivot_properties_land_on_edge_and_pivot_node() {
        let rel = roles(StorageMode::Hybrid);
        let stmt = attach(
            &rel,
            Value::Int(1),
            Value::Int(2),
            &props([("since", "2024-01-01")]),
        )
        .unwrap();
        assert!(stmt.text().contains("MERGE (p)-[r_e:HAS_ROLES]->(r) SET r_e.since = $p2"));
        assert!(stmt
            .text()
            .contains("MERGE (r_v:role_user {user_id: p.id, role_id: r.id}) SET r_v.since = $p2"));
    }

    #[test]
    fn pivot_properties_on_plain_relationships_are_rejected() {
        let (users, posts, _) = entities();
        let rel = resolved(
            RelationshipDescriptor::has_many("posts", &users, &posts),
            StorageMode::NativeEdge,
        );
        let err = attach(&rel, Value::Int(1), Value::Int(2), &props([("x", 1i64)])).unwrap_err();
        assert_eq!(err.code(), "PivotNotSupported");
    }

    #[test]
    fn belongs_to_edge_attach_replaces_previous_owner() {
        let (users, posts, _) = entities();
        let rel = resolved(
            RelationshipDescriptor::belongs_to("user", &posts, &users),
            StorageMode::NativeEdge,
        );
        let stmt = attach(&rel, Value::Int(5), Value::Int(1), &PropertyMap::new()).unwrap();
        assert!(stmt.text().contains(
            "OPTIONAL MATCH (r_o:users)-[r_s:HAS_POSTS]->(p) WHERE r_o <> r DELETE r_s WITH DISTINCT p, r \
             MERGE (r)-[r_e:HAS_POSTS]->(p)"
        ));
    }

    #[test]
    fn hybrid_detach_reports_the_larger_count() {
        let rel = roles(StorageMode::Hybrid);
        let stmt = detach(&rel, Value::Int(1), &DetachFilter::Only(vec![Value::Int(2)])).unwrap();
        assert_eq!(
            stmt.text(),
            "MATCH (p:users) WHERE p.id = $p0 \
             OPTIONAL MATCH (p)-[r_e:HAS_ROLES]->(r:roles) WHERE r.id IN $p1 DELETE r_e \
             WITH p, count(r_e) AS edges \
             OPTIONAL MATCH (r_v:role_user) WHERE r_v.user_id = p.id AND r_v.role_id IN $p1 DELETE r_v \
             WITH p, edges, count(r_v) AS keys \
             RETURN CASE WHEN edges > keys THEN edges ELSE keys END AS affected"
        );
    }

    #[test]
    fn dissociate_clears_key_on_child() {
        let (users, posts, _) = entities();
        let rel = resolved(
            RelationshipDescriptor::belongs_to("user", &posts, &users),
            StorageMode::ForeignKey,
        );
        let stmt = detach(&rel, Value::Int(5), &DetachFilter::All).unwrap();
        assert_eq!(
            stmt.text(),
            "MATCH (p:posts) WHERE p.id = $p0 \
             WITH p, CASE WHEN p.user_id IS NOT NULL THEN 1 ELSE 0 END AS keys \
             FOREACH (ignored IN CASE WHEN keys = 1 THEN [1] ELSE [] END | SET p.user_id = null) \
             RETURN keys AS affected"
        );
    }

    #[test]
    fn sync_detaches_unlisted_then_attaches() {
        let rel = roles(StorageMode::NativeEdge);
        let statements = sync(
            &rel,
            Value::Int(1),
            vec![(Value::Int(2), PropertyMap::new()), (Value::Int(3), PropertyMap::new())],
        )
        .unwrap();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].text().contains("NOT r.id IN $p1"));
        assert_eq!(
            statements[0].parameters()["p1"],
            Value::List(vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn update_edge_returns_fresh_pivot_properties() {
        let rel = roles(StorageMode::Hybrid);
        let stmt = update_edge(
            &rel,
            Value::Int(1),
            Value::Int(2),
            &props([("since", "2025-02-02")]),
        )
        .unwrap();
        assert!(stmt.text().contains("SET r_e.since = $p2, r_v.since = $p2"));
        assert!(stmt.text().ends_with("RETURN properties(coalesce(r_e, r_v)) AS pivot"));
    }

    #[test]
    fn through_relationships_are_read_only() {
        let (users, posts, roles) = entities();
        let rel = resolved(
            RelationshipDescriptor::has_many_through("roles", &users, &posts, &roles),
            StorageMode::NativeEdge,
        );
        let err = attach(&rel, Value::Int(1), Value::Int(2), &PropertyMap::new()).unwrap_err();
        assert_eq!(err.code(), "ReadOnlyRelationship");
    }

    #[test]
    fn polymorphic_attach_writes_type_discriminator() {
        let (_, posts, _) = entities();
        let comments = Arc::new(EntitySchema::new("Comment", "comments"));
        let rel = resolved(
            RelationshipDescriptor::morph_many("comments", &posts, &comments, "commentable"),
            StorageMode::Hybrid,
        );
        let stmt = attach(&rel, Value::Int(1), Value::Int(7), &PropertyMap::new()).unwrap();
        assert!(stmt
            .text()
            .contains("SET r.commentable_id = p.id, r.commentable_type = $p2"));
        assert!(!stmt.text().contains("MERGE"));
    }
}
