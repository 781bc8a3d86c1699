//! Read-side link patterns for each storage mode.
//!
//! A pattern links an already bound parent variable to a related variable.
//! Compiled reads use it for relationship loading and for `EXISTS` subqueries
//! (`whereHas`). Auxiliary variables derive from the related variable:
//! `<r>_e` for the edge, `<r>_v` for the pivot node, `<r>_t` for the
//! intermediate hop.

use crate::naming::quote;
use crate::query::ast::Operator;
use crate::query::binder::ParameterBinder;
use crate::relation::descriptor::{RelationshipKind, StorageMode};
use crate::relation::resolver::ResolvedRelationship;
use crate::value::Value;

/// Graph pattern plus predicates linking a parent to related entities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkPattern {
    /// Path matched once the parent is bound, without the `MATCH` keyword.
    pub pattern: String,
    /// Predicate ANDed into the `WHERE` of `pattern`.
    pub predicate: Option<String>,
    /// `OPTIONAL MATCH` clauses binding pivot carriers.
    pub optional: Vec<String>,
    /// Expression yielding the pivot property map, for many-to-many kinds.
    pub pivot_expr: Option<String>,
}

impl LinkPattern {
    /// `EXISTS { ... }` subquery form with additional constraints.
    pub fn exists(&self, constraints: Option<&str>) -> String {
        let mut conditions = Vec::new();
        if let Some(predicate) = &self.predicate {
            conditions.push(predicate.clone());
        }
        if let Some(extra) = constraints {
            conditions.push(extra.to_owned());
        }
        if conditions.is_empty() {
            format!("EXISTS {{ MATCH {} }}", self.pattern)
        } else {
            format!(
                "EXISTS {{ MATCH {} WHERE {} }}",
                self.pattern,
                conditions.join(" AND ")
            )
        }
    }
}

pub(crate) fn edge_var(related: &str) -> String {
    format!("{related}_e")
}

pub(crate) fn pivot_var(related: &str) -> String {
    format!("{related}_v")
}

pub(crate) fn through_var(related: &str) -> String {
    format!("{related}_t")
}

pub(crate) fn prop(var: &str, property: &str) -> String {
    format!("{var}.{}", quote(property))
}

/// Edge between `parent` and a related node pattern, oriented owner to dependent.
pub(crate) fn edge_between(
    rel: &ResolvedRelationship,
    parent: &str,
    related_node: &str,
    edge: &str,
) -> String {
    let ty = quote(&rel.edge_type);
    if rel.kind.is_inverse() {
        format!("({related_node})-[{edge}:{ty}]->({parent})")
    } else {
        format!("({parent})-[{edge}:{ty}]->({related_node})")
    }
}

fn morph_condition(
    rel: &ResolvedRelationship,
    var: &str,
    binder: &mut ParameterBinder,
) -> Option<String> {
    rel.morph.as_ref().map(|(key, owner_type)| {
        let p = binder.bind_operand(key, Operator::Eq, 0, Value::String(owner_type.clone()));
        format!("{} = {p}", prop(var, key))
    })
}

/// Key-property predicate linking `parent` and `related`.
pub(crate) fn key_predicate(
    rel: &ResolvedRelationship,
    parent: &str,
    related: &str,
    binder: &mut ParameterBinder,
) -> String {
    match rel.kind {
        RelationshipKind::HasOne
        | RelationshipKind::HasMany
        | RelationshipKind::MorphOne
        | RelationshipKind::MorphMany => {
            let mut parts = vec![format!(
                "{} = {}",
                prop(related, &rel.foreign_key),
                prop(parent, &rel.local_key)
            )];
            parts.extend(morph_condition(rel, related, binder));
            parts.join(" AND ")
        }
        RelationshipKind::BelongsTo | RelationshipKind::MorphTo => {
            let mut parts = vec![format!(
                "{} = {}",
                prop(parent, &rel.foreign_key),
                prop(related, &rel.local_key)
            )];
            parts.extend(morph_condition(rel, parent, binder));
            parts.join(" AND ")
        }
        RelationshipKind::BelongsToMany | RelationshipKind::MorphToMany => {
            let k = format!("{related}_k");
            format!(
                "EXISTS {{ MATCH ({k}:{}) WHERE {} }}",
                quote(&rel.pivot_label),
                pivot_node_condition(rel, parent, related, &k, binder)
            )
        }
        RelationshipKind::HasManyThrough => match &rel.through {
            Some(through) => {
                let t = format!("{related}_k");
                format!(
                    "EXISTS {{ MATCH ({t}{}) WHERE {} = {} AND {} = {} }}",
                    through.entity.label_pattern(),
                    prop(&t, &through.first_key),
                    prop(parent, &rel.local_key),
                    prop(related, &through.second_key),
                    prop(&t, &through.entity.primary_key)
                )
            }
            None => "false".to_owned(),
        },
    }
}

/// Conditions identifying the pivot node of one `(parent, related)` pair.
pub(crate) fn pivot_node_condition(
    rel: &ResolvedRelationship,
    parent: &str,
    related: &str,
    pivot: &str,
    binder: &mut ParameterBinder,
) -> String {
    let mut parts = vec![format!(
        "{} = {}",
        prop(pivot, &rel.foreign_key),
        prop(parent, &rel.local_key)
    )];
    parts.extend(morph_condition(rel, pivot, binder));
    parts.push(format!(
        "{} = {}",
        prop(pivot, &rel.related_pivot_key),
        prop(related, &rel.related_key)
    ));
    parts.join(" AND ")
}

fn through_path(rel: &ResolvedRelationship, parent: &str, via: &str, related: &str) -> String {
    match &rel.through {
        Some(through) => format!(
            "({parent})-[:{}]->({via}{})-[:{}]->({related})",
            quote(&rel.edge_type),
            through.entity.label_pattern(),
            quote(&through.second_edge_type)
        ),
        None => format!("({parent})-[:{}]->({related})", quote(&rel.edge_type)),
    }
}

/// Builds the link pattern of `rel` for the active storage mode.
pub fn link_pattern(
    rel: &ResolvedRelationship,
    parent: &str,
    related: &str,
    binder: &mut ParameterBinder,
) -> LinkPattern {
    let labels = rel.related.label_pattern();
    let node = format!("{related}{labels}");
    let edge = edge_var(related);
    let pivot = pivot_var(related);
    let many = rel.kind.is_many_to_many();

    if rel.kind == RelationshipKind::HasManyThrough {
        let via = through_var(related);
        return match rel.mode {
            StorageMode::NativeEdge => LinkPattern {
                pattern: through_path(rel, parent, &via, &node),
                predicate: None,
                optional: Vec::new(),
                pivot_expr: None,
            },
            StorageMode::ForeignKey => LinkPattern {
                pattern: format!("({node})"),
                predicate: Some(key_predicate(rel, parent, related, binder)),
                optional: Vec::new(),
                pivot_expr: None,
            },
            StorageMode::Hybrid => {
                let fk = key_predicate(rel, parent, related, binder);
                let through_labels = rel
                    .through
                    .as_ref()
                    .map(|t| t.entity.label_pattern())
                    .unwrap_or_default();
                LinkPattern {
                    pattern: format!("({node})"),
                    predicate: Some(format!(
                        "(EXISTS {{ MATCH {} }} OR (NOT EXISTS {{ MATCH ({parent})-[:{}]->({through_labels}) }} AND {fk}))",
                        through_path(rel, parent, "", related),
                        quote(&rel.edge_type)
                    )),
                    optional: Vec::new(),
                    pivot_expr: None,
                }
            }
        };
    }

    let pivot_match = |binder: &mut ParameterBinder| {
        format!(
            "OPTIONAL MATCH ({pivot}:{}) WHERE {}",
            quote(&rel.pivot_label),
            pivot_node_condition(rel, parent, related, &pivot, binder)
        )
    };

    match rel.mode {
        StorageMode::NativeEdge => LinkPattern {
            pattern: edge_between(rel, parent, &node, &edge),
            predicate: None,
            optional: Vec::new(),
            pivot_expr: many.then(|| format!("properties({edge})")),
        },
        StorageMode::ForeignKey => LinkPattern {
            pattern: format!("({node})"),
            predicate: Some(key_predicate(rel, parent, related, binder)),
            optional: if many { vec![pivot_match(binder)] } else { Vec::new() },
            pivot_expr: many.then(|| format!("properties({pivot})")),
        },
        StorageMode::Hybrid => {
            let fk = key_predicate(rel, parent, related, binder);
            let predicate = format!(
                "(EXISTS {{ MATCH {} }} OR (NOT EXISTS {{ MATCH {} }} AND {fk}))",
                edge_between(rel, parent, related, ""),
                edge_between(rel, parent, &labels, "")
            );
            let optional = if many {
                vec![
                    format!(
                        "OPTIONAL MATCH {}",
                        edge_between(rel, parent, related, &edge)
                    ),
                    pivot_match(binder),
                ]
            } else {
                Vec::new()
            };
            LinkPattern {
                pattern: format!("({node})"),
                predicate: Some(predicate),
                optional,
                pivot_expr: many.then(|| format!("properties(coalesce({edge}, {pivot}))")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relation::descriptor::{PropertyType, RelationshipDescriptor};
    use crate::relation::resolver::{resolve, ResolutionContext};
    use crate::schema::EntitySchema;

    fn resolved(descriptor: RelationshipDescriptor, mode: StorageMode) -> ResolvedRelationship {
        resolve(&descriptor, &ResolutionContext::new(mode)).unwrap()
    }

    fn users_posts() -> (Arc<EntitySchema>, Arc<EntitySchema>) {
        (
            Arc::new(EntitySchema::new("User", "users")),
            Arc::new(EntitySchema::new("Post", "posts")),
        )
    }

    #[test]
    fn foreign_key_has_many_uses_key_equality() {
        let (users, posts) = users_posts();
        let rel = resolved(
            RelationshipDescriptor::has_many("posts", &users, &posts),
            StorageMode::ForeignKey,
        );
        let mut binder = ParameterBinder::new();
        let link = link_pattern(&rel, "p", "r", &mut binder);
        assert_eq!(link.pattern, "(r:posts)");
        assert_eq!(link.predicate.as_deref(), Some("r.user_id = p.id"));
        assert!(binder.is_empty());
    }

    #[test]
    fn native_edge_belongs_to_points_from_owner() {
        let (users, posts) = users_posts();
        let rel = resolved(
            RelationshipDescriptor::belongs_to("user", &posts, &users),
            StorageMode::NativeEdge,
        );
        let mut binder = ParameterBinder::new();
        let link = link_pattern(&rel, "p", "r", &mut binder);
        assert_eq!(link.pattern, "(r:users)-[r_e:HAS_POSTS]->(p)");
        assert_eq!(link.predicate, None);
    }

    #[test]
    fn hybrid_prefers_edges_and_falls_back_to_keys() {
        let (users, posts) = users_posts();
        let rel = resolved(
            RelationshipDescriptor::has_many("posts", &users, &posts),
            StorageMode::Hybrid,
        );
        let mut binder = ParameterBinder::new();
        let link = link_pattern(&rel, "p", "r", &mut binder);
        assert_eq!(
            link.predicate.as_deref(),
            Some(
                "(EXISTS { MATCH (p)-[:HAS_POSTS]->(r) } OR (NOT EXISTS { MATCH (p)-[:HAS_POSTS]->(:posts) } AND r.user_id = p.id))"
            )
        );
    }

    #[test]
    fn many_to_many_exposes_pivot_expression() {
        let users = Arc::new(EntitySchema::new("User", "users"));
        let roles = Arc::new(EntitySchema::new("Role", "roles"));
        let descriptor = RelationshipDescriptor::belongs_to_many("roles", &users, &roles)
            .with_pivot("since", PropertyType::DateTime);
        let mut binder = ParameterBinder::new();

        let fk = link_pattern(&resolved(descriptor.clone(), StorageMode::ForeignKey), "p", "r", &mut binder);
        assert_eq!(
            fk.optional,
            vec!["OPTIONAL MATCH (r_v:role_user) WHERE r_v.user_id = p.id AND r_v.role_id = r.id".to_owned()]
        );
        assert_eq!(fk.pivot_expr.as_deref(), Some("properties(r_v)"));

        let hybrid = link_pattern(&resolved(descriptor, StorageMode::Hybrid), "p", "r", &mut binder);
        assert_eq!(hybrid.optional.len(), 2);
        assert_eq!(
            hybrid.pivot_expr.as_deref(),
            Some("properties(coalesce(r_e, r_v))")
        );
    }

    #[test]
    fn morph_type_is_bound_as_parameter() {
        let (users, posts) = users_posts();
        let comments = Arc::new(EntitySchema::new("Comment", "comments"));
        let rel = resolved(
            RelationshipDescriptor::morph_many("comments", &posts, &comments, "commentable"),
            StorageMode::ForeignKey,
        );
        let _ = users;
        let mut binder = ParameterBinder::new();
        let link = link_pattern(&rel, "p", "r", &mut binder);
        assert_eq!(
            link.predicate.as_deref(),
            Some("r.commentable_id = p.id AND r.commentable_type = $p0")
        );
        let (params, _) = binder.finish();
        assert_eq!(params["p0"], Value::from("Post"));
    }

    #[test]
    fn exists_form_appends_constraints() {
        let (users, posts) = users_posts();
        let rel = resolved(
            RelationshipDescriptor::has_many("posts", &users, &posts),
            StorageMode::NativeEdge,
        );
        let mut binder = ParameterBinder::new();
        let link = link_pattern(&rel, "n", "r0", &mut binder);
        assert_eq!(
            link.exists(Some("r0.published = $p0")),
            "EXISTS { MATCH (n)-[r0_e:HAS_POSTS]->(r0:posts) WHERE r0.published = $p0 }"
        );
    }
}
