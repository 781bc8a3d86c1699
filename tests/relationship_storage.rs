use std::collections::BTreeSet;
use std::sync::{Arc, Once};

use relgraph::query::statement::placeholders;
use relgraph::relation::{
    attach, detach, resolve, sync, update_edge, ModeSource, ResolutionContext, StorageLayers,
};
use relgraph::{
    props, DetachFilter, EntitySchema, PropertyMap, PropertyType, QueryBuilder,
    RelationshipDescriptor, StatementCompiler, StorageMode, Value,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relgraph=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Fixture {
    users: Arc<EntitySchema>,
    posts: Arc<EntitySchema>,
    roles: Arc<EntitySchema>,
    comments: Arc<EntitySchema>,
}

fn fixture() -> Fixture {
    Fixture {
        users: Arc::new(EntitySchema::new("User", "users")),
        posts: Arc::new(EntitySchema::new("Post", "posts").soft_deletes("deleted_at")),
        roles: Arc::new(EntitySchema::new("Role", "roles")),
        comments: Arc::new(EntitySchema::new("Comment", "comments")),
    }
}

fn assert_bindings_match(text: &str, params: &std::collections::BTreeMap<String, Value>) {
    let bound: BTreeSet<String> = params.keys().cloned().collect();
    assert_eq!(placeholders(text), bound, "{text}");
}

#[test]
fn resolution_walks_the_precedence_chain() {
    init_tracing();
    let layers = StorageLayers {
        query_override: None,
        relationship: Some(StorageMode::Hybrid),
        model: Some(StorageMode::NativeEdge),
        process: StorageMode::ForeignKey,
    };
    assert_eq!(layers.pick(), (StorageMode::Hybrid, ModeSource::Relationship));

    let f = fixture();
    let owner = Arc::new(EntitySchema::new("User", "users").storage_mode(StorageMode::NativeEdge));
    let plain = RelationshipDescriptor::has_many("posts", &owner, &f.posts);
    let ctx = ResolutionContext::new(StorageMode::ForeignKey);

    let by_model = resolve(&plain, &ctx).unwrap();
    assert_eq!((by_model.mode, by_model.source), (StorageMode::NativeEdge, ModeSource::Model));

    let declared = plain.clone().storage(StorageMode::Hybrid);
    let by_relation = resolve(&declared, &ctx).unwrap();
    assert_eq!(by_relation.source, ModeSource::Relationship);

    let overridden = resolve(&declared, &ctx.with_override(Some(StorageMode::ForeignKey))).unwrap();
    assert_eq!(
        (overridden.mode, overridden.source),
        (StorageMode::ForeignKey, ModeSource::QueryOverride)
    );

    let fallback = resolve(
        &RelationshipDescriptor::has_many("posts", &f.users, &f.posts),
        &ResolutionContext::new(StorageMode::Hybrid),
    )
    .unwrap();
    assert_eq!((fallback.mode, fallback.source), (StorageMode::Hybrid, ModeSource::Process));
}

#[test]
fn polymorphic_relationships_stay_on_foreign_keys() {
    let f = fixture();
    let morph = RelationshipDescriptor::morph_many("comments", &f.posts, &f.comments, "commentable");
    let resolved = resolve(&morph, &ResolutionContext::new(StorageMode::NativeEdge)).unwrap();
    assert_eq!(resolved.mode, StorageMode::ForeignKey);
    assert_eq!(resolved.source, ModeSource::Polymorphic);

    let forced = morph.storage(StorageMode::NativeEdge);
    let err = resolve(&forced, &ResolutionContext::new(StorageMode::ForeignKey)).unwrap_err();
    assert_eq!(err.code(), "UnsupportedStorageMode");
}

#[test]
fn existence_filters_compile_under_every_mode() {
    let f = fixture();
    let relations = vec![
        Arc::new(RelationshipDescriptor::has_many("posts", &f.users, &f.posts)),
        Arc::new(
            RelationshipDescriptor::belongs_to_many("roles", &f.users, &f.roles)
                .with_pivot("since", PropertyType::DateTime),
        ),
    ];
    let state = QueryBuilder::new(Arc::clone(&f.users))
        .where_has("posts", |q| q.where_eq("published", true))
        .doesnt_have("roles")
        .build()
        .unwrap();

    for mode in StorageMode::ALL {
        let stmt = StatementCompiler::new(mode).compile_read(&state, &relations).unwrap();
        let text = stmt.text();
        assert!(text.starts_with("MATCH (n:users) WHERE EXISTS {"), "{mode}: {text}");
        assert!(text.contains("NOT EXISTS {"), "{mode}: {text}");
        assert!(text.contains("deleted_at IS NULL"), "{mode}: {text}");
        if mode.uses_edge() {
            assert!(text.contains(":HAS_POSTS]"), "{mode}: {text}");
        } else {
            assert!(!text.contains(":HAS_POSTS]"), "{mode}: {text}");
        }
        assert_bindings_match(text, stmt.parameters());
    }
}

#[test]
fn foreign_key_attach_never_touches_edges() {
    let f = fixture();
    let rel = resolve(
        &RelationshipDescriptor::has_many("posts", &f.users, &f.posts),
        &ResolutionContext::new(StorageMode::ForeignKey),
    )
    .unwrap();
    let stmt = attach(&rel, Value::Int(1), Value::Int(7), &PropertyMap::new()).unwrap();
    assert_eq!(
        stmt.text(),
        "MATCH (p:users) WHERE p.id = $p0 MATCH (r:posts) WHERE r.id = $p1 \
         SET r.user_id = p.id RETURN count(*) AS affected"
    );
}

#[test]
fn moving_a_child_drops_the_previous_owner_edge() {
    let f = fixture();
    let profiles = Arc::new(EntitySchema::new("Profile", "profiles"));
    let descriptors = [
        RelationshipDescriptor::has_many("posts", &f.users, &f.posts),
        RelationshipDescriptor::has_one("profile", &f.users, &profiles),
    ];

    for descriptor in &descriptors {
        for mode in StorageMode::ALL {
            let rel = resolve(descriptor, &ResolutionContext::new(mode)).unwrap();
            let stmt = attach(&rel, Value::Int(2), Value::Int(9), &PropertyMap::new()).unwrap();
            let text = stmt.text();
            let stale = format!(
                "OPTIONAL MATCH (r_o:users)-[r_s:{}]->(r) WHERE r_o <> p DELETE r_s",
                rel.edge_type
            );
            assert_eq!(text.contains(&stale), mode.uses_edge(), "{mode}: {text}");
            if mode.uses_edge() {
                let deleted = text.find("DELETE r_s").unwrap();
                let merged = text.find("MERGE (p)-[r_e:").unwrap();
                assert!(deleted < merged, "{mode}: {text}");
            }
            assert_eq!(
                text.contains("SET r.user_id = p.id"),
                mode.uses_foreign_key(),
                "{mode}: {text}"
            );
            assert_bindings_match(text, stmt.parameters());
        }
    }
}

#[test]
fn many_to_many_pivot_round_trips_through_each_mode() {
    let f = fixture();
    let descriptor = RelationshipDescriptor::belongs_to_many("roles", &f.users, &f.roles)
        .with_pivot("since", PropertyType::DateTime);
    let pivot = props([("since", "2024-01-01")]);

    for mode in StorageMode::ALL {
        let rel = resolve(&descriptor, &ResolutionContext::new(mode)).unwrap();
        let stmt = attach(&rel, Value::Int(1), Value::Int(2), &pivot).unwrap();
        let text = stmt.text();
        assert_eq!(text.contains("[r_e:HAS_ROLES]"), mode.uses_edge(), "{mode}: {text}");
        assert_eq!(text.contains("(r_v:role_user"), mode.uses_foreign_key(), "{mode}: {text}");
        assert_eq!(stmt.parameters()["p2"], Value::from("2024-01-01"));
        assert_bindings_match(text, stmt.parameters());

        let updated = update_edge(&rel, Value::Int(1), Value::Int(2), &props([("since", "2025-02-02")]))
            .unwrap();
        assert_bindings_match(updated.text(), updated.parameters());
    }
}

#[test]
fn undeclared_pivot_properties_are_rejected() {
    let f = fixture();
    let rel = resolve(
        &RelationshipDescriptor::belongs_to_many("roles", &f.users, &f.roles)
            .with_pivot("since", PropertyType::DateTime),
        &ResolutionContext::new(StorageMode::NativeEdge),
    )
    .unwrap();
    let err = attach(&rel, Value::Int(1), Value::Int(2), &props([("level", 3i64)])).unwrap_err();
    assert_eq!(err.code(), "UnknownPivotProperty");

    let plain = resolve(
        &RelationshipDescriptor::has_many("posts", &f.users, &f.posts),
        &ResolutionContext::new(StorageMode::NativeEdge),
    )
    .unwrap();
    let err = update_edge(&plain, Value::Int(1), Value::Int(2), &props([("x", 1i64)])).unwrap_err();
    assert_eq!(err.code(), "PivotNotSupported");
}

#[test]
fn sync_detaches_before_attaching() {
    let f = fixture();
    let rel = resolve(
        &RelationshipDescriptor::belongs_to_many("roles", &f.users, &f.roles),
        &ResolutionContext::new(StorageMode::Hybrid),
    )
    .unwrap();
    let statements = sync(
        &rel,
        Value::Int(1),
        vec![(Value::Int(2), PropertyMap::new()), (Value::Int(3), PropertyMap::new())],
    )
    .unwrap();
    assert_eq!(statements.len(), 3);
    assert!(statements[0].text().contains("NOT r.id IN $p1"), "{}", statements[0].text());
    assert!(statements[1].text().starts_with("MATCH (p:users)"));
    assert!(statements[2].text().contains("MERGE (p)-[r_e:HAS_ROLES]->(r)"));
}

#[test]
fn through_relationships_are_read_only() {
    let f = fixture();
    let countries = Arc::new(EntitySchema::new("Country", "countries"));
    let rel = resolve(
        &RelationshipDescriptor::has_many_through("posts", &countries, &f.users, &f.posts),
        &ResolutionContext::new(StorageMode::ForeignKey),
    )
    .unwrap();
    let err = detach(&rel, Value::Int(1), &DetachFilter::All).unwrap_err();
    assert_eq!(err.code(), "ReadOnlyRelationship");
    let err = attach(&rel, Value::Int(1), Value::Int(2), &PropertyMap::new()).unwrap_err();
    assert_eq!(err.code(), "ReadOnlyRelationship");
}
