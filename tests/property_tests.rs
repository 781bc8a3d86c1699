use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use relgraph::exec::Backoff;
use relgraph::query::statement::placeholders;
use relgraph::relation::{resolve, ModeSource, ResolutionContext};
use relgraph::{
    DriverError, EntitySchema, ExecOptions, ExecutionCoordinator, QueryBuilder,
    RecordingSleeper, RelationshipDescriptor, RetryPolicy, ScriptedDriver, StatementCompiler,
    StorageMode, Value,
};

const COLUMNS: &[&str] = &["age", "name", "status", "score"];
const OPERATORS: &[&str] = &["=", "!=", "<>", ">", ">=", "<", "<=", "like", "not like"];

fn arb_mode() -> impl Strategy<Value = StorageMode> {
    prop_oneof![
        Just(StorageMode::ForeignKey),
        Just(StorageMode::NativeEdge),
        Just(StorageMode::Hybrid),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        "[a-z%]{0,6}".prop_map(Value::String),
        Just(Value::Null),
    ]
}

fn entities() -> (Arc<EntitySchema>, Arc<EntitySchema>) {
    (
        Arc::new(EntitySchema::new("User", "users").soft_deletes("deleted_at")),
        Arc::new(EntitySchema::new("Post", "posts")),
    )
}

/// Builds a random query from a seeded stream so shrinking stays meaningful.
fn random_query(seed: u64, values: &[Value], users: &Arc<EntitySchema>) -> QueryBuilder {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut query = QueryBuilder::new(Arc::clone(users));
    for value in values {
        let column = COLUMNS[rng.gen_range(0..COLUMNS.len())];
        query = match rng.gen_range(0..6) {
            0 => query.where_op(column, OPERATORS[rng.gen_range(0..OPERATORS.len())], value.clone()),
            1 => query.or_where(column, "=", value.clone()),
            2 => query.where_in(column, vec![value.clone(), value.clone()]),
            3 => query.where_not_null(column),
            4 => {
                let value = value.clone();
                query.where_group(move |q| q.where_eq(column, value.clone()).or_where(column, ">", 0i64))
            }
            _ => {
                let value = value.clone();
                query.where_has("posts", move |q| q.where_eq("title", value.clone()))
            }
        };
    }
    if rng.gen_bool(0.5) {
        query = query.order_by(COLUMNS[rng.gen_range(0..COLUMNS.len())]);
    }
    if rng.gen_bool(0.5) {
        query = query.for_page(rng.gen_range(1..5), rng.gen_range(1..50));
    }
    query
}

proptest! {
    #[test]
    fn prop_placeholders_and_bindings_match(
        seed in any::<u64>(),
        values in prop::collection::vec(arb_value(), 0..8),
        mode in arb_mode(),
    ) {
        let (users, posts) = entities();
        let relations = vec![Arc::new(RelationshipDescriptor::has_many("posts", &users, &posts))];
        let Ok(state) = random_query(seed, &values, &users).build() else {
            return Ok(());
        };
        let stmt = match StatementCompiler::new(mode).compile_read(&state, &relations) {
            Ok(stmt) => stmt,
            Err(err) => {
                prop_assert!(
                    matches!(err.code(), "OperandShape" | "NullNotAllowed"),
                    "unexpected {}",
                    err
                );
                return Ok(());
            }
        };
        let bound: BTreeSet<String> = stmt.parameters().keys().cloned().collect();
        prop_assert_eq!(placeholders(stmt.text()), bound);
        prop_assert!(stmt.text().contains("n.deleted_at IS NULL"));
    }

    #[test]
    fn prop_highest_configured_level_wins(
        query_override in prop::option::of(arb_mode()),
        relationship in prop::option::of(arb_mode()),
        model in prop::option::of(arb_mode()),
        process in arb_mode(),
    ) {
        let mut owner = EntitySchema::new("User", "users");
        if let Some(mode) = model {
            owner = owner.storage_mode(mode);
        }
        let owner = Arc::new(owner);
        let posts = Arc::new(EntitySchema::new("Post", "posts"));
        let mut descriptor = RelationshipDescriptor::has_many("posts", &owner, &posts);
        if let Some(mode) = relationship {
            descriptor = descriptor.storage(mode);
        }
        let context = ResolutionContext::new(process).with_override(query_override);
        let resolved = resolve(&descriptor, &context).unwrap();

        let expected = match (query_override, relationship, model) {
            (Some(mode), _, _) => (mode, ModeSource::QueryOverride),
            (None, Some(mode), _) => (mode, ModeSource::Relationship),
            (None, None, Some(mode)) => (mode, ModeSource::Model),
            (None, None, None) => (process, ModeSource::Process),
        };
        prop_assert_eq!((resolved.mode, resolved.source), expected);
    }

    #[test]
    fn prop_retries_never_exceed_the_budget(
        max_attempts in 1u32..6,
        seed in any::<u64>(),
        jitter in any::<bool>(),
    ) {
        let driver = ScriptedDriver::new().shared();
        driver.fail_always(DriverError::message("deadlock detected"));
        let sleeper = Arc::new(RecordingSleeper::new());
        let coordinator = ExecutionCoordinator::new(driver.clone())
            .with_sleeper(sleeper.clone())
            .with_jitter_seed(seed);
        let policy = RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_jitter(jitter);
        let stmt = StatementCompiler::new(StorageMode::ForeignKey)
            .compile_read(&QueryBuilder::new(entities().1).build().unwrap(), &[])
            .unwrap();

        let err = coordinator
            .run_managed(&stmt, &ExecOptions::default().with_retry(policy.clone()))
            .unwrap_err();

        prop_assert_eq!(err.attempts(), Some(max_attempts));
        prop_assert_eq!(driver.executed().len() as u32, max_attempts);
        let delays = sleeper.delays();
        prop_assert_eq!(delays.len() as u32, max_attempts - 1);
        prop_assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }

    #[test]
    fn prop_unjittered_backoff_is_monotonic(
        initial_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        steps in 1usize..12,
    ) {
        let policy = RetryPolicy {
            initial_delay: std::time::Duration::from_millis(initial_ms),
            multiplier,
            jitter: false,
            ..RetryPolicy::default()
        };
        let mut backoff = Backoff::new(policy.clone());
        let delays: Vec<_> = (0..steps).map(|_| backoff.next_delay()).collect();
        prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }
}
