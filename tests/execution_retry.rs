use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use relgraph::exec::{
    AttemptOutcome, Backoff, DriverCall, ExecutionState, RetryMachine, RetryScope, Step,
    TransactionHandle,
};
use relgraph::query::Intent;
use relgraph::{
    CancellationToken, CompiledStatement, DriverError, Error, ErrorClass, ExecOptions,
    ExecutionCoordinator, RawResult, RecordingSleeper, RetryPolicy, ScriptedDriver, Value,
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

fn read(id: i64) -> CompiledStatement {
    let mut params = BTreeMap::new();
    params.insert("p0".to_owned(), Value::Int(id));
    CompiledStatement::new("MATCH (n:users) WHERE n.id = $p0 RETURN n", params, Intent::Read, true)
        .unwrap()
}

fn write(id: i64) -> CompiledStatement {
    let mut params = BTreeMap::new();
    params.insert("p0".to_owned(), Value::Int(id));
    CompiledStatement::new("CREATE (n:users) SET n.id = $p0 RETURN n", params, Intent::Write, true)
        .unwrap()
}

fn steady_policy() -> RetryPolicy {
    RetryPolicy::default().with_jitter(false)
}

fn opts() -> ExecOptions {
    ExecOptions::default().with_retry(steady_policy())
}

fn coordinator(driver: &Arc<ScriptedDriver>) -> (ExecutionCoordinator, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let coordinator = ExecutionCoordinator::new(driver.clone()).with_sleeper(sleeper.clone());
    (coordinator, sleeper)
}

fn deadlock() -> DriverError {
    DriverError::with_code(
        "Neo.TransientError.Transaction.DeadlockDetected",
        "deadlock detected while trying to acquire locks",
    )
}

fn connection_lost() -> DriverError {
    DriverError::with_code("ServiceUnavailable", "connection reset by peer")
}

#[test]
fn connection_failures_reconnect_and_retry_on_ad_hoc_runs() {
    init_tracing();
    let driver = ScriptedDriver::new().shared();
    driver.push_error(connection_lost());
    driver.push_result(RawResult::affected(1));
    let (coordinator, sleeper) = coordinator(&driver);

    coordinator.run(&read(1), &opts()).unwrap();

    assert_eq!(driver.executed().len(), 2);
    assert_eq!(driver.count(|c| matches!(c, DriverCall::Reconnect)), 1);
    assert_eq!(sleeper.delays(), vec![Duration::from_millis(100)]);
}

#[test]
fn lock_conflicts_surface_immediately_on_ad_hoc_runs() {
    let driver = ScriptedDriver::new().shared();
    driver.push_error(deadlock());
    let (coordinator, sleeper) = coordinator(&driver);

    let err = coordinator.run(&write(1), &opts()).unwrap_err();

    assert!(matches!(err, Error::TransientDriver { attempts: 1, .. }), "{err}");
    assert_eq!(driver.executed().len(), 1);
    assert!(sleeper.delays().is_empty());
}

#[test]
fn managed_runs_retry_until_the_attempt_budget_is_spent() {
    let driver = ScriptedDriver::new().shared();
    driver.fail_always(deadlock());
    let (coordinator, sleeper) = coordinator(&driver);

    let err = coordinator.run_managed(&read(7), &opts()).unwrap_err();

    assert_eq!(err.attempts(), Some(3));
    assert_eq!(driver.executed().len(), 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    let context = err.context().unwrap();
    assert_eq!(context.text, "MATCH (n:users) WHERE n.id = $p0 RETURN n");
    assert_eq!(context.parameters["p0"], Value::Int(7));
}

#[test]
fn permanent_failures_are_never_retried() {
    let driver = ScriptedDriver::new().shared();
    driver.push_error(DriverError::with_code(
        "Neo.ClientError.Schema.ConstraintValidationFailed",
        "Node(1) already exists with label `users`",
    ));
    let (coordinator, sleeper) = coordinator(&driver);

    let err = coordinator.run_managed(&write(1), &opts()).unwrap_err();

    assert!(matches!(err, Error::ConstraintViolation { .. }), "{err}");
    assert!(!err.is_transient());
    assert_eq!(driver.executed().len(), 1);
    assert!(sleeper.delays().is_empty());

    driver.push_error(DriverError::classified(ErrorClass::Authentication, "bad credentials"));
    let err = coordinator.run_managed(&write(2), &opts()).unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }), "{err}");
}

#[test]
fn jittered_delays_stay_within_bounds() {
    let driver = ScriptedDriver::new().shared();
    driver.fail_always(deadlock());
    let sleeper = Arc::new(RecordingSleeper::new());
    let coordinator = ExecutionCoordinator::new(driver.clone())
        .with_sleeper(sleeper.clone())
        .with_jitter_seed(42);
    let policy = RetryPolicy::default().with_max_attempts(5);

    let _ = coordinator.run_managed(&read(1), &ExecOptions::default().with_retry(policy.clone()));

    let delays = sleeper.delays();
    assert_eq!(delays.len(), 4);
    for (attempt, delay) in delays.iter().enumerate() {
        let base = policy.base_delay(attempt as u32);
        assert!(*delay >= base.mul_f64(0.5), "{delay:?} < half of {base:?}");
        assert!(*delay <= policy.max_delay);
    }
}

#[test]
fn batches_are_chunked_inside_one_implicit_transaction() {
    let driver = ScriptedDriver::new().with_batch_support().shared();
    let (coordinator, _) = coordinator(&driver);
    let statements: Vec<_> = (0..5).map(write).collect();
    let mut options = opts();
    options.batch_size = 2;

    let results = coordinator.run_batch(&statements, &options).unwrap();

    assert_eq!(results.len(), 5);
    let handle = TransactionHandle(1);
    let calls = driver.calls();
    assert_eq!(calls.first(), Some(&DriverCall::Begin(handle)));
    assert_eq!(calls.last(), Some(&DriverCall::Commit(handle)));
    let batches: Vec<usize> = calls
        .iter()
        .filter_map(|c| match c {
            DriverCall::Batch { texts, tx } => {
                assert_eq!(*tx, Some(handle));
                Some(texts.len())
            }
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![2, 2, 1]);
}

#[test]
fn failed_batch_rolls_back_and_names_the_failing_statement() {
    let driver = ScriptedDriver::new().shared();
    let (coordinator, _) = coordinator(&driver);
    driver.push_result(RawResult::affected(1));
    driver.push_error(DriverError::with_code(
        "Neo.ClientError.Statement.SyntaxError",
        "Invalid input",
    ));
    let statements = vec![write(1), write(2), write(3)];

    let err = coordinator.run_batch(&statements, &opts()).unwrap_err();

    assert!(matches!(err, Error::Driver { .. }), "{err}");
    assert_eq!(err.context().unwrap().parameters["p0"], Value::Int(2));
    assert_eq!(driver.count(|c| matches!(c, DriverCall::Rollback(_))), 1);
    assert_eq!(driver.count(|c| matches!(c, DriverCall::Commit(_))), 0);
    assert_eq!(driver.executed().len(), 2);
}

#[test]
fn nested_rollback_poisons_the_outer_commit() {
    let driver = ScriptedDriver::new().shared();
    let (coordinator, _) = coordinator(&driver);

    coordinator.begin().unwrap();
    coordinator.begin().unwrap();
    assert_eq!(coordinator.transaction_depth(), 2);
    coordinator.rollback().unwrap();
    assert_eq!(coordinator.transaction_depth(), 1);
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, Error::Transaction(_)), "{err}");
    assert!(!coordinator.in_transaction());
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::Begin(TransactionHandle(1)),
            DriverCall::Rollback(TransactionHandle(1)),
        ]
    );
}

#[test]
fn statements_inside_a_transaction_reuse_its_handle_and_skip_retries() {
    let driver = ScriptedDriver::new().shared();
    let (coordinator, sleeper) = coordinator(&driver);

    coordinator.begin().unwrap();
    driver.push_error(connection_lost());
    let err = coordinator.run_managed(&write(1), &opts()).unwrap_err();
    assert_eq!(err.attempts(), Some(1));
    coordinator.rollback().unwrap();

    assert!(sleeper.delays().is_empty());
    assert!(driver.calls().iter().any(|c| matches!(
        c,
        DriverCall::Execute { tx: Some(TransactionHandle(1)), .. }
    )));
}

#[test]
fn managed_transactions_rerun_the_whole_unit() {
    let driver = ScriptedDriver::new().shared();
    let (coordinator, sleeper) = coordinator(&driver);
    driver.push_error(deadlock());
    let mut runs = 0;

    let value = coordinator
        .managed_transaction(&opts(), |tx| {
            runs += 1;
            tx.run_managed(&write(1), &opts())?;
            Ok(runs)
        })
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(sleeper.delays().len(), 1);
    let boundaries: Vec<DriverCall> = driver
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, DriverCall::Execute { .. }))
        .collect();
    assert_eq!(
        boundaries,
        vec![
            DriverCall::Begin(TransactionHandle(1)),
            DriverCall::Rollback(TransactionHandle(1)),
            DriverCall::Begin(TransactionHandle(2)),
            DriverCall::Commit(TransactionHandle(2)),
        ]
    );
}

#[test]
fn cancellation_stops_before_anything_is_sent() {
    let driver = ScriptedDriver::new().shared();
    let (coordinator, _) = coordinator(&driver);
    let token = CancellationToken::new();
    token.cancel();

    let err = coordinator
        .run(&read(1), &opts().with_cancel(token))
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)), "{err}");
    assert!(driver.calls().is_empty());
}

#[test]
fn reads_go_to_the_replica_outside_transactions() {
    let writer = ScriptedDriver::new().shared();
    let replica = ScriptedDriver::new().shared();
    let coordinator = ExecutionCoordinator::new(writer.clone()).with_replica(replica.clone());

    coordinator.run(&read(1), &opts()).unwrap();
    coordinator.run(&write(1), &opts()).unwrap();
    coordinator.begin().unwrap();
    coordinator.run(&read(2), &opts()).unwrap();
    coordinator.commit().unwrap();

    assert_eq!(replica.executed().len(), 1);
    assert_eq!(writer.executed().len(), 2);
}

#[test]
fn retry_machine_walks_the_documented_states() {
    let policy = steady_policy();
    let mut machine = RetryMachine::new(policy.clone(), Backoff::seeded(policy, 0));
    machine.built();
    machine.begin_attempt();
    let step = machine.record(AttemptOutcome::<()>::from_result(Err(deadlock()), RetryScope::Managed));
    assert!(matches!(step, Step::Retry { class: ErrorClass::Transient, .. }));
    machine.begin_attempt();
    let step = machine.record(AttemptOutcome::from_result(Ok(5), RetryScope::Managed));
    assert!(matches!(step, Step::Done(5)));
    assert_eq!(
        machine.trace(),
        &[
            ExecutionState::Idle,
            ExecutionState::StatementBuilt,
            ExecutionState::Executing,
            ExecutionState::TransientFailure,
            ExecutionState::BackoffWait,
            ExecutionState::Executing,
            ExecutionState::Succeeded,
        ]
    );
    assert_eq!(machine.attempts(), 2);
}
