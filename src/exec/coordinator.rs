#![forbid(unsafe_code)]

//! Execution coordinator.
//!
//! Every call walks an explicit state machine:
//!
//! ```text
//! Idle -> StatementBuilt -> Executing -> Succeeded
//!                              |
//!                              +-> TransientFailure -> BackoffWait -> Executing
//!                              +-> PermanentFailure
//! ```
//!
//! Whether a failure counts as transient depends on the entry point. Ad-hoc
//! calls ([`ExecutionCoordinator::run`]) only retry connection-level failures,
//! after a reconnect. Managed calls retry lock conflicts too, so their callers
//! accept that a statement may be applied more than once.
//!
//! Nested `begin` calls only bump a counter; the outermost `begin`/`commit`
//! pair reaches the driver. There are no save-points: an inner rollback marks
//! the whole transaction rollback-only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result, StatementContext};
use crate::exec::classify::{classify, surface};
use crate::exec::driver::{Driver, DriverError, ErrorClass, RawResult, TransactionHandle};
use crate::exec::retry::{Backoff, RetryPolicy, Sleeper, ThreadSleeper};
use crate::query::statement::{CompiledStatement, Intent};

/// Cooperative cancellation flag, checked before each send and each backoff.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Statements already sent still complete.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which failures an entry point may retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryScope {
    /// Connection failures only; lock conflicts surface immediately.
    ConnectionOnly,
    /// Connection failures and transient conflicts. Caller guarantees idempotence.
    Managed,
}

impl RetryScope {
    fn retries(self, class: ErrorClass) -> bool {
        match self {
            RetryScope::ConnectionOnly => class == ErrorClass::Connection,
            RetryScope::Managed => matches!(class, ErrorClass::Connection | ErrorClass::Transient),
        }
    }
}

/// States of one coordinated call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    /// Nothing handed over yet.
    Idle,
    /// Statement compiled.
    StatementBuilt,
    /// Attempt in flight.
    Executing,
    /// Last attempt failed retryably.
    TransientFailure,
    /// Sleeping before the next attempt.
    BackoffWait,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    PermanentFailure,
}

/// Typed result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// Driver returned a value.
    Succeeded(T),
    /// Failure the current scope may retry.
    TransientFailure {
        /// Driver failure.
        error: DriverError,
        /// Its classification.
        class: ErrorClass,
    },
    /// Failure that ends the call.
    PermanentFailure {
        /// Driver failure.
        error: DriverError,
        /// Its classification.
        class: ErrorClass,
    },
}

impl<T> AttemptOutcome<T> {
    /// Classifies a driver result under `scope`.
    pub fn from_result(result: std::result::Result<T, DriverError>, scope: RetryScope) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Succeeded(value),
            Err(error) => {
                let class = classify(&error);
                if scope.retries(class) {
                    AttemptOutcome::TransientFailure { error, class }
                } else {
                    AttemptOutcome::PermanentFailure { error, class }
                }
            }
        }
    }
}

/// What the caller of [`RetryMachine::record`] does next.
#[derive(Debug)]
pub enum Step<T> {
    /// Call finished successfully.
    Done(T),
    /// Wait `delay`, then attempt again.
    Retry {
        /// Failure that triggered the retry.
        error: DriverError,
        /// Its classification.
        class: ErrorClass,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Call failed for good after `attempts` attempts.
    Fail {
        /// Last failure.
        error: DriverError,
        /// Its classification.
        class: ErrorClass,
        /// Attempts made, first one included.
        attempts: u32,
    },
}

/// Retry state machine for one call, free of I/O so it can be driven by hand.
#[derive(Debug)]
pub struct RetryMachine {
    max_attempts: u32,
    attempts: u32,
    state: ExecutionState,
    backoff: Backoff,
    trace: Vec<ExecutionState>,
}

impl RetryMachine {
    /// Idle machine for one call.
    pub fn new(policy: RetryPolicy, backoff: Backoff) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            attempts: 0,
            state: ExecutionState::Idle,
            backoff,
            trace: vec![ExecutionState::Idle],
        }
    }

    fn enter(&mut self, state: ExecutionState) {
        self.state = state;
        self.trace.push(state);
    }

    /// Statement compiled and handed over.
    pub fn built(&mut self) {
        self.enter(ExecutionState::StatementBuilt);
    }

    /// An attempt is about to be sent.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.enter(ExecutionState::Executing);
    }

    /// Folds an attempt outcome into the machine.
    pub fn record<T>(&mut self, outcome: AttemptOutcome<T>) -> Step<T> {
        match outcome {
            AttemptOutcome::Succeeded(value) => {
                self.enter(ExecutionState::Succeeded);
                Step::Done(value)
            }
            AttemptOutcome::TransientFailure { error, class } if self.attempts < self.max_attempts => {
                self.enter(ExecutionState::TransientFailure);
                let delay = self.backoff.next_delay();
                self.enter(ExecutionState::BackoffWait);
                Step::Retry { error, class, delay }
            }
            AttemptOutcome::TransientFailure { error, class }
            | AttemptOutcome::PermanentFailure { error, class } => {
                self.enter(ExecutionState::PermanentFailure);
                Step::Fail {
                    error,
                    class,
                    attempts: self.attempts,
                }
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Every state entered so far, in order.
    pub fn trace(&self) -> &[ExecutionState] {
        &self.trace
    }
}

/// Per-call execution settings, normally taken from a configuration snapshot.
#[derive(Clone, Debug)]
pub struct ExecOptions {
    /// Retry policy for this call.
    pub retry: RetryPolicy,
    /// Statements per driver batch request.
    pub batch_size: usize,
    /// Route `Read` statements to the replica when one is attached.
    pub route_reads_to_replica: bool,
    /// Cooperative cancellation.
    pub cancel: Option<CancellationToken>,
}

impl ExecOptions {
    /// Options drawn from a configuration snapshot.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            batch_size: config.batch_size.max(1),
            route_reads_to_replica: config.route_reads_to_replica,
            cancel: None,
        }
    }

    /// Overrides the retry policy for this call only.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Default)]
struct TxState {
    depth: u32,
    handle: Option<TransactionHandle>,
    rollback_only: bool,
}

/// A failed attempt together with the statement it concerns.
struct Failed {
    error: DriverError,
    context: StatementContext,
}

impl Failed {
    fn new(error: DriverError, context: StatementContext) -> Self {
        Self { error, context }
    }
}

/// Sends compiled statements through a [`Driver`] with retry, batching and
/// transaction counting.
pub struct ExecutionCoordinator {
    writer: Arc<dyn Driver>,
    replica: Option<Arc<dyn Driver>>,
    sleeper: Arc<dyn Sleeper>,
    jitter_seed: Option<u64>,
    tx: Mutex<TxState>,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("replica", &self.replica.is_some())
            .field("tx", &*self.tx.lock())
            .finish()
    }
}

impl ExecutionCoordinator {
    /// Coordinator writing (and reading) through `writer`.
    pub fn new(writer: Arc<dyn Driver>) -> Self {
        Self {
            writer,
            replica: None,
            sleeper: Arc::new(ThreadSleeper),
            jitter_seed: None,
            tx: Mutex::new(TxState::default()),
        }
    }

    /// Attaches a read replica for `Read` statements outside transactions.
    pub fn with_replica(mut self, replica: Arc<dyn Driver>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Replaces the backoff sleeper.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Makes jitter deterministic.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    fn backoff(&self, policy: &RetryPolicy) -> Backoff {
        match self.jitter_seed {
            Some(seed) => Backoff::seeded(policy.clone(), seed),
            None => Backoff::new(policy.clone()),
        }
    }

    /// Current nesting depth of explicit transactions.
    pub fn transaction_depth(&self) -> u32 {
        self.tx.lock().depth
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    fn current_handle(&self) -> Option<TransactionHandle> {
        self.tx.lock().handle
    }

    fn route(&self, intent: Intent, in_tx: bool, opts: &ExecOptions) -> &dyn Driver {
        match (&self.replica, intent) {
            (Some(replica), Intent::Read) if !in_tx && opts.route_reads_to_replica => replica.as_ref(),
            _ => self.writer.as_ref(),
        }
    }

    /// Drives `op` through the retry machine. Inside an explicit transaction a
    /// single attempt is made: the driver transaction cannot be resumed.
    fn drive<T>(
        &self,
        driver: &dyn Driver,
        opts: &ExecOptions,
        scope: RetryScope,
        in_tx: bool,
        first: &StatementContext,
        mut op: impl FnMut(&dyn Driver) -> std::result::Result<T, Failed>,
    ) -> Result<T> {
        let policy = if in_tx {
            RetryPolicy::no_retry()
        } else {
            opts.retry.clone()
        };
        let mut machine = RetryMachine::new(policy.clone(), self.backoff(&policy));
        machine.built();
        loop {
            if opts.cancelled() {
                return Err(Error::Cancelled(first.clone()));
            }
            machine.begin_attempt();
            let mut context = first.clone();
            let result = op(driver).map_err(|failed| {
                context = failed.context;
                failed.error
            });
            match machine.record(AttemptOutcome::from_result(result, scope)) {
                Step::Done(value) => return Ok(value),
                Step::Retry { error, class, delay } => {
                    warn!(
                        attempt = machine.attempts(),
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        class = ?class,
                        error = %error,
                        "exec.retry"
                    );
                    if class == ErrorClass::Connection {
                        if let Err(err) = driver.reconnect() {
                            warn!(error = %err, "exec.reconnect.failed");
                        }
                    }
                    if opts.cancelled() {
                        return Err(Error::Cancelled(context));
                    }
                    self.sleeper.sleep(delay);
                }
                Step::Fail {
                    error,
                    class,
                    attempts,
                } => return Err(surface(error, class, context, attempts)),
            }
        }
    }

    fn execute_one(&self, stmt: &CompiledStatement, opts: &ExecOptions, scope: RetryScope) -> Result<RawResult> {
        let tx = self.current_handle();
        let driver = self.route(stmt.intent(), tx.is_some(), opts);
        let context = stmt.context();
        self.drive(driver, opts, scope, tx.is_some(), &context, |driver| {
            driver
                .execute(stmt.text(), stmt.parameters(), tx)
                .map_err(|err| Failed::new(err, stmt.context()))
        })
    }

    /// Ad-hoc execution. Retries connection failures only.
    pub fn run(&self, stmt: &CompiledStatement, opts: &ExecOptions) -> Result<RawResult> {
        self.execute_one(stmt, opts, RetryScope::ConnectionOnly)
    }

    /// Managed execution. The caller guarantees the statement is idempotent.
    pub fn run_managed(&self, stmt: &CompiledStatement, opts: &ExecOptions) -> Result<RawResult> {
        self.execute_one(stmt, opts, RetryScope::Managed)
    }

    /// Executes independent statements as one unit with ad-hoc retry rules.
    pub fn run_batch(&self, stmts: &[CompiledStatement], opts: &ExecOptions) -> Result<Vec<RawResult>> {
        self.execute_batch(stmts, opts, RetryScope::ConnectionOnly)
    }

    /// Executes independent statements as one unit, retrying the whole unit.
    pub fn run_batch_managed(&self, stmts: &[CompiledStatement], opts: &ExecOptions) -> Result<Vec<RawResult>> {
        self.execute_batch(stmts, opts, RetryScope::Managed)
    }

    fn execute_batch(
        &self,
        stmts: &[CompiledStatement],
        opts: &ExecOptions,
        scope: RetryScope,
    ) -> Result<Vec<RawResult>> {
        let Some(first) = stmts.first() else {
            return Ok(Vec::new());
        };
        let driver = self.writer.as_ref();
        let context = first.context();
        let outer = self.current_handle();
        debug!(
            statements = stmts.len(),
            batch_size = opts.batch_size,
            native = driver.supports_batch(),
            "exec.batch"
        );
        self.drive(driver, opts, scope, outer.is_some(), &context, |driver| {
            if let Some(handle) = outer {
                return send_chunks(driver, stmts, opts.batch_size, handle);
            }
            // Implicit transaction: any failure rolls back the whole batch.
            let handle = driver
                .begin_transaction()
                .map_err(|err| Failed::new(err, StatementContext::none()))?;
            match send_chunks(driver, stmts, opts.batch_size, handle) {
                Ok(results) => {
                    driver
                        .commit(handle)
                        .map_err(|err| Failed::new(err, StatementContext::none()))?;
                    Ok(results)
                }
                Err(failed) => {
                    if let Err(err) = driver.rollback(handle) {
                        warn!(error = %err, "exec.batch.rollback_failed");
                    }
                    Err(failed)
                }
            }
        })
    }

    /// Opens (or nests into) an explicit transaction.
    pub fn begin(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            let handle = self
                .writer
                .begin_transaction()
                .map_err(driver_boundary_error)?;
            tx.handle = Some(handle);
            tx.rollback_only = false;
            debug!(handle = handle.0, "exec.tx.begin");
        }
        tx.depth += 1;
        Ok(())
    }

    /// Commits the outermost transaction; inner commits only decrement the counter.
    pub fn commit(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            return Err(Error::Transaction("commit without an open transaction".into()));
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }
        let Some(handle) = tx.handle.take() else {
            return Err(Error::Transaction("transaction handle missing".into()));
        };
        if std::mem::take(&mut tx.rollback_only) {
            self.writer
                .rollback(handle)
                .map_err(driver_boundary_error)?;
            debug!(handle = handle.0, "exec.tx.rollback_only");
            return Err(Error::Transaction(
                "transaction was marked rollback-only by an inner rollback".into(),
            ));
        }
        self.writer
            .commit(handle)
            .map_err(driver_boundary_error)?;
        debug!(handle = handle.0, "exec.tx.commit");
        Ok(())
    }

    /// Rolls back the outermost transaction; inner rollbacks mark it rollback-only.
    pub fn rollback(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            return Err(Error::Transaction("rollback without an open transaction".into()));
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            tx.rollback_only = true;
            return Ok(());
        }
        tx.rollback_only = false;
        let Some(handle) = tx.handle.take() else {
            return Err(Error::Transaction("transaction handle missing".into()));
        };
        self.writer
            .rollback(handle)
            .map_err(driver_boundary_error)?;
        debug!(handle = handle.0, "exec.tx.rollback");
        Ok(())
    }

    /// Drops every nesting level and rolls back the driver transaction.
    fn abort(&self) {
        let mut tx = self.tx.lock();
        tx.depth = 0;
        tx.rollback_only = false;
        if let Some(handle) = tx.handle.take() {
            if let Err(err) = self.writer.rollback(handle) {
                warn!(error = %err, "exec.tx.abort_failed");
            }
        }
    }

    /// Runs `work` inside a transaction, retrying the whole closure on
    /// transient failure with a rollback in between. `work` must be
    /// idempotent. Nested inside an open transaction, it runs once.
    pub fn managed_transaction<T, F>(&self, opts: &ExecOptions, mut work: F) -> Result<T>
    where
        F: FnMut(&ExecutionCoordinator) -> Result<T>,
    {
        if self.in_transaction() {
            self.begin()?;
            return match work(self) {
                Ok(value) => self.commit().map(|_| value),
                Err(err) => {
                    self.rollback()?;
                    Err(err)
                }
            };
        }

        let max_attempts = opts.retry.max_attempts.max(1);
        let mut backoff = self.backoff(&opts.retry);
        let mut attempt = 0;
        loop {
            if opts.cancelled() {
                return Err(Error::Cancelled(StatementContext::none()));
            }
            attempt += 1;
            self.begin()?;
            let err = match work(self) {
                Ok(value) => match self.commit() {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                },
                Err(err) => {
                    self.abort();
                    err
                }
            };
            if !err.is_transient() || attempt >= max_attempts {
                return Err(err.with_attempts(attempt));
            }
            let delay = backoff.next_delay();
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "exec.tx.retry"
            );
            if opts.cancelled() {
                return Err(Error::Cancelled(StatementContext::none()));
            }
            self.sleeper.sleep(delay);
        }
    }

    /// Liveness probe against the writer.
    pub fn ping(&self) -> bool {
        self.writer.ping()
    }
}

fn send_chunks(
    driver: &dyn Driver,
    stmts: &[CompiledStatement],
    batch_size: usize,
    handle: TransactionHandle,
) -> std::result::Result<Vec<RawResult>, Failed> {
    let mut results = Vec::with_capacity(stmts.len());
    for chunk in stmts.chunks(batch_size.max(1)) {
        if driver.supports_batch() {
            // One request per chunk; the driver cannot say which statement failed.
            let chunk_results = driver
                .execute_batch(chunk, Some(handle))
                .map_err(|err| Failed::new(err, chunk[0].context()))?;
            results.extend(chunk_results);
        } else {
            for stmt in chunk {
                let result = driver
                    .execute(stmt.text(), stmt.parameters(), Some(handle))
                    .map_err(|err| Failed::new(err, stmt.context()))?;
                results.push(result);
            }
        }
    }
    Ok(results)
}

fn driver_boundary_error(error: DriverError) -> Error {
    let class = classify(&error);
    surface(error, class, StatementContext::none(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn deadlock() -> DriverError {
        DriverError::with_code("Neo.TransientError.Transaction.DeadlockDetected", "deadlock")
    }

    #[test]
    fn machine_walks_retry_states() {
        let p = policy(2);
        let mut machine = RetryMachine::new(p.clone(), Backoff::new(p));
        machine.built();
        machine.begin_attempt();
        let step = machine.record(AttemptOutcome::<()>::from_result(Err(deadlock()), RetryScope::Managed));
        assert!(matches!(step, Step::Retry { delay, .. } if delay == Duration::from_millis(10)));
        machine.begin_attempt();
        let step = machine.record(AttemptOutcome::<()>::from_result(Err(deadlock()), RetryScope::Managed));
        assert!(matches!(step, Step::Fail { attempts: 2, .. }));
        assert_eq!(
            machine.trace(),
            &[
                ExecutionState::Idle,
                ExecutionState::StatementBuilt,
                ExecutionState::Executing,
                ExecutionState::TransientFailure,
                ExecutionState::BackoffWait,
                ExecutionState::Executing,
                ExecutionState::PermanentFailure,
            ]
        );
    }

    #[test]
    fn ad_hoc_scope_does_not_retry_conflicts() {
        let outcome = AttemptOutcome::<()>::from_result(Err(deadlock()), RetryScope::ConnectionOnly);
        assert!(matches!(outcome, AttemptOutcome::PermanentFailure { class: ErrorClass::Transient, .. }));
        let broken = DriverError::classified(ErrorClass::Connection, "broken pipe");
        let outcome = AttemptOutcome::<()>::from_result(Err(broken), RetryScope::ConnectionOnly);
        assert!(matches!(outcome, AttemptOutcome::TransientFailure { .. }));
    }

    #[test]
    fn success_is_terminal() {
        let p = policy(3);
        let mut machine = RetryMachine::new(p.clone(), Backoff::new(p));
        machine.begin_attempt();
        let step = machine.record(AttemptOutcome::from_result(Ok(5), RetryScope::Managed));
        assert!(matches!(step, Step::Done(5)));
        assert_eq!(machine.state(), ExecutionState::Succeeded);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let opts = ExecOptions::default().with_cancel(token.clone());
        assert!(!opts.cancelled());
        token.cancel();
        assert!(opts.cancelled());
    }
}
