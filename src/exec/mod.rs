#![forbid(unsafe_code)]

//! Statement execution: driver boundary, error classification, retry and
//! transaction coordination.

pub mod classify;
pub mod coordinator;
pub mod driver;
pub mod retry;
pub mod scripted;

pub use classify::classify;
pub use coordinator::{
    AttemptOutcome, CancellationToken, ExecOptions, ExecutionCoordinator, ExecutionState,
    RetryMachine, RetryScope, Step,
};
pub use driver::{
    Driver, DriverError, ErrorClass, RawEdge, RawNode, RawRecord, RawResult, RawValue,
    TransactionHandle,
};
pub use retry::{Backoff, RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use scripted::{DriverCall, ScriptedDriver};
