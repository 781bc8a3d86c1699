#![forbid(unsafe_code)]

//! In-memory [`Driver`] that replays scripted responses and records every call.
//!
//! Meant for tests and for exercising the coordinator without a database.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::exec::driver::{Driver, DriverError, RawResult, TransactionHandle};
use crate::query::statement::CompiledStatement;
use crate::value::Value;

/// One recorded driver interaction.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum DriverCall {
    Execute {
        text: String,
        parameters: BTreeMap<String, Value>,
        tx: Option<TransactionHandle>,
    },
    /// One native batch request.
    Batch {
        texts: Vec<String>,
        tx: Option<TransactionHandle>,
    },
    Begin(TransactionHandle),
    Commit(TransactionHandle),
    Rollback(TransactionHandle),
    Reconnect,
    Ping,
}

type Responder = dyn Fn(&str, &BTreeMap<String, Value>) -> Option<Result<RawResult, DriverError>> + Send + Sync;

#[derive(Default)]
struct Script {
    queued: VecDeque<Result<RawResult, DriverError>>,
    persistent: Option<DriverError>,
    calls: Vec<DriverCall>,
    next_tx: u64,
}

/// Scripted driver. Responses are served from a FIFO queue, then from an
/// optional responder, then as an empty result.
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
    responder: Option<Box<Responder>>,
    batch: bool,
    alive: bool,
}

impl std::fmt::Debug for ScriptedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedDriver")
            .field("batch", &self.batch)
            .field("calls", &self.script.lock().calls.len())
            .finish()
    }
}

impl ScriptedDriver {
    /// Live driver with an empty script.
    pub fn new() -> Self {
        Self {
            alive: true,
            ..Self::default()
        }
    }

    /// Advertises native batch support.
    pub fn with_batch_support(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Answers statements the queue does not cover.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str, &BTreeMap<String, Value>) -> Option<Result<RawResult, DriverError>> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Makes `ping` report a dead connection.
    pub fn unreachable(mut self) -> Self {
        self.alive = false;
        self
    }

    /// Wraps the driver for sharing with a coordinator.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Queues a successful response.
    pub fn push_result(&self, result: RawResult) {
        self.script.lock().queued.push_back(Ok(result));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: DriverError) {
        self.script.lock().queued.push_back(Err(error));
    }

    /// Fails every statement with `error` until cleared.
    pub fn fail_always(&self, error: DriverError) {
        self.script.lock().persistent = Some(error);
    }

    /// Stops the failure set by [`fail_always`](Self::fail_always).
    pub fn clear_failure(&self) {
        self.script.lock().persistent = None;
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.script.lock().calls.clone()
    }

    /// Texts of executed statements, batched ones included.
    pub fn executed(&self) -> Vec<String> {
        self.script
            .lock()
            .calls
            .iter()
            .flat_map(|call| match call {
                DriverCall::Execute { text, .. } => vec![text.clone()],
                DriverCall::Batch { texts, .. } => texts.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.script.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn respond(&self, script: &mut Script, text: &str, parameters: &BTreeMap<String, Value>) -> Result<RawResult, DriverError> {
        if let Some(error) = &script.persistent {
            return Err(error.clone());
        }
        if let Some(next) = script.queued.pop_front() {
            return next;
        }
        self.responder
            .as_ref()
            .and_then(|responder| responder(text, parameters))
            .unwrap_or_else(|| Ok(RawResult::empty()))
    }
}

impl Driver for ScriptedDriver {
    fn execute(
        &self,
        text: &str,
        parameters: &BTreeMap<String, Value>,
        tx: Option<TransactionHandle>,
    ) -> Result<RawResult, DriverError> {
        let mut script = self.script.lock();
        script.calls.push(DriverCall::Execute {
            text: text.to_owned(),
            parameters: parameters.clone(),
            tx,
        });
        self.respond(&mut script, text, parameters)
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn execute_batch(
        &self,
        statements: &[CompiledStatement],
        tx: Option<TransactionHandle>,
    ) -> Result<Vec<RawResult>, DriverError> {
        let mut script = self.script.lock();
        script.calls.push(DriverCall::Batch {
            texts: statements.iter().map(|s| s.text().to_owned()).collect(),
            tx,
        });
        statements
            .iter()
            .map(|s| self.respond(&mut script, s.text(), s.parameters()))
            .collect()
    }

    fn begin_transaction(&self) -> Result<TransactionHandle, DriverError> {
        let mut script = self.script.lock();
        script.next_tx += 1;
        let handle = TransactionHandle(script.next_tx);
        script.calls.push(DriverCall::Begin(handle));
        Ok(handle)
    }

    fn commit(&self, tx: TransactionHandle) -> Result<(), DriverError> {
        self.script.lock().calls.push(DriverCall::Commit(tx));
        Ok(())
    }

    fn rollback(&self, tx: TransactionHandle) -> Result<(), DriverError> {
        self.script.lock().calls.push(DriverCall::Rollback(tx));
        Ok(())
    }

    fn ping(&self) -> bool {
        self.script.lock().calls.push(DriverCall::Ping);
        self.alive
    }

    fn reconnect(&self) -> Result<(), DriverError> {
        self.script.lock().calls.push(DriverCall::Reconnect);
        Ok(())
    }
}
