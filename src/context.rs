//! Execution context passed to every handler invocation.
//!
//! The context is the only way handlers interact with the run: sends and
//! yields are enqueued for the *next* superstep, events are buffered in
//! production order, the scoped state bag carries cross-step values, and
//! [`WorkflowContext::request_external`] suspends the calling handler until
//! a matching response arrives.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::event_bus::{Event, EventEmitter};
use crate::executor::Protocol;
use crate::gate::{ExternalRequest, GateError, SharedGate};
use crate::types::{ExecutorId, PortId, RequestId, TypeId};

/// Scopes of the per-run state bag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateScope {
    /// Runtime-owned entries.
    System,
    /// Entries private to the calling executor.
    Executor,
    /// Entries shared by every executor in the run.
    Session,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct StateKey {
    pub scope: StateScope,
    pub executor: Option<ExecutorId>,
    pub key: String,
}

/// Scoped key-value store, partitioned per run.
///
/// Executor-scoped entries are keyed by the calling executor's id, so two
/// executors never observe each other's private entries.
#[derive(Clone, Debug, Default)]
pub struct StateBag {
    inner: Arc<parking_lot::Mutex<FxHashMap<StateKey, Value>>>,
}

impl StateBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(
        &self,
        scope: StateScope,
        executor: Option<&ExecutorId>,
        key: &str,
    ) -> Option<Value> {
        let executor = match scope {
            StateScope::Executor => executor.cloned(),
            _ => None,
        };
        self.inner
            .lock()
            .get(&StateKey {
                scope,
                executor,
                key: key.to_string(),
            })
            .cloned()
    }

    pub(crate) fn set(
        &self,
        scope: StateScope,
        executor: Option<&ExecutorId>,
        key: impl Into<String>,
        value: Value,
    ) {
        let executor = match scope {
            StateScope::Executor => executor.cloned(),
            _ => None,
        };
        self.inner.lock().insert(
            StateKey {
                scope,
                executor,
                key: key.into(),
            },
            value,
        );
    }

    /// Deterministically ordered snapshot for checkpoint capture.
    pub(crate) fn entries(&self) -> Vec<(StateKey, Value)> {
        let mut all: Vec<(StateKey, Value)> = self
            .inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|(a, _), (b, _)| {
            (a.scope as u8, &a.executor, &a.key).cmp(&(b.scope as u8, &b.executor, &b.key))
        });
        all
    }

    pub(crate) fn replace(&self, entries: Vec<(StateKey, Value)>) {
        let mut inner = self.inner.lock();
        inner.clear();
        inner.extend(entries);
    }
}

/// Cooperative cancellation flag, checked at suspension points.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub(crate) fn cancel_pair() -> (watch::Sender<bool>, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (tx, CancelToken { rx })
}

/// Notice that an invocation suspended on an external request.
#[derive(Clone, Debug)]
pub(crate) struct SuspensionNotice {
    pub invocation: u64,
    pub request_id: RequestId,
}

/// Everything a handler deposits during an invocation, in emit order.
#[derive(Clone, Debug)]
pub(crate) enum OutboxEntry {
    Send {
        payload: Value,
        type_id: TypeId,
        target: Option<ExecutorId>,
        emit_index: u32,
    },
    Yield {
        payload: Value,
        type_id: TypeId,
        emit_index: u32,
    },
    Event(Event),
}

/// Errors surfaced by context operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    /// Send of a type the executor's protocol does not declare.
    #[error("executor `{executor}` may not send type `{type_id}`")]
    #[diagnostic(
        code(relaygraph::context::send_violation),
        help("Declare the type in the executor's protocol sends set.")
    )]
    SendViolation {
        executor: ExecutorId,
        type_id: TypeId,
    },

    /// Yield of a type the executor's protocol does not declare.
    #[error("executor `{executor}` may not yield type `{type_id}`")]
    #[diagnostic(
        code(relaygraph::context::yield_violation),
        help("Declare the type in the executor's protocol yields set.")
    )]
    YieldViolation {
        executor: ExecutorId,
        type_id: TypeId,
    },

    /// Request through a port the workflow never registered.
    #[error("unknown request port `{port}`")]
    #[diagnostic(
        code(relaygraph::context::unknown_port),
        help("Register the port on the workflow builder before using it.")
    )]
    UnknownPort { port: PortId },

    /// The run is shutting down; the outbox no longer accepts entries.
    #[error("workflow outbox closed")]
    #[diagnostic(code(relaygraph::context::closed))]
    Closed,

    /// The run was cancelled while the handler was suspended.
    #[error("cancelled while awaiting external response")]
    #[diagnostic(code(relaygraph::context::cancelled))]
    Cancelled,

    /// Event could not be emitted; the bus is gone.
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(code(relaygraph::context::event_bus_unavailable))]
    EventBusUnavailable,
}

/// Per-invocation capability object handed to handlers.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) executor_id: ExecutorId,
    pub(crate) step: u64,
    pub(crate) run_id: String,
    pub(crate) invocation: u64,
    pub(crate) protocol: Arc<Protocol>,
    pub(crate) outbox: flume::Sender<OutboxEntry>,
    pub(crate) emitter: Arc<dyn EventEmitter>,
    pub(crate) state: StateBag,
    pub(crate) gate: SharedGate,
    pub(crate) ports: Arc<FxHashSet<PortId>>,
    pub(crate) suspension: flume::Sender<SuspensionNotice>,
    pub(crate) cancel: CancelToken,
    pub(crate) trace: Option<String>,
    pub(crate) emit_seq: Arc<AtomicU32>,
}

impl WorkflowContext {
    #[must_use]
    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    /// Current superstep number.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Opaque parent span identifier for telemetry correlation.
    #[must_use]
    pub fn trace_context(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn next_emit_index(&self) -> u32 {
        self.emit_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn push(&self, entry: OutboxEntry) -> Result<(), ContextError> {
        self.outbox.send(entry).map_err(|_| ContextError::Closed)
    }

    /// Enqueue a message for routing through the executor's outgoing edges
    /// in the next superstep.
    pub fn send_message(&self, payload: Value, type_id: TypeId) -> Result<(), ContextError> {
        self.send_inner(payload, type_id, None)
    }

    /// Enqueue a message delivered directly to `target`, bypassing edges.
    pub fn send_message_to(
        &self,
        payload: Value,
        type_id: TypeId,
        target: impl Into<ExecutorId>,
    ) -> Result<(), ContextError> {
        self.send_inner(payload, type_id, Some(target.into()))
    }

    fn send_inner(
        &self,
        payload: Value,
        type_id: TypeId,
        target: Option<ExecutorId>,
    ) -> Result<(), ContextError> {
        if !self.protocol.allows_send(&type_id) {
            return Err(ContextError::SendViolation {
                executor: self.executor_id.clone(),
                type_id,
            });
        }
        self.push(OutboxEntry::Send {
            payload,
            type_id,
            target,
            emit_index: self.next_emit_index(),
        })
    }

    /// Emit a workflow-visible output value.
    pub fn yield_output(&self, payload: Value, type_id: TypeId) -> Result<(), ContextError> {
        if !self.protocol.allows_yield(&type_id) {
            return Err(ContextError::YieldViolation {
                executor: self.executor_id.clone(),
                type_id,
            });
        }
        self.push(OutboxEntry::Yield {
            payload,
            type_id,
            emit_index: self.next_emit_index(),
        })
    }

    /// Add a custom domain event to the run's stream.
    pub fn add_event(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ContextError> {
        self.push(OutboxEntry::Event(Event::diagnostic(scope, message)))
    }

    /// Read a value from the scoped state bag.
    #[must_use]
    pub fn get_state(&self, scope: StateScope, key: &str) -> Option<Value> {
        self.state.get(scope, Some(&self.executor_id), key)
    }

    /// Write a value into the scoped state bag.
    pub fn set_state(&self, scope: StateScope, key: impl Into<String>, value: Value) {
        self.state.set(scope, Some(&self.executor_id), key, value);
    }

    /// Send a request through an external port and suspend until the
    /// matching response arrives.
    ///
    /// Only the calling handler suspends; the rest of the step proceeds and
    /// the step completes without it. The response payload is returned when
    /// [`send_response`](crate::runtime::Run::send_response) delivers it;
    /// sends and yields issued after resumption belong to the step in which
    /// the response was applied.
    pub async fn request_external(
        &self,
        port: &PortId,
        payload: Value,
        type_id: TypeId,
    ) -> Result<Value, ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        if !self.ports.contains(port) {
            return Err(ContextError::UnknownPort { port: port.clone() });
        }

        let request_id = RequestId::generate();
        let info = ExternalRequest {
            request_id: request_id.clone(),
            port_id: port.clone(),
            payload,
            type_id,
            origin: self.executor_id.clone(),
            step: self.step,
        };

        let (tx, rx) = oneshot::channel();
        self.gate.lock().register(info.clone(), tx);

        // Emitted synchronously with the suspension point so consumers can
        // answer while the run is parked.
        self.emitter
            .emit(Event::request(info))
            .map_err(|_| ContextError::EventBusUnavailable)?;

        self.suspension
            .send(SuspensionNotice {
                invocation: self.invocation,
                request_id,
            })
            .map_err(|_| ContextError::Closed)?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(GateError::Cancelled)) | Err(_) => Err(ContextError::Cancelled),
            Ok(Err(_)) => Err(ContextError::Closed),
        }
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("executor_id", &self.executor_id)
            .field("step", &self.step)
            .field("run_id", &self.run_id)
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}
