//! Superstep scheduler: intake, grouping, dispatch, collection, expansion.
//!
//! Each superstep is a deterministic function of its inputs. Deliveries
//! produced in step `N` are never visible before step `N+1`; invocations for
//! distinct executors run in parallel while invocations for the same
//! executor are serialized; events are buffered per invocation and flushed
//! in delivery order at the barrier, so two runs of the same workflow over
//! the same input produce the same event sequence modulo timestamps.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::context::{
    cancel_pair, CancelToken, OutboxEntry, StateBag, SuspensionNotice, WorkflowContext,
};
use crate::envelope::{Delivery, Envelope};
use crate::event_bus::{Event, EventEmitter};
use crate::executor::{Executor, ExecutorError, ExecutorOptions, RegistrationKind};
use crate::gate::{ExternalResponse, Gate, GateError, PortExecutor, ResponseDisposition, SharedGate};
use crate::graph::{Edge, FanOutMode, Workflow};
use crate::registry::RegistryError;
use crate::router::{CallResult, RouterError};
use crate::types::{ExecutorId, RequestId, RunPhase, TypeId};

mod persist;

pub use persist::{PersistedRunState, PersistedStateEntry, RestoreError};

/// Declared type of fan-in aggregates: a JSON array of the contributions in
/// source-declaration order.
pub const FAN_IN_AGGREGATE_TYPE: &str = "relaygraph.fanin.aggregate";

/// Source id stamped on envelopes injected from outside the graph.
pub const INPUT_SOURCE: &str = "__input__";

/// Infrastructure failures inside the scheduler. Handler failures are not
/// errors here; they are reified as events and reflected in the outcome.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("delivery targets unknown executor `{id}`")]
    #[diagnostic(code(relaygraph::scheduler::unknown_executor))]
    UnknownExecutor { id: ExecutorId },

    #[error("failed to instantiate executor `{id}`")]
    #[diagnostic(code(relaygraph::scheduler::instantiate))]
    Instantiate {
        id: ExecutorId,
        #[source]
        source: ExecutorError,
    },

    #[error("failed to build port executor `{id}`")]
    #[diagnostic(code(relaygraph::scheduler::port))]
    Port {
        id: ExecutorId,
        #[source]
        source: RouterError,
    },

    #[error("step task join error: {0}")]
    #[diagnostic(code(relaygraph::scheduler::join))]
    Join(#[from] JoinError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),
}

/// Completion info for one superstep.
#[derive(Debug)]
pub struct StepOutcome {
    pub step: u64,
    /// Executors that ran at least one fresh invocation, in delivery order.
    pub ran: Vec<ExecutorId>,
    /// Whether any output was yielded.
    pub yielded: bool,
    /// Whether any external request is outstanding after the step.
    pub requests_pending: bool,
    /// Whether the run reached quiescence.
    pub terminal: bool,
    /// Whether a handler failed; the run phase is `Error` afterwards.
    pub failed: bool,
    /// Whether the step was drained due to cancellation.
    pub cancelled: bool,
    /// Checkpoint captured at this boundary, when a manager was supplied.
    pub checkpoint: Option<crate::checkpoint::CheckpointInfo>,
    /// Checkpoint I/O failure, surfaced without stopping the run.
    pub checkpoint_error: Option<crate::checkpoint::CheckpointError>,
}

struct ParkedInvocation {
    executor_id: ExecutorId,
    handle: JoinHandle<CallResult>,
    entries_rx: flume::Receiver<OutboxEntry>,
    suspension_rx: flume::Receiver<SuspensionNotice>,
}

enum InvocationStatus {
    Finished(CallResult),
    Suspended {
        request_id: RequestId,
        handle: JoinHandle<CallResult>,
        suspension_rx: flume::Receiver<SuspensionNotice>,
    },
}

struct InvocationOutcome {
    seq: u64,
    executor_id: ExecutorId,
    /// Declared type of the triggering delivery; `None` for resumed
    /// invocations, which already emitted their invoked event.
    invoked: Option<TypeId>,
    status: InvocationStatus,
    entries_rx: flume::Receiver<OutboxEntry>,
}

/// Execution state of one run, driven a superstep at a time.
///
/// The core is mode-agnostic: the runtime drives it to completion (batch),
/// from a background task (streaming), or one step per outer step when
/// embedded under a subworkflow host.
pub struct SchedulerCore {
    pub(crate) workflow: Arc<Workflow>,
    pub(crate) run_id: String,
    step: u64,
    pending: Vec<Delivery>,
    instances: FxHashMap<ExecutorId, Arc<dyn Executor>>,
    initialized: FxHashSet<ExecutorId>,
    pub(crate) state: StateBag,
    gate: SharedGate,
    emitter: Arc<dyn EventEmitter>,
    cancel_tx: watch::Sender<bool>,
    cancel: CancelToken,
    phase: RunPhase,
    parked: FxHashMap<RequestId, ParkedInvocation>,
    resumed: Vec<(ExecutorId, ParkedInvocation)>,
    invocations: u64,
    permits: Arc<Semaphore>,
    run_outputs: Vec<Value>,
}

impl SchedulerCore {
    pub fn new(workflow: Arc<Workflow>, run_id: String, emitter: Arc<dyn EventEmitter>) -> Self {
        let limit = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_concurrency(workflow, run_id, emitter, limit)
    }

    pub fn with_concurrency(
        workflow: Arc<Workflow>,
        run_id: String,
        emitter: Arc<dyn EventEmitter>,
        concurrency: usize,
    ) -> Self {
        let (cancel_tx, cancel) = cancel_pair();
        Self {
            workflow,
            run_id,
            step: 0,
            pending: Vec::new(),
            instances: FxHashMap::default(),
            initialized: FxHashSet::default(),
            state: StateBag::new(),
            gate: Gate::new_shared(),
            emitter,
            cancel_tx,
            cancel,
            phase: RunPhase::Idle,
            parked: FxHashMap::default(),
            resumed: Vec::new(),
            invocations: 0,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            run_outputs: Vec::new(),
        }
    }

    /// Whether cooperative cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Payloads yielded so far, in emission order.
    pub fn outputs(&self) -> &[Value] {
        &self.run_outputs
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    pub fn step_number(&self) -> u64 {
        self.step
    }

    pub(crate) fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<Delivery> {
        self.pending.clone()
    }

    pub(crate) fn set_pending(&mut self, pending: Vec<Delivery>) {
        self.pending = pending;
    }

    pub(crate) fn outstanding_snapshot(&self) -> Vec<crate::gate::ExternalRequest> {
        self.gate.lock().outstanding()
    }

    pub(crate) fn mark_initialized(&mut self, id: &ExecutorId) {
        self.initialized.insert(id.clone());
    }

    pub(crate) fn reinstall_requests(&mut self, requests: Vec<crate::gate::ExternalRequest>) {
        let mut gate = self.gate.lock();
        for request in requests {
            gate.register_restored(request);
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.pending.is_empty()
            && self.parked.is_empty()
            && self.resumed.is_empty()
            && self.gate.lock().is_empty()
    }

    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.resumed.is_empty()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.gate.lock().len()
    }

    /// Inject an input message as a delivery to the start executor.
    pub fn inject(&mut self, payload: Value, type_id: TypeId) {
        let envelope = Envelope::new(
            payload,
            type_id,
            ExecutorId::from(INPUT_SOURCE),
            self.step,
            0,
        );
        self.pending
            .push(Delivery::new(envelope, self.workflow.start().clone()));
        if self.phase == RunPhase::Terminal || self.phase == RunPhase::Idle {
            self.phase = RunPhase::Running;
        }
    }

    /// Apply an external response between steps.
    ///
    /// A live suspended handler is woken in place; a request restored from a
    /// checkpoint is re-entered through the origin executor's router as a
    /// delivery of the response payload.
    pub fn apply_response(&mut self, response: ExternalResponse) -> Result<(), GateError> {
        if self.phase.is_ended() {
            return Err(GateError::RunEnded {
                request_id: response.request_id,
            });
        }
        let disposition = self.gate.lock().apply(response)?;
        match disposition {
            ResponseDisposition::Woken { request } => {
                if let Some(parked) = self.parked.remove(&request.request_id) {
                    self.resumed.push((request.origin, parked));
                } else {
                    tracing::debug!(
                        target: "relaygraph::scheduler",
                        request_id = %request.request_id,
                        "woken request had no parked invocation"
                    );
                }
            }
            ResponseDisposition::Reenter {
                request,
                payload,
                type_id,
            } => {
                let envelope = Envelope::new(
                    payload,
                    type_id,
                    request.origin.clone(),
                    self.step,
                    0,
                );
                self.pending.push(Delivery::new(envelope, request.origin));
            }
        }
        if self.phase == RunPhase::AwaitingResponse {
            self.phase = RunPhase::Running;
        }
        Ok(())
    }

    /// Request cooperative cancellation: set the run-wide flag and wake every
    /// handler suspended on an external request.
    pub fn cancel(&mut self) {
        let _ = self.cancel_tx.send(true);
        self.gate.lock().cancel_all();
    }

    /// Finish cancellation: let parked invocations observe the signal, then
    /// discard all remaining work and mark the run cancelled.
    pub async fn drain_cancelled(&mut self) {
        // Handlers that suspended after the cancel signal still need waking.
        self.gate.lock().cancel_all();
        for (_, parked) in self.parked.drain() {
            let _ = parked.handle.await;
        }
        for (_, parked) in self.resumed.drain(..) {
            let _ = parked.handle.await;
        }
        self.pending.clear();
        self.emit(Event::cancelled(self.step));
        self.phase = RunPhase::Cancelled;
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.emitter.emit(event) {
            tracing::debug!(
                target: "relaygraph::scheduler",
                error = %err,
                "event emission failed"
            );
        }
    }

    fn next_invocation(&mut self) -> u64 {
        self.invocations += 1;
        self.invocations
    }

    fn make_context(
        &self,
        executor_id: ExecutorId,
        invocation: u64,
        protocol: Arc<crate::executor::Protocol>,
        outbox: flume::Sender<OutboxEntry>,
        suspension: flume::Sender<SuspensionNotice>,
        trace: Option<String>,
    ) -> WorkflowContext {
        WorkflowContext {
            executor_id,
            step: self.step,
            run_id: self.run_id.clone(),
            invocation,
            protocol,
            outbox,
            emitter: Arc::clone(&self.emitter),
            state: self.state.clone(),
            gate: Arc::clone(&self.gate),
            ports: Arc::clone(&self.workflow.ports),
            suspension,
            cancel: self.cancel.clone(),
            trace,
            emit_seq: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Context for lifecycle hooks (initialize at restore, checkpoint hooks).
    /// Entries deposited by hooks are intentionally dropped.
    pub(crate) fn hook_context(&mut self, executor_id: &ExecutorId) -> WorkflowContext {
        let invocation = self.next_invocation();
        let (outbox_tx, _outbox_rx) = flume::unbounded();
        let (susp_tx, _susp_rx) = flume::unbounded();
        self.make_context(
            executor_id.clone(),
            invocation,
            Arc::new(crate::executor::Protocol::new()),
            outbox_tx,
            susp_tx,
            None,
        )
    }

    /// Resolve (and lazily construct) the per-run instance for `id`.
    pub(crate) async fn instance(
        &mut self,
        id: &ExecutorId,
    ) -> Result<Arc<dyn Executor>, SchedulerError> {
        if let Some(existing) = self.instances.get(id) {
            return Ok(Arc::clone(existing));
        }
        let registration = self
            .workflow
            .registration(id)
            .ok_or_else(|| SchedulerError::UnknownExecutor { id: id.clone() })?
            .clone();
        let executor: Arc<dyn Executor> = match &registration.kind {
            RegistrationKind::Instance(executor) => Arc::clone(executor),
            RegistrationKind::Factory(factory) => {
                if registration.options.concurrent_shareable {
                    let mut shared = self.workflow.shared_instances.lock().await;
                    match shared.get(id) {
                        Some(existing) => Arc::clone(existing),
                        None => {
                            let created = factory.create(&self.run_id).await.map_err(|source| {
                                SchedulerError::Instantiate {
                                    id: id.clone(),
                                    source,
                                }
                            })?;
                            shared.insert(id.clone(), Arc::clone(&created));
                            created
                        }
                    }
                } else if let Some(pooled) = registration
                    .options
                    .resettable
                    .then(|| self.workflow.pool_take(id))
                    .flatten()
                {
                    pooled
                } else {
                    factory.create(&self.run_id).await.map_err(|source| {
                        SchedulerError::Instantiate {
                            id: id.clone(),
                            source,
                        }
                    })?
                }
            }
            RegistrationKind::Port(spec) => Arc::new(
                PortExecutor::new(id.clone(), spec, self.workflow.registry()).map_err(
                    |source| SchedulerError::Port {
                        id: id.clone(),
                        source,
                    },
                )?,
            ),
            RegistrationKind::Subworkflow(spec) => Arc::new(
                crate::subworkflow::SubworkflowHost::new(id.clone(), spec.clone(), &self.run_id),
            ),
            RegistrationKind::Placeholder => {
                return Err(SchedulerError::UnknownExecutor { id: id.clone() })
            }
        };
        self.instances.insert(id.clone(), Arc::clone(&executor));
        Ok(executor)
    }

    pub(crate) fn instantiated(&self) -> Vec<(ExecutorId, Arc<dyn Executor>)> {
        let mut all: Vec<(ExecutorId, Arc<dyn Executor>)> = self
            .instances
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();
        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }

    /// Hand per-run instances back to the workflow's shared-resource policy.
    pub(crate) async fn release_instances(&mut self) {
        let instances = std::mem::take(&mut self.instances);
        crate::runtime::shared::release_run_instances(&self.workflow, instances).await;
        self.initialized.clear();
    }

    /// Execute exactly one superstep.
    ///
    /// When a checkpoint manager is supplied, a checkpoint is captured at
    /// the end-of-step boundary and referenced by the step event.
    pub async fn step_once(
        &mut self,
        checkpoints: Option<&crate::checkpoint::CheckpointManager>,
    ) -> Result<StepOutcome, SchedulerError> {
        let step = self.step;
        let deliveries = std::mem::take(&mut self.pending);
        let resumed = std::mem::take(&mut self.resumed);
        self.phase = RunPhase::Running;

        // Per-executor serialization: at most one live invocation per
        // executor within a step. One resumed invocation per executor runs
        // now; further resumptions of the same executor wait for the next
        // step.
        let mut resumed_now: Vec<(ExecutorId, ParkedInvocation)> =
            Vec::with_capacity(resumed.len());
        let mut resumed_ids: FxHashSet<ExecutorId> = FxHashSet::default();
        for (executor_id, parked) in resumed {
            if resumed_ids.insert(executor_id.clone()) {
                resumed_now.push((executor_id, parked));
            } else {
                self.resumed.push((executor_id, parked));
            }
        }

        // Intake: group deliveries by target, preserving first-occurrence
        // target order; within a group, (source, emit_index) lexicographic.
        let mut group_order: Vec<ExecutorId> = Vec::new();
        let mut groups: FxHashMap<ExecutorId, Vec<Envelope>> = FxHashMap::default();
        for delivery in deliveries {
            if !groups.contains_key(&delivery.target) {
                group_order.push(delivery.target.clone());
            }
            groups
                .entry(delivery.target.clone())
                .or_default()
                .push(delivery.envelope);
        }
        for envelopes in groups.values_mut() {
            envelopes.sort_by(|a, b| {
                (&a.source, a.emit_index).cmp(&(&b.source, b.emit_index))
            });
        }

        // Dispatch: one task per target executor; resumed invocations are
        // awaited alongside. Sequence numbers fix the flush order: resumed
        // first (application order), then fresh in delivery order.
        let mut join_set: JoinSet<Result<Vec<InvocationOutcome>, SchedulerError>> = JoinSet::new();
        let mut seq: u64 = 0;

        for (executor_id, parked) in resumed_now {
            let outcome_seq = seq;
            seq += 1;
            join_set.spawn(async move {
                Ok(vec![await_invocation(outcome_seq, executor_id, None, parked).await])
            });
        }

        let mut ran: Vec<ExecutorId> = Vec::new();
        let mut deferred: Vec<Delivery> = Vec::new();
        for target in group_order {
            let envelopes = groups.remove(&target).unwrap_or_default();
            if envelopes.is_empty() {
                continue;
            }
            // The executor's mailbox is busy with a resumed invocation this
            // step; its fresh deliveries move to the next step unchanged.
            if resumed_ids.contains(&target) {
                deferred.extend(
                    envelopes
                        .into_iter()
                        .map(|envelope| Delivery::new(envelope, target.clone())),
                );
                continue;
            }
            ran.push(target.clone());
            let executor = self.instance(&target).await?;
            let needs_init = self.initialized.insert(target.clone());
            let options = self
                .workflow
                .registration(&target)
                .map(|r| r.options)
                .unwrap_or_default();
            let protocol = Arc::new(executor.protocol().clone());

            let mut batch = Vec::with_capacity(envelopes.len());
            for envelope in envelopes {
                let invocation = self.next_invocation();
                let (outbox_tx, outbox_rx) = flume::unbounded();
                let (susp_tx, susp_rx) = flume::unbounded();
                let ctx = self.make_context(
                    target.clone(),
                    invocation,
                    Arc::clone(&protocol),
                    outbox_tx,
                    susp_tx,
                    envelope.trace.clone(),
                );
                batch.push((seq, envelope, ctx, outbox_rx, susp_rx));
                seq += 1;
            }

            let permits = Arc::clone(&self.permits);
            let executor_id = target.clone();
            join_set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("scheduler semaphore closed");
                Ok(run_target(executor, executor_id, needs_init, options, batch).await)
            });
        }

        // Barrier: every invocation of the step has completed or suspended.
        let mut outcomes: Vec<InvocationOutcome> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            outcomes.extend(joined??);
        }
        outcomes.sort_by_key(|o| o.seq);

        if self.cancel.is_cancelled() {
            // Drain phase: tasks finished above; discard their outputs.
            self.drain_cancelled().await;
            return Ok(StepOutcome {
                step,
                ran,
                yielded: false,
                requests_pending: false,
                terminal: true,
                failed: false,
                cancelled: true,
                checkpoint: None,
                checkpoint_error: None,
            });
        }

        // Flush: events in production order, sends into the expansion buffer.
        let mut sends: Vec<(ExecutorId, Value, TypeId, Option<ExecutorId>, u32)> = Vec::new();
        let mut yielded = false;
        let mut failed = false;
        for outcome in outcomes {
            let is_routing_miss =
                matches!(outcome.status, InvocationStatus::Finished(CallResult::NotFound));
            if is_routing_miss {
                self.emit(Event::run_error(
                    Some(step),
                    format!(
                        "no handler on executor `{}` accepted the delivery",
                        outcome.executor_id
                    ),
                ));
                continue;
            }
            if let Some(type_id) = &outcome.invoked {
                self.emit(Event::executor_invoked(
                    outcome.executor_id.clone(),
                    step,
                    type_id.clone(),
                ));
            }
            for entry in outcome.entries_rx.try_iter() {
                match entry {
                    OutboxEntry::Event(event) => self.emit(event),
                    OutboxEntry::Yield {
                        payload,
                        type_id,
                        ..
                    } => {
                        yielded = true;
                        self.run_outputs.push(payload.clone());
                        self.emit(Event::output(
                            outcome.executor_id.clone(),
                            step,
                            type_id,
                            payload,
                        ));
                    }
                    OutboxEntry::Send {
                        payload,
                        type_id,
                        target,
                        emit_index,
                    } => sends.push((
                        outcome.executor_id.clone(),
                        payload,
                        type_id,
                        target,
                        emit_index,
                    )),
                }
            }
            match outcome.status {
                InvocationStatus::Finished(CallResult::Failed(err)) => {
                    failed = true;
                    self.emit(Event::executor_failed(
                        outcome.executor_id.clone(),
                        step,
                        err.to_string(),
                    ));
                }
                InvocationStatus::Finished(_) => {
                    self.emit(Event::executor_completed(outcome.executor_id.clone(), step));
                }
                InvocationStatus::Suspended {
                    request_id,
                    handle,
                    suspension_rx,
                } => {
                    self.parked.insert(
                        request_id,
                        ParkedInvocation {
                            executor_id: outcome.executor_id.clone(),
                            handle,
                            entries_rx: outcome.entries_rx.clone(),
                            suspension_rx,
                        },
                    );
                }
            }
        }

        // Edge expansion into deliveries for step N+1. Deliveries deferred
        // by the mailbox guard go first: they were produced earlier.
        let expanded = self.expand(step, sends);
        deferred.extend(expanded);
        self.pending = deferred;

        let requests_pending = !self.gate.lock().is_empty();
        let terminal = self.pending.is_empty()
            && self.parked.is_empty()
            && self.resumed.is_empty()
            && !requests_pending
            && !failed;

        self.step = step + 1;
        self.phase = if failed {
            RunPhase::Error
        } else if terminal {
            RunPhase::Terminal
        } else if self.pending.is_empty() && self.resumed.is_empty() && requests_pending {
            RunPhase::AwaitingResponse
        } else {
            RunPhase::Running
        };

        // End-of-step checkpoint; a checkpoint captured at step N resumes
        // into a run whose next step is N+1, in the phase just computed.
        let mut checkpoint = None;
        let mut checkpoint_error = None;
        if let Some(manager) = checkpoints {
            match manager.capture(self).await {
                Ok(info) => checkpoint = Some(info),
                Err(err) => {
                    tracing::warn!(
                        target: "relaygraph::scheduler",
                        error = %err,
                        "checkpoint capture failed; run continues in memory"
                    );
                    checkpoint_error = Some(err);
                }
            }
        }

        if failed {
            self.emit(Event::run_error(
                Some(step),
                "executor failure terminated the run",
            ));
        }
        self.emit(Event::step_completed(
            step,
            yielded,
            requests_pending,
            terminal,
            checkpoint.as_ref().map(|c| c.checkpoint_id.clone()),
        ));

        Ok(StepOutcome {
            step,
            ran,
            yielded,
            requests_pending,
            terminal,
            failed,
            cancelled: false,
            checkpoint,
            checkpoint_error,
        })
    }

    /// Expand the step's sends through the edge graph.
    fn expand(
        &mut self,
        step: u64,
        sends: Vec<(ExecutorId, Value, TypeId, Option<ExecutorId>, u32)>,
    ) -> Vec<Delivery> {
        let workflow = Arc::clone(&self.workflow);
        let mut next: Vec<Delivery> = Vec::new();
        // Fan-in contributions this step, keyed by edge index.
        let mut fan_ins: FxHashMap<usize, Vec<Option<Value>>> = FxHashMap::default();

        for (source, payload, type_id, explicit_target, emit_index) in sends {
            let envelope = Envelope::new(payload, type_id, source.clone(), step, emit_index);

            if let Some(target) = explicit_target {
                if workflow.registration(&target).is_none() {
                    self.emit(Event::run_error(
                        Some(step),
                        format!("send targeted unknown executor `{target}`"),
                    ));
                    continue;
                }
                next.push(Delivery::new(envelope, target));
                continue;
            }

            for &edge_idx in workflow.edge_indices_from(&source) {
                match &workflow.edges()[edge_idx] {
                    Edge::Direct { target, .. } => {
                        next.push(Delivery::new(envelope.clone(), target.clone()));
                    }
                    Edge::Conditional {
                        target, predicate, ..
                    } => {
                        if predicate(&envelope) {
                            next.push(Delivery::new(envelope.clone(), target.clone()));
                        }
                    }
                    Edge::FanOut { targets, mode, .. } => match mode {
                        FanOutMode::All => {
                            if targets.iter().all(|t| t.matches(&envelope)) {
                                for t in targets {
                                    next.push(Delivery::new(envelope.clone(), t.target.clone()));
                                }
                            }
                        }
                        FanOutMode::AnyMatching => {
                            for t in targets.iter().filter(|t| t.matches(&envelope)) {
                                next.push(Delivery::new(envelope.clone(), t.target.clone()));
                            }
                        }
                        FanOutMode::FirstMatching => {
                            if let Some(t) = targets.iter().find(|t| t.matches(&envelope)) {
                                next.push(Delivery::new(envelope.clone(), t.target.clone()));
                            }
                        }
                    },
                    Edge::Switch { cases, default, .. } => {
                        match cases.iter().find(|case| (case.predicate)(&envelope)) {
                            Some(case) => {
                                next.push(Delivery::new(envelope.clone(), case.target.clone()));
                            }
                            None => match default {
                                Some(target) => {
                                    next.push(Delivery::new(envelope.clone(), target.clone()));
                                }
                                None => {
                                    tracing::debug!(
                                        target: "relaygraph::scheduler",
                                        source = %source,
                                        "switch matched no case and has no default; send dropped"
                                    );
                                }
                            },
                        }
                    }
                    Edge::FanIn { .. } => {}
                }
            }

            // Contribute to every fan-in listing this source; first
            // contribution per source wins within a step.
            for &edge_idx in workflow.fan_in_indices() {
                if let Edge::FanIn { sources, .. } = &workflow.edges()[edge_idx] {
                    if let Some(slot) = sources.iter().position(|s| s == &source) {
                        let slots = fan_ins
                            .entry(edge_idx)
                            .or_insert_with(|| vec![None; sources.len()]);
                        if slots[slot].is_some() {
                            tracing::warn!(
                                target: "relaygraph::scheduler",
                                source = %source,
                                "duplicate fan-in contribution dropped"
                            );
                        } else {
                            slots[slot] = Some(envelope.payload.clone());
                        }
                    }
                }
            }
        }

        // Fire fan-ins whose sources all contributed within this step, or
        // whose completion predicate accepts the partial set.
        for &edge_idx in workflow.fan_in_indices() {
            let Some(slots) = fan_ins.remove(&edge_idx) else {
                continue;
            };
            if let Edge::FanIn {
                sources,
                target,
                completion,
            } = &workflow.edges()[edge_idx]
            {
                let complete = slots.iter().all(Option::is_some)
                    || completion.as_ref().map_or(false, |p| p(&slots));
                if !complete {
                    continue;
                }
                let aggregate = Value::Array(
                    slots
                        .into_iter()
                        .map(|v| v.unwrap_or(Value::Null))
                        .collect(),
                );
                let envelope = Envelope::new(
                    aggregate,
                    TypeId::of(FAN_IN_AGGREGATE_TYPE),
                    sources[0].clone(),
                    step,
                    u32::MAX,
                );
                next.push(Delivery::new(envelope, target.clone()));
            }
        }

        next
    }
}

/// Await a resumed invocation: it either finishes or suspends again.
async fn await_invocation(
    seq: u64,
    executor_id: ExecutorId,
    invoked: Option<TypeId>,
    parked: ParkedInvocation,
) -> InvocationOutcome {
    let ParkedInvocation {
        executor_id: parked_id,
        mut handle,
        entries_rx,
        suspension_rx,
    } = parked;
    debug_assert_eq!(parked_id, executor_id);
    let status = tokio::select! {
        joined = &mut handle => InvocationStatus::Finished(join_to_result(joined)),
        notice = suspension_rx.recv_async() => match notice {
            Ok(notice) => InvocationStatus::Suspended {
                request_id: notice.request_id,
                handle,
                suspension_rx,
            },
            Err(_) => InvocationStatus::Finished(join_to_result(handle.await)),
        },
    };
    InvocationOutcome {
        seq,
        executor_id,
        invoked,
        status,
        entries_rx,
    }
}

fn join_to_result(joined: Result<CallResult, JoinError>) -> CallResult {
    joined.unwrap_or_else(|err| {
        CallResult::Failed(ExecutorError::msg(format!("handler task panicked: {err}")))
    })
}

/// Process one target's deliveries sequentially; each invocation runs as its
/// own task so a suspension parks the invocation without blocking the rest
/// of the batch.
async fn run_target(
    executor: Arc<dyn Executor>,
    executor_id: ExecutorId,
    needs_init: bool,
    options: ExecutorOptions,
    batch: Vec<(
        u64,
        Envelope,
        WorkflowContext,
        flume::Receiver<OutboxEntry>,
        flume::Receiver<SuspensionNotice>,
    )>,
) -> Vec<InvocationOutcome> {
    let mut outcomes = Vec::with_capacity(batch.len());
    let mut init_failed: Option<String> = None;
    let mut first = true;

    for (seq, envelope, ctx, entries_rx, suspension_rx) in batch {
        let input_type = envelope.type_id.clone();

        if let Some(reason) = &init_failed {
            outcomes.push(InvocationOutcome {
                seq,
                executor_id: executor_id.clone(),
                invoked: Some(input_type),
                status: InvocationStatus::Finished(CallResult::Failed(ExecutorError::msg(
                    reason.clone(),
                ))),
                entries_rx,
            });
            continue;
        }

        let accepted = executor.router().handles(&envelope.type_id)
            || executor.protocol().accepts_all;
        if !accepted {
            outcomes.push(InvocationOutcome {
                seq,
                executor_id: executor_id.clone(),
                invoked: Some(input_type),
                status: InvocationStatus::Finished(CallResult::NotFound),
                entries_rx,
            });
            continue;
        }

        if needs_init && first {
            if let Err(err) = executor.initialize(&ctx).await {
                let reason = format!("executor initialization failed: {err}");
                outcomes.push(InvocationOutcome {
                    seq,
                    executor_id: executor_id.clone(),
                    invoked: Some(input_type),
                    status: InvocationStatus::Finished(CallResult::Failed(err)),
                    entries_rx,
                });
                init_failed = Some(reason);
                continue;
            }
        }
        first = false;

        let invocation_executor = Arc::clone(&executor);
        let invocation_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move {
            run_invocation(invocation_executor, envelope, invocation_ctx, options).await
        });

        let status = tokio::select! {
            joined = &mut handle => InvocationStatus::Finished(join_to_result(joined)),
            notice = suspension_rx.recv_async() => match notice {
                Ok(notice) => InvocationStatus::Suspended {
                    request_id: notice.request_id,
                    handle,
                    suspension_rx,
                },
                Err(_) => InvocationStatus::Finished(join_to_result(handle.await)),
            },
        };
        outcomes.push(InvocationOutcome {
            seq,
            executor_id: executor_id.clone(),
            invoked: Some(input_type),
            status,
            entries_rx,
        });
    }
    outcomes
}

/// One handler invocation plus autosend/autoyield post-processing.
async fn run_invocation(
    executor: Arc<dyn Executor>,
    envelope: Envelope,
    ctx: WorkflowContext,
    options: ExecutorOptions,
) -> CallResult {
    let result = executor.handle(&envelope, &ctx).await;
    match result {
        CallResult::Value { value, type_id } => {
            if options.autosend || options.autoyield {
                match &type_id {
                    Some(out_ty) => {
                        if options.autosend {
                            if let Err(err) = ctx.send_message(value.clone(), out_ty.clone()) {
                                return CallResult::Failed(err.into());
                            }
                        }
                        if options.autoyield {
                            if let Err(err) = ctx.yield_output(value.clone(), out_ty.clone()) {
                                return CallResult::Failed(err.into());
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            target: "relaygraph::scheduler",
                            executor = %ctx.executor_id(),
                            "handler returned a value without a declared output type; auto-forwarding skipped"
                        );
                    }
                }
            }
            CallResult::Value { value, type_id }
        }
        other => other,
    }
}
