//! Subworkflow host: a whole workflow embedded as an executor.
//!
//! The host owns the inner workflow through an [`OwnershipToken`] (a second
//! host is refused) and drives exactly one inner superstep per outer step:
//! after each inner step that leaves work pending, the host enqueues a
//! control tick to itself, so the outer step boundary becomes the inner
//! scheduler's cadence. Inner outputs surface as outer yields or sends per
//! host configuration, and the complete inner run state serializes as the
//! host's executor state.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::context::WorkflowContext;
use crate::envelope::Envelope;
use crate::event_bus::{CollectingEmitter, Event};
use crate::executor::{Executor, ExecutorError, Protocol};
use crate::graph::{OwnershipToken, Workflow, SUBWORKFLOW_TICK_TYPE};
use crate::router::{CallResult, MessageRouter};
use crate::scheduler::SchedulerCore;
use crate::types::{ExecutorId, TypeId};

/// How inner workflow outputs surface on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnerOutputs {
    /// Inner yields become outer workflow outputs. The default.
    Yields,
    /// Inner yields are sent along the host's outgoing edges.
    Sends,
}

/// Registration payload for a subworkflow host.
#[derive(Clone)]
pub struct SubworkflowRegistration {
    token: Arc<OwnershipToken>,
    outputs_as: InnerOutputs,
}

impl SubworkflowRegistration {
    /// Embed the workflow behind `token`; claim the token via
    /// [`Workflow::claim_ownership`].
    #[must_use]
    pub fn new(token: OwnershipToken) -> Self {
        Self {
            token: Arc::new(token),
            outputs_as: InnerOutputs::Yields,
        }
    }

    /// Route inner outputs along the host's outgoing edges instead of
    /// yielding them.
    #[must_use]
    pub fn outputs_as_sends(mut self) -> Self {
        self.outputs_as = InnerOutputs::Sends;
        self
    }

    pub(crate) fn workflow(&self) -> Arc<Workflow> {
        self.token.workflow()
    }
}

/// Executor implementation hosting an embedded workflow.
pub struct SubworkflowHost {
    id: ExecutorId,
    protocol: Protocol,
    router: MessageRouter,
    inner: tokio::sync::Mutex<SchedulerCore>,
    collector: CollectingEmitter,
    spec: SubworkflowRegistration,
    inner_run_id: String,
}

impl SubworkflowHost {
    pub(crate) fn new(id: ExecutorId, spec: SubworkflowRegistration, parent_run: &str) -> Self {
        let collector = CollectingEmitter::new();
        let inner_run_id = format!("{parent_run}/{id}");
        let inner = SchedulerCore::new(
            spec.workflow(),
            inner_run_id.clone(),
            Arc::new(collector.clone()),
        );
        let router = MessageRouter::new(spec.workflow().registry());
        Self {
            id,
            // The host forwards whatever the inner start executor accepts,
            // plus its own control tick; gating happens inside.
            protocol: Protocol::new().accept_all(),
            router,
            inner: tokio::sync::Mutex::new(inner),
            collector,
            spec,
            inner_run_id,
        }
    }

    fn fresh_core(&self) -> SchedulerCore {
        SchedulerCore::new(
            self.spec.workflow(),
            self.inner_run_id.clone(),
            Arc::new(self.collector.clone()),
        )
    }

    /// Translate one inner step's collected events into outer effects.
    fn forward_events(&self, ctx: &WorkflowContext) -> Result<(), ExecutorError> {
        for event in self.collector.drain() {
            match event {
                Event::Output(out) => match self.spec.outputs_as {
                    InnerOutputs::Yields => ctx.yield_output(out.payload, out.type_id)?,
                    InnerOutputs::Sends => ctx.send_message(out.payload, out.type_id)?,
                },
                Event::RunError(err) => {
                    return Err(ExecutorError::msg(format!(
                        "embedded workflow failed: {}",
                        err.message
                    )));
                }
                // Inner lifecycle and step events stay internal to the host.
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for SubworkflowHost {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn router(&self) -> &MessageRouter {
        &self.router
    }

    async fn handle(&self, envelope: &Envelope, ctx: &WorkflowContext) -> CallResult {
        let mut inner = self.inner.lock().await;

        if envelope.type_id.as_str() != SUBWORKFLOW_TICK_TYPE {
            inner.inject(envelope.payload.clone(), envelope.type_id.clone());
        }

        let outcome = match inner.step_once(None).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return CallResult::Failed(ExecutorError::msg(format!(
                    "embedded workflow step failed: {err}"
                )))
            }
        };

        if let Err(err) = self.forward_events(ctx) {
            return CallResult::Failed(err);
        }
        if outcome.failed {
            return CallResult::Failed(ExecutorError::msg(
                "embedded workflow terminated with an executor failure",
            ));
        }

        // Keep the outer scheduler ticking while inner work remains; the
        // next outer step drives the next inner step.
        if !inner.is_quiescent() {
            if let Err(err) = ctx.send_message_to(
                Value::Null,
                TypeId::of(SUBWORKFLOW_TICK_TYPE),
                self.id.clone(),
            ) {
                return CallResult::Failed(err.into());
            }
        }
        CallResult::Done
    }

    async fn on_checkpointing(&self, _ctx: &WorkflowContext) -> Result<Value, ExecutorError> {
        let mut inner = self.inner.lock().await;
        let state = inner.capture_run_state().await?;
        serde_json::to_value(state).map_err(ExecutorError::from)
    }

    async fn on_restored(&self, state: Value, _ctx: &WorkflowContext) -> Result<(), ExecutorError> {
        if state.is_null() {
            return Ok(());
        }
        let persisted = serde_json::from_value(state)?;
        let mut inner = self.inner.lock().await;
        *inner = self.fresh_core();
        inner
            .restore_run_state(persisted)
            .await
            .map_err(|err| ExecutorError::msg(err.to_string()))
    }

    async fn reset(&self) -> Result<(), ExecutorError> {
        let mut inner = self.inner.lock().await;
        let _ = self.collector.drain();
        *inner = self.fresh_core();
        Ok(())
    }
}
