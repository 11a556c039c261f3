//! Off-thread execution: a background task drives the run while the caller
//! consumes the event stream and feeds control messages in.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointManager;
use crate::event_bus::{Event, EventEmitter, EventStream, STREAM_END_SCOPE};
use crate::gate::ExternalResponse;
use crate::scheduler::SchedulerCore;
use crate::types::{RunPhase, TypeId};

use super::RunError;

/// Control messages applied between supersteps, in arrival order.
pub(crate) enum ControlMsg {
    Message { payload: Value, type_id: TypeId },
    Response(ExternalResponse),
    Cancel,
}

/// Final summary of a streaming run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub session_id: String,
    pub phase: RunPhase,
    pub steps: u64,
    pub outputs: Vec<Value>,
}

/// Handle on a run executing on a background task.
///
/// Events stream out as steps complete; responses, injected messages, and
/// cancellation go in through the control channel and are applied at step
/// boundaries.
pub struct StreamingRun {
    session_id: String,
    control: flume::Sender<ControlMsg>,
    events: Option<EventStream>,
    handle: JoinHandle<Result<RunReport, RunError>>,
}

impl StreamingRun {
    pub(crate) fn new(
        session_id: String,
        control: flume::Sender<ControlMsg>,
        events: EventStream,
        handle: JoinHandle<Result<RunReport, RunError>>,
    ) -> Self {
        Self {
            session_id,
            control,
            events: Some(events),
            handle,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Take the event stream. May be taken once.
    pub fn events(&mut self) -> EventStream {
        self.events
            .take()
            .expect("event stream already requested for this run")
    }

    /// Inject a new input message; applied when the run is quiescent.
    pub fn send_message(&self, payload: Value, type_id: TypeId) -> Result<(), RunError> {
        self.control
            .send(ControlMsg::Message { payload, type_id })
            .map_err(|_| RunError::StreamClosed)
    }

    /// Satisfy an outstanding external request. Non-blocking; wakes at most
    /// one suspended handler.
    pub fn send_response(&self, response: ExternalResponse) -> Result<(), RunError> {
        self.control
            .send(ControlMsg::Response(response))
            .map_err(|_| RunError::StreamClosed)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) -> Result<(), RunError> {
        self.control
            .send(ControlMsg::Cancel)
            .map_err(|_| RunError::StreamClosed)
    }

    /// Wait for the background task and return the final report.
    pub async fn join(self) -> Result<RunReport, RunError> {
        self.handle.await?
    }
}

/// The background drive loop.
pub(crate) async fn drive_streaming(
    mut core: SchedulerCore,
    manager: Option<CheckpointManager>,
    autosave: bool,
    control: flume::Receiver<ControlMsg>,
    emitter: Arc<dyn EventEmitter>,
    session_id: String,
) -> Result<RunReport, RunError> {
    loop {
        // Responses are applied in arrival order, between steps.
        while let Ok(msg) = control.try_recv() {
            apply_control(&mut core, msg, &emitter);
        }

        if core.cancel_requested() {
            core.drain_cancelled().await;
            break;
        }

        if core.has_work() {
            let step_manager = if autosave { manager.as_ref() } else { None };
            let outcome = core.step_once(step_manager).await?;
            if outcome.cancelled || outcome.failed || outcome.terminal {
                break;
            }
            continue;
        }

        match core.phase() {
            RunPhase::AwaitingResponse | RunPhase::Idle | RunPhase::Terminal => {
                // Parked: wait for a response, an injection, or cancellation.
                // Terminal runs stay addressable until the handle is dropped.
                match control.recv_async().await {
                    Ok(msg) => apply_control(&mut core, msg, &emitter),
                    Err(_) => break,
                }
            }
            _ => break,
        }
    }

    core.release_instances().await;

    let phase = core.phase();
    let message = format!("session={session_id} status={phase} step={}", core.step_number());
    if let Err(err) = emitter.emit(Event::diagnostic(STREAM_END_SCOPE, message)) {
        tracing::debug!(
            target: "relaygraph::runtime",
            session = %session_id,
            error = %err,
            "failed to emit stream termination event"
        );
    }

    Ok(RunReport {
        session_id,
        phase,
        steps: core.step_number(),
        outputs: core.outputs().to_vec(),
    })
}

fn apply_control(core: &mut SchedulerCore, msg: ControlMsg, emitter: &Arc<dyn EventEmitter>) {
    match msg {
        ControlMsg::Message { payload, type_id } => match core.phase() {
            RunPhase::Idle | RunPhase::Terminal => core.inject(payload, type_id),
            phase => {
                let _ = emitter.emit(Event::diagnostic(
                    "runtime",
                    format!("message injection ignored in phase {phase}"),
                ));
            }
        },
        ControlMsg::Response(response) => {
            if let Err(err) = core.apply_response(response) {
                // Correlation failures are reported and ignored.
                let _ = emitter.emit(Event::diagnostic("gate", err.to_string()));
            }
        }
        ControlMsg::Cancel => core.cancel(),
    }
}
