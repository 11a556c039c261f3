use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::ExternalRequest;
use crate::types::{ExecutorId, TypeId};

/// Scope label used for the diagnostic event that terminates a stream.
pub const STREAM_END_SCOPE: &str = "__relaygraph_stream_end__";

/// Events emitted by a workflow run.
///
/// The scheduler reifies everything observable about a run into this surface:
/// executor lifecycle, yielded outputs, external requests, step boundaries,
/// errors, and cancellation. Diagnostics carry custom events added by
/// handlers as well as runtime bookkeeping such as stream termination.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    Executor(ExecutorEvent),
    Output(OutputEvent),
    Request(RequestEvent),
    Step(StepEvent),
    RunError(RunErrorEvent),
    Cancelled(CancelledEvent),
    Diagnostic(DiagnosticEvent),
}

/// Lifecycle phase of a single handler invocation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExecutorPhase {
    /// The invocation started with a message of the given declared type.
    Invoked { type_id: TypeId },
    /// The invocation finished without error.
    Completed,
    /// The invocation failed; the step continues for other executors.
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorEvent {
    pub executor_id: ExecutorId,
    pub step: u64,
    pub phase: ExecutorPhase,
    pub when: DateTime<Utc>,
}

/// A value yielded as workflow-visible output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEvent {
    pub executor_id: ExecutorId,
    pub step: u64,
    pub type_id: TypeId,
    pub payload: Value,
    pub when: DateTime<Utc>,
}

/// An external request awaiting an out-of-band response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestEvent {
    pub request: ExternalRequest,
    pub when: DateTime<Utc>,
}

/// Superstep boundary marker, emitted exactly once per step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEvent {
    pub step: u64,
    /// Whether any output was yielded during the step.
    pub yielded: bool,
    /// Whether any external request is outstanding after the step.
    pub requests_pending: bool,
    /// Whether the run reached quiescence with this step.
    pub terminal: bool,
    /// Checkpoint captured at this step boundary, if autosave is on.
    pub checkpoint_id: Option<String>,
    pub when: DateTime<Utc>,
}

/// A run-level failure, reified instead of thrown across step boundaries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunErrorEvent {
    pub step: Option<u64>,
    pub message: String,
    pub when: DateTime<Utc>,
}

/// Cooperative cancellation marker; carries no error payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelledEvent {
    pub step: u64,
    pub when: DateTime<Utc>,
}

/// Free-form scoped message, used for handler-added custom events and
/// runtime bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
    pub when: DateTime<Utc>,
}

impl Event {
    pub fn executor_invoked(executor_id: ExecutorId, step: u64, type_id: TypeId) -> Self {
        Event::Executor(ExecutorEvent {
            executor_id,
            step,
            phase: ExecutorPhase::Invoked { type_id },
            when: Utc::now(),
        })
    }

    pub fn executor_completed(executor_id: ExecutorId, step: u64) -> Self {
        Event::Executor(ExecutorEvent {
            executor_id,
            step,
            phase: ExecutorPhase::Completed,
            when: Utc::now(),
        })
    }

    pub fn executor_failed(executor_id: ExecutorId, step: u64, error: impl Into<String>) -> Self {
        Event::Executor(ExecutorEvent {
            executor_id,
            step,
            phase: ExecutorPhase::Failed {
                error: error.into(),
            },
            when: Utc::now(),
        })
    }

    pub fn output(executor_id: ExecutorId, step: u64, type_id: TypeId, payload: Value) -> Self {
        Event::Output(OutputEvent {
            executor_id,
            step,
            type_id,
            payload,
            when: Utc::now(),
        })
    }

    pub fn request(request: ExternalRequest) -> Self {
        Event::Request(RequestEvent {
            request,
            when: Utc::now(),
        })
    }

    pub fn step_completed(
        step: u64,
        yielded: bool,
        requests_pending: bool,
        terminal: bool,
        checkpoint_id: Option<String>,
    ) -> Self {
        Event::Step(StepEvent {
            step,
            yielded,
            requests_pending,
            terminal,
            checkpoint_id,
            when: Utc::now(),
        })
    }

    pub fn run_error(step: Option<u64>, message: impl Into<String>) -> Self {
        Event::RunError(RunErrorEvent {
            step,
            message: message.into(),
            when: Utc::now(),
        })
    }

    pub fn cancelled(step: u64) -> Self {
        Event::Cancelled(CancelledEvent {
            step,
            when: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
            when: Utc::now(),
        })
    }

    /// Stable kind label for filtering and JSON projection.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Executor(e) => match e.phase {
                ExecutorPhase::Invoked { .. } => "executorInvoked",
                ExecutorPhase::Completed => "executorCompleted",
                ExecutorPhase::Failed { .. } => "executorFailed",
            },
            Event::Output(_) => "workflowOutput",
            Event::Request(_) => "requestInfo",
            Event::Step(_) => "superStepCompleted",
            Event::RunError(_) => "workflowError",
            Event::Cancelled(_) => "cancelled",
            Event::Diagnostic(_) => "diagnostic",
        }
    }

    /// The executor this event concerns, when there is one.
    #[must_use]
    pub fn executor_id(&self) -> Option<&ExecutorId> {
        match self {
            Event::Executor(e) => Some(&e.executor_id),
            Event::Output(e) => Some(&e.executor_id),
            Event::Request(e) => Some(&e.request.origin),
            _ => None,
        }
    }

    /// The step this event belongs to, when known.
    #[must_use]
    pub fn step(&self) -> Option<u64> {
        match self {
            Event::Executor(e) => Some(e.step),
            Event::Output(e) => Some(e.step),
            Event::Request(e) => Some(e.request.step),
            Event::Step(e) => Some(e.step),
            Event::RunError(e) => e.step,
            Event::Cancelled(e) => Some(e.step),
            Event::Diagnostic(_) => None,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Executor(e) => e.when,
            Event::Output(e) => e.when,
            Event::Request(e) => e.when,
            Event::Step(e) => e.when,
            Event::RunError(e) => e.when,
            Event::Cancelled(e) => e.when,
            Event::Diagnostic(e) => e.when,
        }
    }

    /// Convert the event to a normalized JSON object.
    ///
    /// The schema is stable across kinds:
    /// ```json
    /// {
    ///   "kind": "workflowOutput",
    ///   "timestamp": "2026-08-01T12:34:56.789Z",
    ///   "executorId": "echo",
    ///   "data": { /* kind-specific fields */ }
    /// }
    /// ```
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;

        let data = match self {
            Event::Executor(e) => match &e.phase {
                ExecutorPhase::Invoked { type_id } => {
                    json!({ "step": e.step, "typeId": type_id })
                }
                ExecutorPhase::Completed => json!({ "step": e.step }),
                ExecutorPhase::Failed { error } => json!({ "step": e.step, "error": error }),
            },
            Event::Output(e) => json!({
                "step": e.step,
                "typeId": e.type_id,
                "payload": e.payload,
            }),
            Event::Request(e) => json!({
                "requestId": e.request.request_id,
                "portId": e.request.port_id,
                "typeId": e.request.type_id,
                "payload": e.request.payload,
                "step": e.request.step,
            }),
            Event::Step(e) => json!({
                "step": e.step,
                "yielded": e.yielded,
                "requestsPending": e.requests_pending,
                "terminal": e.terminal,
                "checkpointId": e.checkpoint_id,
            }),
            Event::RunError(e) => json!({ "step": e.step, "message": e.message }),
            Event::Cancelled(e) => json!({ "step": e.step }),
            Event::Diagnostic(e) => json!({ "scope": e.scope, "message": e.message }),
        };

        json!({
            "kind": self.kind(),
            "timestamp": self.timestamp().to_rfc3339(),
            "executorId": self.executor_id(),
            "data": data,
        })
    }

    /// Compact JSON string form of [`to_json_value`](Self::to_json_value).
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    /// Pretty-printed JSON for debugging and human-readable logs.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json_value())
    }
}

// Display is the line format sinks render by default; keep it single-line.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Executor(e) => match &e.phase {
                ExecutorPhase::Invoked { type_id } => {
                    write!(f, "[{}@{}] invoked ({type_id})", e.executor_id, e.step)
                }
                ExecutorPhase::Completed => {
                    write!(f, "[{}@{}] completed", e.executor_id, e.step)
                }
                ExecutorPhase::Failed { error } => {
                    write!(f, "[{}@{}] failed: {error}", e.executor_id, e.step)
                }
            },
            Event::Output(e) => {
                write!(f, "[{}@{}] output {}", e.executor_id, e.step, e.payload)
            }
            Event::Request(e) => write!(
                f,
                "[{}@{}] request {} via port {}",
                e.request.origin, e.request.step, e.request.request_id, e.request.port_id
            ),
            Event::Step(e) => write!(
                f,
                "-- superstep {} complete (yielded={} pending_requests={} terminal={})",
                e.step, e.yielded, e.requests_pending, e.terminal
            ),
            Event::RunError(e) => match e.step {
                Some(step) => write!(f, "[step {step}] error: {}", e.message),
                None => write!(f, "error: {}", e.message),
            },
            Event::Cancelled(e) => write!(f, "[step {}] cancelled", e.step),
            Event::Diagnostic(e) => write!(f, "{}: {}", e.scope, e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_projection_carries_kind_and_executor() {
        let event = Event::output(
            ExecutorId::from("echo"),
            0,
            TypeId::of("text"),
            json!("hi"),
        );
        let value = event.to_json_value();
        assert_eq!(value["kind"], "workflowOutput");
        assert_eq!(value["executorId"], "echo");
        assert_eq!(value["data"]["payload"], "hi");
    }

    #[test]
    fn step_events_render_one_per_line() {
        let event = Event::step_completed(4, true, false, false, None);
        let line = event.to_string();
        assert!(line.contains("superstep 4"));
        assert!(!line.contains('\n'));
    }
}
