//! Message envelopes and targeted deliveries.
//!
//! An [`Envelope`] is a payload plus the metadata the scheduler and routers
//! need: the declared type at send time, the producing executor, the step in
//! which it was produced, and a per-source emit index. `(source, emit_index)`
//! is the deterministic ordering key for everything a step produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecutorId, TypeId};

/// A message together with its routing metadata.
///
/// The declared type is the static type at send time; routers may resolve a
/// handler registered for a supertype of it. Envelopes are serializable so
/// pending deliveries survive checkpoints byte-for-byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The message payload.
    pub payload: Value,
    /// Declared type of the payload at send time.
    pub type_id: TypeId,
    /// Executor that produced the message.
    pub source: ExecutorId,
    /// Step in which the message was produced.
    pub step: u64,
    /// Per-source emit sequence within the producing invocation.
    pub emit_index: u32,
    /// Opaque parent span identifier for telemetry correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(
        payload: Value,
        type_id: TypeId,
        source: ExecutorId,
        step: u64,
        emit_index: u32,
    ) -> Self {
        Self {
            payload,
            type_id,
            source,
            step,
            emit_index,
            trace: None,
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// An envelope bound to a specific target executor.
///
/// Deliveries produced in step `N` become visible to handlers in step `N+1`;
/// the scheduler never delivers within the producing step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub envelope: Envelope,
    pub target: ExecutorId,
}

impl Delivery {
    #[must_use]
    pub fn new(envelope: Envelope, target: ExecutorId) -> Self {
        Self { envelope, target }
    }

    /// Deterministic ordering key: `(source, emit_index)` of the envelope.
    #[must_use]
    pub fn order_key(&self) -> (&ExecutorId, u32) {
        (&self.envelope.source, self.envelope.emit_index)
    }
}
