//! Core identifier types for the relaygraph workflow runtime.
//!
//! These are the domain concepts that define what a workflow *is*: executor
//! identities, stable type identifiers used for routing and checkpoint
//! portability, request ports, and the run phase lattice.
//!
//! For runtime execution aliases (session ids, step numbers), see
//! [`crate::runtime::types`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an executor within a workflow.
///
/// Executor ids must be unique within a [`Workflow`](crate::graph::Workflow);
/// the builder rejects duplicates at build time.
///
/// # Examples
///
/// ```rust
/// use relaygraph::types::ExecutorId;
///
/// let id = ExecutorId::from("upper");
/// assert_eq!(id.as_str(), "upper");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

impl ExecutorId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable string identifier for a registered message type.
///
/// A `TypeId` is the routing and serialization key for message payloads. The
/// identifier survives checkpoints: a payload captured under `"text"` is
/// restored under `"text"`, regardless of process layout. Types are
/// registered in a [`TypeRegistry`](crate::registry::TypeRegistry), which may
/// also record a supertype so routers can fall back along the chain.
///
/// # Examples
///
/// ```rust
/// use relaygraph::types::TypeId;
///
/// let ty = TypeId::of("text");
/// assert_eq!(ty.as_str(), "text");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(String);

impl TypeId {
    #[must_use]
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TypeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Named conduit for external requests (see the request/response gate).
///
/// Ports are registered on the workflow at build time; sending through an
/// unregistered port is a context error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PortId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation id for an external request/response pair.
///
/// Generated when a handler sends through a port; the matching response must
/// carry the same id. A run never applies two responses with the same id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, globally unique request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Phase of a run's lifecycle.
///
/// Checkpoints record the phase so restoration can resume a run in the state
/// it was captured in, including mid-request suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    /// Opened but no step has executed.
    Idle,
    /// Steps are being driven.
    Running,
    /// At least one handler is suspended on an external request and no other
    /// work remains.
    AwaitingResponse,
    /// Quiescent: no deliveries, no requests, no parked handlers.
    Terminal,
    /// Terminated by a handler or runtime failure.
    Error,
    /// Terminated by cooperative cancellation.
    Cancelled,
}

impl RunPhase {
    /// Whether the run can still make progress.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::AwaitingResponse)
    }

    /// Whether the run has ended (successfully or not).
    #[must_use]
    pub fn is_ended(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingResponse => "awaitingResponse",
            Self::Terminal => "terminal",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
