//! Request/response gate: external-request ports and correlation.
//!
//! A handler that sends through a port suspends until a matching response
//! arrives; only that handler is suspended, the rest of the step continues.
//! The gate owns the correlation table keyed by [`RequestId`], which also
//! makes the relationship checkpointable: captured runs persist outstanding
//! request identities, and a response that arrives after restoration is
//! re-entered through the origin executor's router instead of waking a
//! coroutine that no longer exists.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::executor::{Executor, ExecutorError, ExecutorOptions, Protocol};
use crate::router::{MessageHandler, MessageRouter};
use crate::registry::TypeRegistry;
use crate::types::{ExecutorId, PortId, RequestId, TypeId};

/// An external request emitted through a port.
///
/// Exposed to the outside world as a first-class
/// [`RequestEvent`](crate::event_bus::RequestEvent); the consumer answers
/// with an [`ExternalResponse`] carrying the same `request_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub request_id: RequestId,
    pub port_id: PortId,
    pub payload: Value,
    pub type_id: TypeId,
    pub origin: ExecutorId,
    /// Step during which the request was emitted.
    pub step: u64,
}

/// The out-of-band answer to an [`ExternalRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub request_id: RequestId,
    pub payload: Value,
    pub type_id: TypeId,
}

impl ExternalResponse {
    #[must_use]
    pub fn new(request_id: RequestId, payload: Value, type_id: TypeId) -> Self {
        Self {
            request_id,
            payload,
            type_id,
        }
    }
}

/// Correlation failures; reported and ignored by the run per the error
/// handling design.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("no outstanding request with id {request_id}")]
    #[diagnostic(
        code(relaygraph::gate::unknown_request),
        help("The request may have been answered already, or the id is stale.")
    )]
    UnknownRequest { request_id: RequestId },

    #[error("request {request_id} was already answered")]
    #[diagnostic(code(relaygraph::gate::duplicate_response))]
    DuplicateResponse { request_id: RequestId },

    #[error("run has ended; response {request_id} not applied")]
    #[diagnostic(code(relaygraph::gate::run_ended))]
    RunEnded { request_id: RequestId },

    #[error("request cancelled")]
    #[diagnostic(code(relaygraph::gate::cancelled))]
    Cancelled,
}

/// How an applied response reached its handler.
#[derive(Debug)]
pub(crate) enum ResponseDisposition {
    /// A live suspended handler was woken with the payload.
    Woken { request: ExternalRequest },
    /// The request was restored from a checkpoint; the payload must be
    /// re-entered through the origin executor's router.
    Reenter {
        request: ExternalRequest,
        payload: Value,
        type_id: TypeId,
    },
}

pub(crate) struct PendingRequest {
    pub info: ExternalRequest,
    /// `None` for requests restored from a checkpoint (no live waiter).
    pub waker: Option<oneshot::Sender<Result<Value, GateError>>>,
}

/// Correlation table for outstanding external requests.
#[derive(Default)]
pub(crate) struct Gate {
    pending: FxHashMap<RequestId, PendingRequest>,
    applied: FxHashSet<RequestId>,
}

pub(crate) type SharedGate = Arc<parking_lot::Mutex<Gate>>;

impl Gate {
    pub fn new_shared() -> SharedGate {
        Arc::new(parking_lot::Mutex::new(Gate::default()))
    }

    pub fn register(
        &mut self,
        info: ExternalRequest,
        waker: oneshot::Sender<Result<Value, GateError>>,
    ) {
        self.pending.insert(
            info.request_id.clone(),
            PendingRequest {
                info,
                waker: Some(waker),
            },
        );
    }

    /// Reinstall a request captured in a checkpoint. No live waiter exists;
    /// a matching response will re-enter the origin executor.
    pub fn register_restored(&mut self, info: ExternalRequest) {
        self.pending
            .insert(info.request_id.clone(), PendingRequest { info, waker: None });
    }

    pub fn apply(&mut self, response: ExternalResponse) -> Result<ResponseDisposition, GateError> {
        if self.applied.contains(&response.request_id) {
            return Err(GateError::DuplicateResponse {
                request_id: response.request_id,
            });
        }
        let Some(pending) = self.pending.remove(&response.request_id) else {
            return Err(GateError::UnknownRequest {
                request_id: response.request_id,
            });
        };
        self.applied.insert(response.request_id);
        match pending.waker {
            Some(waker) => {
                // A closed receiver means the invocation was dropped; treat as applied.
                let _ = waker.send(Ok(response.payload));
                Ok(ResponseDisposition::Woken {
                    request: pending.info,
                })
            }
            None => Ok(ResponseDisposition::Reenter {
                request: pending.info,
                payload: response.payload,
                type_id: response.type_id,
            }),
        }
    }

    /// Wake every suspended handler with a cancellation signal.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(waker) = pending.waker {
                let _ = waker.send(Err(GateError::Cancelled));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of outstanding request metadata, ordered by request id for
    /// deterministic checkpoint contents.
    pub fn outstanding(&self) -> Vec<ExternalRequest> {
        let mut all: Vec<ExternalRequest> =
            self.pending.values().map(|p| p.info.clone()).collect();
        all.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        all
    }
}

/// Registration payload for an external-port-host executor.
///
/// The built-in host forwards every accepted message out through its port
/// and sends the response along its outgoing edges.
#[derive(Clone, Debug)]
pub struct PortRegistration {
    pub port: PortId,
    pub accepts: TypeId,
    pub response_type: TypeId,
}

impl PortRegistration {
    #[must_use]
    pub fn new(
        port: impl Into<PortId>,
        accepts: impl Into<TypeId>,
        response_type: impl Into<TypeId>,
    ) -> Self {
        Self {
            port: port.into(),
            accepts: accepts.into(),
            response_type: response_type.into(),
        }
    }
}

struct PortForwardHandler {
    port: PortId,
    request_type: TypeId,
}

#[async_trait::async_trait]
impl MessageHandler for PortForwardHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &crate::context::WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        let response = ctx
            .request_external(&self.port, payload, self.request_type.clone())
            .await?;
        Ok(Some(response))
    }
}

/// Built-in executor backing [`PortRegistration`]s.
pub struct PortExecutor {
    id: ExecutorId,
    protocol: Protocol,
    router: MessageRouter,
}

impl PortExecutor {
    pub(crate) fn new(
        id: ExecutorId,
        spec: &PortRegistration,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self, crate::router::RouterError> {
        let mut router = MessageRouter::new(registry);
        router.register(
            spec.accepts.clone(),
            Some(spec.response_type.clone()),
            Arc::new(PortForwardHandler {
                port: spec.port.clone(),
                request_type: spec.accepts.clone(),
            }),
        )?;
        let protocol = Protocol::new()
            .accept(spec.accepts.clone())
            .send(spec.response_type.clone())
            .yield_type(spec.response_type.clone());
        Ok(Self {
            id,
            protocol,
            router,
        })
    }
}

#[async_trait::async_trait]
impl Executor for PortExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn router(&self) -> &MessageRouter {
        &self.router
    }
}

/// Default options for port hosts: forward the response downstream.
pub(crate) fn port_default_options() -> ExecutorOptions {
    ExecutorOptions::default().autosend(true)
}
