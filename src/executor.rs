//! Executor contract: protocol declaration, lifecycle hooks, registration.
//!
//! An [`Executor`] is a named unit that consumes messages through its
//! [`MessageRouter`] and produces sends, yields, and events via the
//! [`WorkflowContext`]. Registrations describe how instances come to exist
//! (direct instance, lazy factory, subworkflow host, port host, placeholder)
//! and which sharing/reset capabilities they carry.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::context::{ContextError, WorkflowContext};
use crate::envelope::Envelope;
use crate::gate::PortRegistration;
use crate::registry::TypeRegistry;
use crate::router::{CallResult, MessageHandler, MessageRouter, RouterError};
use crate::subworkflow::SubworkflowRegistration;
use crate::types::{ExecutorId, TypeId};

/// Errors raised by executor construction and handler bodies.
///
/// Fatal handler errors terminate the run at the end of the step; detected
/// protocol violations abort only the offending handler.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// Expected input data is missing from the payload.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(relaygraph::executor::missing_input),
        help("Check that the upstream executor produced the required field: {what}.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(relaygraph::executor::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(relaygraph::executor::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(relaygraph::executor::validation),
        help("Check payload format and required fields.")
    )]
    ValidationFailed(String),

    /// Context operation failed (protocol violation, closed channel, port).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),

    /// The run was cancelled while the handler was suspended.
    #[error("cancelled")]
    #[diagnostic(code(relaygraph::executor::cancelled))]
    Cancelled,

    /// Free-form executor failure.
    #[error("{0}")]
    #[diagnostic(code(relaygraph::executor::other))]
    Message(String),
}

impl ExecutorError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// The declared interface of an executor: which types it accepts, sends,
/// and yields, plus the accepts-all escape hatch.
///
/// Accept gating is enforced by the scheduler before dispatch; send and
/// yield gating is enforced by the context at call time. An empty `sends`
/// or `yields` set leaves that direction unconstrained, which matches
/// executors whose outputs are fully described by their handler output
/// declarations.
#[derive(Clone, Debug, Default)]
pub struct Protocol {
    pub accepts: FxHashSet<TypeId>,
    pub sends: FxHashSet<TypeId>,
    pub yields: FxHashSet<TypeId>,
    pub accepts_all: bool,
}

impl Protocol {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn accept(mut self, type_id: impl Into<TypeId>) -> Self {
        self.accepts.insert(type_id.into());
        self
    }

    #[must_use]
    pub fn send(mut self, type_id: impl Into<TypeId>) -> Self {
        self.sends.insert(type_id.into());
        self
    }

    #[must_use]
    pub fn yield_type(mut self, type_id: impl Into<TypeId>) -> Self {
        self.yields.insert(type_id.into());
        self
    }

    #[must_use]
    pub fn accept_all(mut self) -> Self {
        self.accepts_all = true;
        self
    }

    #[must_use]
    pub fn allows_send(&self, type_id: &TypeId) -> bool {
        self.sends.is_empty() || self.sends.contains(type_id)
    }

    #[must_use]
    pub fn allows_yield(&self, type_id: &TypeId) -> bool {
        self.yields.is_empty() || self.yields.contains(type_id)
    }
}

/// Core trait for workflow executors.
///
/// Implementations declare their protocol and router at construction time;
/// the default `handle` routes through the handler table. Lifecycle hooks
/// are optional: `initialize` runs once per run before the first delivery,
/// `on_checkpointing`/`on_restored` bracket checkpoint capture and
/// restoration, and `reset` returns a resettable executor to its initial
/// state between sequential runs.
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &ExecutorId;

    fn protocol(&self) -> &Protocol;

    fn router(&self) -> &MessageRouter;

    async fn initialize(&self, _ctx: &WorkflowContext) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Route one delivery. Override only when the router table is not the
    /// right dispatch model (e.g. the subworkflow host).
    async fn handle(&self, envelope: &Envelope, ctx: &WorkflowContext) -> CallResult {
        self.router().dispatch(envelope, ctx).await
    }

    /// Produce an opaque, serializable snapshot of executor state.
    async fn on_checkpointing(&self, _ctx: &WorkflowContext) -> Result<Value, ExecutorError> {
        Ok(Value::Null)
    }

    /// Reinstall a snapshot produced by [`on_checkpointing`](Self::on_checkpointing).
    async fn on_restored(&self, _state: Value, _ctx: &WorkflowContext) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Return the executor to its initial state for reuse across sequential
    /// runs. Only called when the registration is marked resettable.
    async fn reset(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Per-registration behavior switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Forward non-null handler return values along outgoing edges.
    pub autosend: bool,
    /// Yield non-null handler return values as workflow output.
    pub autoyield: bool,
    /// One instance serves concurrent runs; the implementation must be
    /// internally thread-safe. Reset is a warned no-op for these.
    pub concurrent_shareable: bool,
    /// Instances may be reused across sequential runs via `reset()`.
    pub resettable: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            autosend: true,
            autoyield: false,
            concurrent_shareable: false,
            resettable: false,
        }
    }
}

impl ExecutorOptions {
    #[must_use]
    pub fn autosend(mut self, on: bool) -> Self {
        self.autosend = on;
        self
    }

    #[must_use]
    pub fn autoyield(mut self, on: bool) -> Self {
        self.autoyield = on;
        self
    }

    #[must_use]
    pub fn concurrent_shareable(mut self, on: bool) -> Self {
        self.concurrent_shareable = on;
        self
    }

    #[must_use]
    pub fn resettable(mut self, on: bool) -> Self {
        self.resettable = on;
        self
    }
}

/// Factory invoked lazily, once per run, to construct an executor.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self, run_id: &str) -> Result<Arc<dyn Executor>, ExecutorError>;
}

struct FnFactory<F>(F);

#[async_trait]
impl<F> ExecutorFactory for FnFactory<F>
where
    F: Fn(&str) -> Arc<dyn Executor> + Send + Sync,
{
    async fn create(&self, run_id: &str) -> Result<Arc<dyn Executor>, ExecutorError> {
        Ok((self.0)(run_id))
    }
}

/// How an executor comes into existence for a run.
#[derive(Clone)]
pub enum RegistrationKind {
    /// A pre-built instance, shared by reference.
    Instance(Arc<dyn Executor>),
    /// Lazily constructed per run via a factory bound to the run id.
    Factory(Arc<dyn ExecutorFactory>),
    /// A whole workflow embedded as an executor.
    Subworkflow(SubworkflowRegistration),
    /// Built-in external-port forwarder.
    Port(PortRegistration),
    /// Id-only registration; must be bound before the workflow builds.
    Placeholder,
}

/// Declarative record binding an id to a construction strategy and options.
#[derive(Clone)]
pub struct ExecutorRegistration {
    pub id: ExecutorId,
    pub kind: RegistrationKind,
    pub options: ExecutorOptions,
}

impl ExecutorRegistration {
    #[must_use]
    pub fn instance(id: impl Into<ExecutorId>, executor: impl Executor + 'static) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Instance(Arc::new(executor)),
            options: ExecutorOptions::default(),
        }
    }

    #[must_use]
    pub fn shared(id: impl Into<ExecutorId>, executor: Arc<dyn Executor>) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Instance(executor),
            options: ExecutorOptions::default(),
        }
    }

    #[must_use]
    pub fn factory(id: impl Into<ExecutorId>, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Factory(factory),
            options: ExecutorOptions::default(),
        }
    }

    /// Factory from a plain closure `(run_id) -> Arc<dyn Executor>`.
    #[must_use]
    pub fn factory_fn<F>(id: impl Into<ExecutorId>, f: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        Self::factory(id, Arc::new(FnFactory(f)))
    }

    #[must_use]
    pub fn subworkflow(id: impl Into<ExecutorId>, spec: SubworkflowRegistration) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Subworkflow(spec),
            options: ExecutorOptions::default(),
        }
    }

    #[must_use]
    pub fn port(id: impl Into<ExecutorId>, spec: PortRegistration) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Port(spec),
            options: crate::gate::port_default_options(),
        }
    }

    /// Id-only registration to be bound later via
    /// [`WorkflowBuilder::bind_placeholder`](crate::graph::WorkflowBuilder::bind_placeholder).
    #[must_use]
    pub fn placeholder(id: impl Into<ExecutorId>) -> Self {
        Self {
            id: id.into(),
            kind: RegistrationKind::Placeholder,
            options: ExecutorOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, RegistrationKind::Placeholder)
    }
}

/// Convenience executor assembled from explicit `(type, handler)` triples.
///
/// Covers the common case where an executor is fully described by its
/// handler table; stateful or suspending executors implement [`Executor`]
/// directly instead.
pub struct RoutedExecutor {
    id: ExecutorId,
    protocol: Protocol,
    router: MessageRouter,
}

impl RoutedExecutor {
    #[must_use]
    pub fn builder(id: impl Into<ExecutorId>, registry: Arc<TypeRegistry>) -> RoutedExecutorBuilder {
        RoutedExecutorBuilder {
            id: id.into(),
            router: MessageRouter::new(registry),
            protocol: Protocol::new(),
            error: None,
        }
    }
}

#[async_trait]
impl Executor for RoutedExecutor {
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

/// Builder for [`RoutedExecutor`].
///
/// Handler registrations populate the protocol: inputs become accepted
/// types, declared outputs become send and yield types.
pub struct RoutedExecutorBuilder {
    id: ExecutorId,
    router: MessageRouter,
    protocol: Protocol,
    error: Option<RouterError>,
}

impl RoutedExecutorBuilder {
    /// Register a handler for `input` with no declared output.
    #[must_use]
    pub fn on(mut self, input: impl Into<TypeId>, handler: Arc<dyn MessageHandler>) -> Self {
        let input = input.into();
        if self.error.is_none() {
            match self.router.register(input.clone(), None, handler) {
                Ok(()) => {
                    self.protocol.accepts.insert(input);
                }
                Err(err) => self.error = Some(err),
            }
        }
        self
    }

    /// Register a handler for `input` declaring `output`.
    #[must_use]
    pub fn on_with_output(
        mut self,
        input: impl Into<TypeId>,
        output: impl Into<TypeId>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let input = input.into();
        let output = output.into();
        if self.error.is_none() {
            match self
                .router
                .register(input.clone(), Some(output.clone()), handler)
            {
                Ok(()) => {
                    self.protocol.accepts.insert(input);
                    self.protocol.sends.insert(output.clone());
                    self.protocol.yields.insert(output);
                }
                Err(err) => self.error = Some(err),
            }
        }
        self
    }

    /// Register the catch-all handler and mark the protocol accepts-all.
    #[must_use]
    pub fn catch_all(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        if self.error.is_none() {
            match self.router.register_catch_all(None, handler) {
                Ok(()) => self.protocol.accepts_all = true,
                Err(err) => self.error = Some(err),
            }
        }
        self
    }

    /// Add a send type beyond those implied by handler outputs.
    #[must_use]
    pub fn sends(mut self, type_id: impl Into<TypeId>) -> Self {
        self.protocol.sends.insert(type_id.into());
        self
    }

    /// Add a yield type beyond those implied by handler outputs.
    #[must_use]
    pub fn yields(mut self, type_id: impl Into<TypeId>) -> Self {
        self.protocol.yields.insert(type_id.into());
        self
    }

    pub fn build(self) -> Result<RoutedExecutor, RouterError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(RoutedExecutor {
            id: self.id,
            protocol: self.protocol,
            router: self.router,
        })
    }
}
