//! Per-executor typed message routing.
//!
//! A [`MessageRouter`] maps declared [`TypeId`]s to handlers. Dispatch finds
//! the most specific handler: exact type first, then the registered
//! supertype chain (cached after the first walk), then an optional
//! catch-all. The result of every dispatch is a [`CallResult`], never a
//! thrown error; the scheduler decides what a failure means for the run.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::context::WorkflowContext;
use crate::envelope::Envelope;
use crate::executor::ExecutorError;
use crate::registry::TypeRegistry;
use crate::types::TypeId;

/// Outcome of routing one message through a handler table.
#[derive(Debug)]
pub enum CallResult {
    /// A handler ran and returned nothing.
    Done,
    /// A handler ran and returned a value; `type_id` is the handler's
    /// declared output type, used for autosend/autoyield.
    Value {
        value: Value,
        type_id: Option<TypeId>,
    },
    /// No handler matched the declared type or its supertype chain.
    NotFound,
    /// The handler failed; the error is reified, not thrown.
    Failed(ExecutorError),
}

impl CallResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Done | CallResult::Value { .. })
    }
}

/// A message handler bound into a router.
///
/// Handlers may be synchronous (see the `handler_fn` adapters) or suspending
/// (implement this trait directly and `.await` inside `call`, including
/// [`WorkflowContext::request_external`]).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError>;
}

/// Registration errors for handler tables.
#[derive(Debug, Error, Diagnostic)]
pub enum RouterError {
    #[error("a different handler is already registered for type `{type_id}`")]
    #[diagnostic(
        code(relaygraph::router::duplicate_handler),
        help("Registration is idempotent per (type, handler) pair; use one handler per input type.")
    )]
    DuplicateHandler { type_id: TypeId },

    #[error("a catch-all handler is already registered")]
    #[diagnostic(code(relaygraph::router::duplicate_catch_all))]
    DuplicateCatchAll,

    #[error("type `{type_id}` is not registered in the type registry")]
    #[diagnostic(
        code(relaygraph::router::unregistered_type),
        help("Register the type before keying handlers on it.")
    )]
    UnregisteredType { type_id: TypeId },
}

#[derive(Clone)]
struct HandlerEntry {
    /// Declared input type; `None` for the catch-all entry.
    input: Option<TypeId>,
    /// Declared output type, used as the declared type of autosent values.
    output: Option<TypeId>,
    handler: Arc<dyn MessageHandler>,
}

/// Table of typed handlers with supertype fallback and dispatch caching.
pub struct MessageRouter {
    registry: Arc<TypeRegistry>,
    handlers: FxHashMap<TypeId, HandlerEntry>,
    catch_all: Option<HandlerEntry>,
    // Read-mostly: maps a concrete type to the handler key resolved for it.
    cache: RwLock<FxHashMap<TypeId, TypeId>>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            handlers: FxHashMap::default(),
            catch_all: None,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register a handler for `input`, optionally declaring its output type.
    ///
    /// Idempotent per `(type, handler identity)`: re-registering the same
    /// handler object for the same type is a no-op; a different handler for
    /// an occupied type is rejected.
    pub fn register(
        &mut self,
        input: TypeId,
        output: Option<TypeId>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RouterError> {
        if !self.registry.contains(&input) {
            return Err(RouterError::UnregisteredType { type_id: input });
        }
        if let Some(out) = &output {
            if !self.registry.contains(out) {
                return Err(RouterError::UnregisteredType {
                    type_id: out.clone(),
                });
            }
        }
        if let Some(existing) = self.handlers.get(&input) {
            if Arc::ptr_eq(&existing.handler, &handler) {
                return Ok(());
            }
            return Err(RouterError::DuplicateHandler { type_id: input });
        }
        self.handlers.insert(
            input.clone(),
            HandlerEntry {
                input: Some(input),
                output,
                handler,
            },
        );
        // New keys can change supertype resolution for cached types.
        self.cache.write().clear();
        Ok(())
    }

    /// Register the single permitted catch-all handler.
    pub fn register_catch_all(
        &mut self,
        output: Option<TypeId>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RouterError> {
        if let Some(existing) = &self.catch_all {
            if Arc::ptr_eq(&existing.handler, &handler) {
                return Ok(());
            }
            return Err(RouterError::DuplicateCatchAll);
        }
        self.catch_all = Some(HandlerEntry {
            input: None,
            output,
            handler,
        });
        Ok(())
    }

    /// Whether a message of `type_id` would find a handler here.
    #[must_use]
    pub fn handles(&self, type_id: &TypeId) -> bool {
        self.resolve_key(type_id).is_some() || self.catch_all.is_some()
    }

    #[must_use]
    pub fn has_catch_all(&self) -> bool {
        self.catch_all.is_some()
    }

    /// Declared input types, in no particular order.
    pub fn accepted_types(&self) -> impl Iterator<Item = &TypeId> {
        self.handlers.keys()
    }

    /// Declared output types, in no particular order.
    pub fn output_types(&self) -> impl Iterator<Item = &TypeId> {
        self.handlers
            .values()
            .chain(self.catch_all.iter())
            .filter_map(|e| e.output.as_ref())
    }

    fn resolve_key(&self, type_id: &TypeId) -> Option<TypeId> {
        if self.handlers.contains_key(type_id) {
            return Some(type_id.clone());
        }
        if let Some(key) = self.cache.read().get(type_id) {
            return Some(key.clone());
        }
        for ancestor in self.registry.supertype_chain(type_id) {
            if self.handlers.contains_key(&ancestor) {
                self.cache
                    .write()
                    .insert(type_id.clone(), ancestor.clone());
                return Some(ancestor);
            }
        }
        None
    }

    /// Route an envelope to its most specific handler.
    pub async fn dispatch(&self, envelope: &Envelope, ctx: &WorkflowContext) -> CallResult {
        let entry = match self.resolve_key(&envelope.type_id) {
            Some(key) => self.handlers.get(&key).cloned(),
            None => self.catch_all.clone(),
        };
        let Some(entry) = entry else {
            return CallResult::NotFound;
        };
        tracing::trace!(
            target: "relaygraph::router",
            type_id = %envelope.type_id,
            resolved = entry.input.as_ref().map(|t| t.as_str()).unwrap_or("<catch-all>"),
            "dispatching message"
        );
        match entry.handler.call(envelope.payload.clone(), ctx).await {
            Ok(Some(value)) => CallResult::Value {
                value,
                type_id: entry.output.clone(),
            },
            Ok(None) => CallResult::Done,
            Err(err) => CallResult::Failed(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler adapters for the four synchronous shapes. Suspending handlers
// implement `MessageHandler` directly.
// ---------------------------------------------------------------------------

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<(), ExecutorError> + Send + Sync,
{
    async fn call(
        &self,
        payload: Value,
        _ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        (self.0)(payload).map(|()| None)
    }
}

struct FnValueHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnValueHandler<F>
where
    F: Fn(Value) -> Result<Value, ExecutorError> + Send + Sync,
{
    async fn call(
        &self,
        payload: Value,
        _ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        (self.0)(payload).map(Some)
    }
}

struct FnCtxHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnCtxHandler<F>
where
    F: Fn(Value, &WorkflowContext) -> Result<(), ExecutorError> + Send + Sync,
{
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        (self.0)(payload, ctx).map(|()| None)
    }
}

struct FnCtxValueHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnCtxValueHandler<F>
where
    F: Fn(Value, &WorkflowContext) -> Result<Value, ExecutorError> + Send + Sync,
{
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        (self.0)(payload, ctx).map(Some)
    }
}

/// Value-in, void-out.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value) -> Result<(), ExecutorError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Value-in, value-out.
pub fn value_handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value) -> Result<Value, ExecutorError> + Send + Sync + 'static,
{
    Arc::new(FnValueHandler(f))
}

/// Value-plus-context in, void-out.
pub fn ctx_handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value, &WorkflowContext) -> Result<(), ExecutorError> + Send + Sync + 'static,
{
    Arc::new(FnCtxHandler(f))
}

/// Value-plus-context in, value-out.
pub fn ctx_value_handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value, &WorkflowContext) -> Result<Value, ExecutorError> + Send + Sync + 'static,
{
    Arc::new(FnCtxValueHandler(f))
}
