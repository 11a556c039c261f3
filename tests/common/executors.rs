#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use relaygraph::context::WorkflowContext;
use relaygraph::executor::{Executor, ExecutorError, Protocol, RoutedExecutor};
use relaygraph::registry::TypeRegistry;
use relaygraph::router::{value_handler_fn, MessageHandler, MessageRouter};
use relaygraph::scheduler::FAN_IN_AGGREGATE_TYPE;
use relaygraph::types::{ExecutorId, PortId, TypeId};

/// Echo: accepts `text`, returns it unchanged as `text`.
pub fn echo_executor(id: &str, registry: &Arc<TypeRegistry>) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on_with_output("text", "text", value_handler_fn(Ok))
        .build()
        .unwrap()
}

/// Produces a fixed string whatever `text` arrives.
pub fn const_executor(
    id: &str,
    produces: &'static str,
    registry: &Arc<TypeRegistry>,
) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on_with_output(
            "text",
            "text",
            value_handler_fn(move |_| Ok(json!(produces))),
        )
        .build()
        .unwrap()
}

struct YieldAggregateHandler;

#[async_trait]
impl MessageHandler for YieldAggregateHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        ctx.yield_output(payload, TypeId::of(FAN_IN_AGGREGATE_TYPE))?;
        Ok(None)
    }
}

/// Fan-in target: yields the aggregate array it receives.
pub fn join_executor(id: &str, registry: &Arc<TypeRegistry>) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on(FAN_IN_AGGREGATE_TYPE, Arc::new(YieldAggregateHandler))
        .build()
        .unwrap()
}

/// Yields whatever `text` payload it receives.
pub fn sink_executor(id: &str, registry: &Arc<TypeRegistry>) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on(
            "text",
            Arc::new(YieldTextHandler),
        )
        .build()
        .unwrap()
}

struct YieldTextHandler;

#[async_trait]
impl MessageHandler for YieldTextHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        ctx.yield_output(payload, TypeId::of("text"))?;
        Ok(None)
    }
}

struct AskHandler {
    port: PortId,
}

#[async_trait]
impl MessageHandler for AskHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        let response = ctx
            .request_external(&self.port, payload, TypeId::of("question"))
            .await?;
        ctx.yield_output(response, TypeId::of("answer"))?;
        Ok(None)
    }
}

struct AnswerHandler;

#[async_trait]
impl MessageHandler for AnswerHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        // Re-entry path after a checkpoint restore: the response arrives as
        // a plain delivery of the answer type.
        ctx.yield_output(payload, TypeId::of("answer"))?;
        Ok(None)
    }
}

/// Suspends on the `askUser` port and yields the response; also accepts
/// `answer` deliveries so restored runs can resume via router re-entry.
pub fn ask_executor(id: &str, registry: &Arc<TypeRegistry>) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on(
            "question",
            Arc::new(AskHandler {
                port: PortId::new("askUser"),
            }),
        )
        .on("answer", Arc::new(AnswerHandler))
        .build()
        .unwrap()
}

/// Failing executor for error-path tests.
pub fn failing_executor(id: &str, registry: &Arc<TypeRegistry>) -> RoutedExecutor {
    RoutedExecutor::builder(id, Arc::clone(registry))
        .on(
            "text",
            Arc::new(FailHandler),
        )
        .build()
        .unwrap()
}

struct FailHandler;

#[async_trait]
impl MessageHandler for FailHandler {
    async fn call(
        &self,
        _payload: Value,
        _ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        Err(ExecutorError::msg("intentional failure"))
    }
}

struct CountHandler {
    total: Arc<AtomicU64>,
}

#[async_trait]
impl MessageHandler for CountHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        let add = payload.as_u64().ok_or(ExecutorError::MissingInput {
            what: "numeric payload",
        })?;
        let total = self.total.fetch_add(add, Ordering::SeqCst) + add;
        ctx.yield_output(json!(total), TypeId::of("number"))?;
        Ok(None)
    }
}

/// Stateful accumulator: sums `number` payloads, yields the running total.
/// Checkpoints its total; `reset()` returns it to zero.
pub struct CounterExecutor {
    id: ExecutorId,
    protocol: Protocol,
    router: MessageRouter,
    total: Arc<AtomicU64>,
}

impl CounterExecutor {
    pub fn new(id: &str, registry: &Arc<TypeRegistry>) -> Self {
        let total = Arc::new(AtomicU64::new(0));
        let mut router = MessageRouter::new(Arc::clone(registry));
        router
            .register(
                TypeId::of("number"),
                None,
                Arc::new(CountHandler {
                    total: Arc::clone(&total),
                }),
            )
            .unwrap();
        Self {
            id: ExecutorId::from(id),
            protocol: Protocol::new().accept("number").yield_type("number"),
            router,
            total,
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for CounterExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn router(&self) -> &MessageRouter {
        &self.router
    }

    async fn on_checkpointing(&self, _ctx: &WorkflowContext) -> Result<Value, ExecutorError> {
        Ok(json!(self.total.load(Ordering::SeqCst)))
    }

    async fn on_restored(&self, state: Value, _ctx: &WorkflowContext) -> Result<(), ExecutorError> {
        self.total
            .store(state.as_u64().unwrap_or_default(), Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) -> Result<(), ExecutorError> {
        self.total.store(0, Ordering::SeqCst);
        Ok(())
    }
}
