//! Runtime behavior: determinism, streaming execution, sharing and reset
//! policy, ordering guarantees, and phase legality.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::*;
use relaygraph::context::WorkflowContext;
use relaygraph::event_bus::Event;
use relaygraph::executor::{
    ExecutorError, ExecutorOptions, ExecutorRegistration, RoutedExecutor,
};
use relaygraph::gate::ExternalResponse;
use relaygraph::graph::WorkflowBuilder;
use relaygraph::router::{ctx_handler_fn, MessageHandler};
use relaygraph::runtime::{RunError, Runner};
use relaygraph::types::{ExecutorId, PortId, RunPhase, TypeId};

fn fan_workflow(
    registry: &Arc<relaygraph::registry::TypeRegistry>,
) -> relaygraph::graph::Workflow {
    WorkflowBuilder::with_registry(Arc::clone(registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "A",
            const_executor("A", "a", registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "B",
            const_executor("B", "b", registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "J",
            join_executor("J", registry),
        ))
        .add_fan_out("S", ["A", "B"])
        .add_fan_in(["A", "B"], "J")
        .set_start("S")
        .build()
        .unwrap()
}

#[tokio::test]
async fn identical_runs_produce_identical_event_sequences() {
    let mut sequences = Vec::new();
    for _ in 0..2 {
        let registry = test_registry();
        let mut runner = Runner::with_config(fan_workflow(&registry), quiet_config()).await;
        let mut events = runner.event_stream();
        let run = runner.run(json!("1"), TypeId::of("text")).await.unwrap();
        let drained = events.drain_now();
        sequences.push((
            kinds(&drained)
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>(),
            executor_ids(&drained),
            run.outputs().to_vec(),
        ));
    }
    assert_eq!(sequences[0], sequences[1]);
}

#[tokio::test]
async fn streaming_run_delivers_events_and_report() {
    let registry = test_registry();
    let runner = Runner::with_config(fan_workflow(&registry), quiet_config()).await;

    let mut streaming = runner.stream(json!("1"), TypeId::of("text")).unwrap();
    let mut events = streaming.events();
    let report = streaming.join().await.unwrap();

    assert_eq!(report.phase, RunPhase::Terminal);
    assert_eq!(report.steps, 3);
    assert_eq!(report.outputs, vec![json!(["a", "b"])]);

    let drained = events.drain_now();
    assert!(kinds(&drained).contains(&"workflowOutput"));
    assert!(drained.iter().any(|e| matches!(
        e,
        relaygraph::event_bus::Event::Diagnostic(d)
            if d.scope == relaygraph::event_bus::STREAM_END_SCOPE
    )));
}

#[tokio::test]
async fn resettable_executors_behave_like_fresh_instances() {
    let registry = test_registry();
    let counter_registry = Arc::clone(&registry);
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(
            ExecutorRegistration::factory_fn("count", move |_run| {
                Arc::new(CounterExecutor::new("count", &counter_registry))
            })
            .with_options(ExecutorOptions::default().resettable(true)),
        )
        .set_start("count")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let first = runner.run(json!(5), TypeId::of("number")).await.unwrap();
    assert_eq!(first.outputs(), &[json!(5)]);

    // The pooled instance was reset; a dirty reuse would report 10.
    let second = runner.run(json!(5), TypeId::of("number")).await.unwrap();
    assert_eq!(second.outputs(), &[json!(5)]);
}

#[tokio::test]
async fn concurrent_shareable_executors_keep_state_across_runs() {
    let registry = test_registry();
    let counter_registry = Arc::clone(&registry);
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(
            ExecutorRegistration::factory_fn("count", move |_run| {
                Arc::new(CounterExecutor::new("count", &counter_registry))
            })
            .with_options(ExecutorOptions::default().concurrent_shareable(true)),
        )
        .set_start("count")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let first = runner.run(json!(5), TypeId::of("number")).await.unwrap();
    assert_eq!(first.outputs(), &[json!(5)]);

    // One instance per workflow: state accumulates across sequential runs.
    let second = runner.run(json!(5), TypeId::of("number")).await.unwrap();
    assert_eq!(second.outputs(), &[json!(10)]);
}

#[tokio::test]
async fn same_target_deliveries_arrive_in_source_order() {
    let registry = test_registry();
    // Both A and B feed C directly; C handles each delivery separately and
    // must observe them ordered by (source id, emit index).
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "B",
            const_executor("B", "b", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "A",
            const_executor("A", "a", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "C",
            sink_executor("C", &registry),
        ))
        // Declaration order feeds B before A on purpose; delivery order to C
        // must still be lexicographic by source.
        .add_fan_out("S", ["B", "A"])
        .add_edge("B", "C")
        .add_edge("A", "C")
        .set_start("S")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let run = runner.run(json!("x"), TypeId::of("text")).await.unwrap();
    assert_eq!(run.outputs(), &[json!("a"), json!("b")]);
}

/// Marks the executor busy for a window; two invocations inside the window
/// at once trip the overlap flag.
struct InvocationGuard {
    busy: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
}

impl InvocationGuard {
    async fn occupy(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.busy.store(false, Ordering::SeqCst);
    }
}

struct GuardedAskHandler {
    port: PortId,
    guard: InvocationGuard,
}

#[async_trait]
impl MessageHandler for GuardedAskHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        let answer = ctx
            .request_external(&self.port, payload, TypeId::of("question"))
            .await?;
        // The guarded window is the live post-resume section; a parked
        // handler does not hold the executor's mailbox.
        self.guard.occupy().await;
        ctx.yield_output(answer, TypeId::of("answer"))?;
        Ok(None)
    }
}

struct GuardedTextHandler {
    guard: InvocationGuard,
}

#[async_trait]
impl MessageHandler for GuardedTextHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        self.guard.occupy().await;
        ctx.yield_output(payload, TypeId::of("text"))?;
        Ok(None)
    }
}

/// Holds its step open long enough for the test to answer the request, so
/// the response and this executor's send land in the same step boundary.
struct SlowForwardHandler {
    target: ExecutorId,
}

#[async_trait]
impl MessageHandler for SlowForwardHandler {
    async fn call(
        &self,
        _payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        ctx.send_message_to(json!("pong"), TypeId::of("text"), self.target.clone())?;
        Ok(None)
    }
}

#[tokio::test]
async fn resumed_and_fresh_invocations_never_overlap_on_one_executor() {
    let registry = test_registry();
    let busy = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    // X parks on a request in step 1 while its sibling, in the same step,
    // produces a fresh delivery back to X. Answering during that step makes
    // the resumed invocation and the fresh delivery collide on X unless the
    // scheduler defers one of them.
    let x = RoutedExecutor::builder("X", Arc::clone(&registry))
        .on(
            "question",
            Arc::new(GuardedAskHandler {
                port: PortId::new("askUser"),
                guard: InvocationGuard {
                    busy: Arc::clone(&busy),
                    overlapped: Arc::clone(&overlapped),
                },
            }),
        )
        .on(
            "text",
            Arc::new(GuardedTextHandler {
                guard: InvocationGuard {
                    busy: Arc::clone(&busy),
                    overlapped: Arc::clone(&overlapped),
                },
            }),
        )
        .build()
        .unwrap();
    let sibling = RoutedExecutor::builder("sib", Arc::clone(&registry))
        .on(
            "text",
            Arc::new(SlowForwardHandler {
                target: ExecutorId::from("X"),
            }),
        )
        .build()
        .unwrap();
    let splitter = RoutedExecutor::builder("S", Arc::clone(&registry))
        .on(
            "text",
            ctx_handler_fn(|payload, ctx| {
                ctx.send_message_to(payload, TypeId::of("question"), "X")?;
                ctx.send_message_to(json!("ping"), TypeId::of("text"), "sib")?;
                Ok(())
            }),
        )
        .build()
        .unwrap();

    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("S", splitter))
        .add_executor(ExecutorRegistration::instance("X", x))
        .add_executor(ExecutorRegistration::instance("sib", sibling))
        .add_port("askUser")
        .set_start("S")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let mut streaming = runner.stream(json!("what?"), TypeId::of("text")).unwrap();
    let mut events = streaming.events();

    let request_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(Event::Request(req)) => break req.request.request_id,
                Some(_) => continue,
                None => panic!("event stream closed before the request appeared"),
            }
        }
    })
    .await
    .unwrap();

    streaming
        .send_response(ExternalResponse::new(
            request_id,
            json!("ok"),
            TypeId::of("answer"),
        ))
        .unwrap();

    let report = streaming.join().await.unwrap();
    assert_eq!(report.phase, RunPhase::Terminal);
    assert_eq!(report.outputs.len(), 2);
    assert!(
        !overlapped.load(Ordering::SeqCst),
        "two invocations of the same executor ran concurrently"
    );
}

#[tokio::test]
async fn message_injection_requires_a_quiescent_run() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "ask",
            ask_executor("ask", &registry),
        ))
        .add_port("askUser")
        .set_start("ask")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let mut run = runner
        .run(json!("q"), TypeId::of("question"))
        .await
        .unwrap();
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);

    let err = run
        .send_message(json!("again"), TypeId::of("question"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::InvalidPhase { .. }));
}

#[tokio::test]
async fn quiescent_run_accepts_new_input() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            sink_executor("S", &registry),
        ))
        .set_start("S")
        .build()
        .unwrap();

    let runner = Runner::with_config(workflow, quiet_config()).await;
    let mut run = runner.run(json!("one"), TypeId::of("text")).await.unwrap();
    assert_eq!(run.phase(), RunPhase::Terminal);

    run.send_message(json!("two"), TypeId::of("text"))
        .await
        .unwrap();
    assert_eq!(run.outputs(), &[json!("one"), json!("two")]);
}
