//! Request/response gating: suspension, correlation, cancellation, and
//! restore-time re-entry.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::*;
use relaygraph::context::WorkflowContext;
use relaygraph::executor::{ExecutorError, ExecutorRegistration, RoutedExecutor};
use relaygraph::gate::ExternalResponse;
use relaygraph::graph::WorkflowBuilder;
use relaygraph::router::MessageHandler;
use relaygraph::runtime::{RunError, Runner};
use relaygraph::types::{PortId, RunPhase, TypeId};

fn ask_workflow(
    registry: &Arc<relaygraph::registry::TypeRegistry>,
) -> relaygraph::graph::Workflow {
    WorkflowBuilder::with_registry(Arc::clone(registry))
        .add_executor(ExecutorRegistration::instance(
            "ask",
            ask_executor("ask", registry),
        ))
        .add_port("askUser")
        .set_start("ask")
        .build()
        .unwrap()
}

#[tokio::test]
async fn request_suspends_and_response_resumes() {
    let registry = test_registry();
    let mut runner = Runner::with_config(ask_workflow(&registry), quiet_config()).await;
    let mut events = runner.event_stream();

    let mut run = runner
        .run(json!("what color?"), TypeId::of("question"))
        .await
        .unwrap();
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);
    assert_eq!(run.outstanding_requests(), 1);

    let drained = events.drain_now();
    let request_id = first_request_id(&drained).expect("request event emitted");
    assert!(kinds(&drained).contains(&"requestInfo"));

    run.send_response(ExternalResponse::new(
        request_id,
        json!("ok"),
        TypeId::of("answer"),
    ))
    .await
    .unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.outputs(), &[json!("ok")]);
    // The resumed handler's yield belongs to the response step, not the
    // request step.
    let resumed = events.drain_now();
    let output_step = resumed
        .iter()
        .find_map(|e| match e {
            relaygraph::event_bus::Event::Output(out) => Some(out.step),
            _ => None,
        })
        .unwrap();
    assert_eq!(output_step, 1);
}

#[tokio::test]
async fn unknown_and_late_responses_are_rejected() {
    let registry = test_registry();
    let mut runner = Runner::with_config(ask_workflow(&registry), quiet_config()).await;
    let mut events = runner.event_stream();

    let mut run = runner
        .run(json!("q"), TypeId::of("question"))
        .await
        .unwrap();
    let request_id = first_request_id(&events.drain_now()).unwrap();

    // Unknown id: reported and ignored, run stays suspended.
    let err = run
        .send_response(ExternalResponse::new(
            relaygraph::types::RequestId::new("bogus"),
            json!("nope"),
            TypeId::of("answer"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Gate(_)));
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);

    // Matching response completes the run.
    run.send_response(ExternalResponse::new(
        request_id.clone(),
        json!("ok"),
        TypeId::of("answer"),
    ))
    .await
    .unwrap();
    assert_eq!(run.phase(), RunPhase::Terminal);

    // A response after termination is rejected.
    let err = run
        .send_response(ExternalResponse::new(
            request_id,
            json!("again"),
            TypeId::of("answer"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Gate(_)));
}

struct DoubleAskHandler {
    port: PortId,
}

#[async_trait]
impl MessageHandler for DoubleAskHandler {
    async fn call(
        &self,
        payload: Value,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, ExecutorError> {
        let first = ctx
            .request_external(&self.port, payload, TypeId::of("question"))
            .await?;
        let second = ctx
            .request_external(&self.port, first, TypeId::of("question"))
            .await?;
        ctx.yield_output(second, TypeId::of("answer"))?;
        Ok(None)
    }
}

#[tokio::test]
async fn duplicate_response_is_rejected_while_run_is_active() {
    let registry = test_registry();
    let asker = RoutedExecutor::builder("ask", Arc::clone(&registry))
        .on(
            "question",
            Arc::new(DoubleAskHandler {
                port: PortId::new("askUser"),
            }),
        )
        .build()
        .unwrap();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("ask", asker))
        .add_port("askUser")
        .set_start("ask")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let mut run = runner
        .run(json!("first?"), TypeId::of("question"))
        .await
        .unwrap();

    let first_id = first_request_id(&events.drain_now()).unwrap();
    run.send_response(ExternalResponse::new(
        first_id.clone(),
        json!("first answer"),
        TypeId::of("answer"),
    ))
    .await
    .unwrap();

    // The handler asked again; the run is suspended on a second request.
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);
    let second_id = first_request_id(&events.drain_now()).unwrap();
    assert_ne!(first_id, second_id);

    // Replaying the first id is a duplicate.
    let err = run
        .send_response(ExternalResponse::new(
            first_id,
            json!("replay"),
            TypeId::of("answer"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Gate(_)));

    run.send_response(ExternalResponse::new(
        second_id,
        json!("second answer"),
        TypeId::of("answer"),
    ))
    .await
    .unwrap();
    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.outputs(), &[json!("second answer")]);
}

#[tokio::test]
async fn cancellation_wakes_a_suspended_handler() {
    let registry = test_registry();
    let mut runner = Runner::with_config(ask_workflow(&registry), quiet_config()).await;
    let mut events = runner.event_stream();

    let mut run = runner
        .run(json!("q"), TypeId::of("question"))
        .await
        .unwrap();
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);

    run.cancel().await;
    assert_eq!(run.phase(), RunPhase::Cancelled);
    assert!(kinds(&events.drain_now()).contains(&"cancelled"));
}

#[tokio::test]
async fn checkpoint_mid_request_resumes_through_reentry() {
    let registry = test_registry();
    let mut runner = Runner::with_config(ask_workflow(&registry), quiet_config()).await;
    let mut events = runner.event_stream();

    let run = runner
        .run(json!("q"), TypeId::of("question"))
        .await
        .unwrap();
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);
    let request_id = first_request_id(&events.drain_now()).unwrap();

    let checkpoints = run.current_checkpoints().await.unwrap();
    let latest = checkpoints.last().unwrap().clone();
    drop(run);

    // A fresh run restored from the checkpoint re-establishes the request.
    let mut restored = runner.resume(&latest).await.unwrap();
    assert_eq!(restored.phase(), RunPhase::AwaitingResponse);
    assert_eq!(restored.outstanding_requests(), 1);

    restored
        .send_response(ExternalResponse::new(
            request_id,
            json!("ok"),
            TypeId::of("answer"),
        ))
        .await
        .unwrap();
    assert_eq!(restored.phase(), RunPhase::Terminal);
    assert_eq!(restored.outputs(), &[json!("ok")]);
}

#[tokio::test]
async fn port_host_forwards_requests_and_responses() {
    use relaygraph::gate::PortRegistration;
    use relaygraph::router::ctx_handler_fn;

    let registry = test_registry();
    let answer_sink = RoutedExecutor::builder("sink", Arc::clone(&registry))
        .on(
            "answer",
            ctx_handler_fn(|payload, ctx| {
                ctx.yield_output(payload, TypeId::of("answer"))?;
                Ok(())
            }),
        )
        .build()
        .unwrap();

    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::port(
            "gateway",
            PortRegistration::new("askUser", "question", "answer"),
        ))
        .add_executor(ExecutorRegistration::instance("sink", answer_sink))
        .add_edge("gateway", "sink")
        .set_start("gateway")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let mut run = runner
        .run(json!("what?"), TypeId::of("question"))
        .await
        .unwrap();
    assert_eq!(run.phase(), RunPhase::AwaitingResponse);

    let request_id = first_request_id(&events.drain_now()).unwrap();
    run.send_response(ExternalResponse::new(
        request_id,
        json!("forty-two"),
        TypeId::of("answer"),
    ))
    .await
    .unwrap();

    // The gateway autosent the response along its edge; the sink yielded it.
    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.outputs(), &[json!("forty-two")]);
}

#[tokio::test]
async fn unregistered_port_fails_the_handler() {
    let registry = test_registry();
    // Same asker, but the workflow never registers the port.
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "ask",
            ask_executor("ask", &registry),
        ))
        .set_start("ask")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner
        .run(json!("q"), TypeId::of("question"))
        .await
        .unwrap();

    assert_eq!(run.phase(), RunPhase::Error);
    assert!(kinds(&events.drain_now()).contains(&"executorFailed"));
}
