//! End-to-end routing scenarios: echo, fan-out/fan-in, switch, conditional
//! edges, and the degenerate boundary behaviors.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use relaygraph::executor::ExecutorRegistration;
use relaygraph::graph::{EdgePredicate, SwitchBuilder, WorkflowBuilder};
use relaygraph::runtime::Runner;
use relaygraph::types::{RunPhase, TypeId};

#[tokio::test]
async fn echo_round_trip_emits_canonical_sequence() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "echo",
            sink_executor("echo", &registry),
        ))
        .set_start("echo")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("hi"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.outputs(), &[json!("hi")]);
    assert_eq!(run.steps(), 1);

    let drained = events.drain_now();
    let kinds = kinds(&drained);
    assert_eq!(
        &kinds[..4],
        &[
            "executorInvoked",
            "workflowOutput",
            "executorCompleted",
            "superStepCompleted",
        ]
    );
}

#[tokio::test]
async fn fan_out_then_fan_in_aggregates_in_declaration_order() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("S", echo_executor("S", &registry)))
        .add_executor(ExecutorRegistration::instance(
            "A",
            const_executor("A", "a", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "B",
            const_executor("B", "b", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "J",
            join_executor("J", &registry),
        ))
        .add_fan_out("S", ["A", "B"])
        .add_fan_in(["A", "B"], "J")
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("1"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    // Step 0: S; step 1: A and B; step 2: J with the aggregate.
    assert_eq!(run.steps(), 3);
    assert_eq!(run.outputs(), &[json!(["a", "b"])]);

    let drained = events.drain_now();
    let ids = executor_ids(&drained);
    let a_pos = ids.iter().position(|id| id == "A").unwrap();
    let b_pos = ids.iter().position(|id| id == "B").unwrap();
    assert!(a_pos < b_pos, "fan-out targets run in declaration order");
}

#[tokio::test]
async fn fan_in_with_a_silent_source_never_fires() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("S", echo_executor("S", &registry)))
        .add_executor(ExecutorRegistration::instance(
            "A",
            const_executor("A", "a", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "B",
            const_executor("B", "b", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "J",
            join_executor("J", &registry),
        ))
        // Only A is reachable; B never contributes, so J must never fire.
        .add_edge("S", "A")
        .add_fan_in(["A", "B"], "J")
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("x"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert!(run.outputs().is_empty());
    let ids = executor_ids(&events.drain_now());
    assert!(!ids.contains(&"J".to_string()));
}

#[tokio::test]
async fn switch_routes_to_first_matching_case_only() {
    let registry = test_registry();
    let p_never: EdgePredicate = Arc::new(|_| false);
    let p_match: EdgePredicate = Arc::new(|env| env.payload == json!("route-me"));

    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("S", echo_executor("S", &registry)))
        .add_executor(ExecutorRegistration::instance(
            "X",
            sink_executor("X", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "Y",
            sink_executor("Y", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "Z",
            sink_executor("Z", &registry),
        ))
        .add_switch(
            "S",
            SwitchBuilder::new()
                .case(p_never, "X")
                .case(p_match, "Y")
                .default_target("Z"),
        )
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner
        .run(json!("route-me"), TypeId::of("text"))
        .await
        .unwrap();

    assert_eq!(run.outputs(), &[json!("route-me")]);
    let ids = executor_ids(&events.drain_now());
    assert!(ids.contains(&"Y".to_string()));
    assert!(!ids.contains(&"X".to_string()));
    assert!(!ids.contains(&"Z".to_string()));
}

#[tokio::test]
async fn switch_without_match_or_default_drops_the_send() {
    let registry = test_registry();
    let p_never: EdgePredicate = Arc::new(|_| false);

    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("S", echo_executor("S", &registry)))
        .add_executor(ExecutorRegistration::instance(
            "X",
            sink_executor("X", &registry),
        ))
        .add_switch("S", SwitchBuilder::new().case(p_never, "X"))
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("x"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.steps(), 1);
    assert!(!executor_ids(&events.drain_now()).contains(&"X".to_string()));
}

#[tokio::test]
async fn conditional_edges_route_by_payload() {
    let registry = test_registry();
    let to_yes: EdgePredicate = Arc::new(|env| env.payload == json!("yes"));
    let to_no: EdgePredicate = Arc::new(|env| env.payload != json!("yes"));

    let build = |registry: &Arc<relaygraph::registry::TypeRegistry>| {
        WorkflowBuilder::with_registry(Arc::clone(registry))
            .add_executor(ExecutorRegistration::instance("S", echo_executor("S", registry)))
            .add_executor(ExecutorRegistration::instance(
                "Y",
                sink_executor("Y", registry),
            ))
            .add_executor(ExecutorRegistration::instance(
                "N",
                sink_executor("N", registry),
            ))
            .add_conditional_edge("S", "Y", to_yes.clone())
            .add_conditional_edge("S", "N", to_no.clone())
            .set_start("S")
            .build()
            .unwrap()
    };

    let mut runner = Runner::with_config(build(&registry), quiet_config()).await;
    let mut events = runner.event_stream();
    runner.run(json!("yes"), TypeId::of("text")).await.unwrap();
    let ids = executor_ids(&events.drain_now());
    assert!(ids.contains(&"Y".to_string()));
    assert!(!ids.contains(&"N".to_string()));

    let registry2 = test_registry();
    let mut runner2 = Runner::with_config(build(&registry2), quiet_config()).await;
    let mut events2 = runner2.event_stream();
    runner2.run(json!("no"), TypeId::of("text")).await.unwrap();
    let ids = executor_ids(&events2.drain_now());
    assert!(ids.contains(&"N".to_string()));
    assert!(!ids.contains(&"Y".to_string()));
}

#[tokio::test]
async fn handler_failure_terminates_the_run_at_step_end() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "F",
            failing_executor("F", &registry),
        ))
        .set_start("F")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("x"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Error);
    let kinds = kinds(&events.drain_now());
    assert!(kinds.contains(&"executorFailed"));
    assert!(kinds.contains(&"workflowError"));
}

#[tokio::test]
async fn undeclared_yield_type_aborts_the_handler() {
    use relaygraph::executor::RoutedExecutor;
    use relaygraph::router::ctx_handler_fn;

    let registry = test_registry();
    let violator = RoutedExecutor::builder("V", Arc::clone(&registry))
        .on(
            "text",
            ctx_handler_fn(|payload, ctx| {
                ctx.yield_output(payload, TypeId::of("number"))?;
                Ok(())
            }),
        )
        .yields("text")
        .build()
        .unwrap();

    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance("V", violator))
        .set_start("V")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!("x"), TypeId::of("text")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Error);
    assert!(run.outputs().is_empty());
    assert!(kinds(&events.drain_now()).contains(&"executorFailed"));
}

#[tokio::test]
async fn unaccepted_delivery_is_reported_and_dropped() {
    let registry = test_registry();
    // The sink accepts only `text`; the input declares `number`.
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            sink_executor("S", &registry),
        ))
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let mut events = runner.event_stream();
    let run = runner.run(json!(5), TypeId::of("number")).await.unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert!(run.outputs().is_empty());
    assert!(kinds(&events.drain_now()).contains(&"workflowError"));
}

#[tokio::test]
async fn supertype_fallback_reaches_the_base_handler() {
    let registry = test_registry();
    // `greeting` is registered with supertype `text`; the sink only keys
    // handlers on `text`.
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            sink_executor("S", &registry),
        ))
        .set_start("S")
        .build()
        .unwrap();

    let mut runner = Runner::with_config(workflow, quiet_config()).await;
    let run = runner
        .run(json!("hello"), TypeId::of("greeting"))
        .await
        .unwrap();

    assert_eq!(run.phase(), RunPhase::Terminal);
    assert_eq!(run.outputs(), &[json!("hello")]);
}
