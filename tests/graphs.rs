//! Build-time validation of workflow graphs.

mod common;

use std::sync::Arc;

use common::*;
use relaygraph::executor::{ExecutorRegistration, RegistrationKind};
use relaygraph::graph::{GraphError, SwitchBuilder, WorkflowBuilder};

#[test]
fn duplicate_executor_ids_are_rejected() {
    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .set_start("S")
        .build();
    assert!(matches!(result, Err(GraphError::DuplicateExecutor { .. })));
}

#[test]
fn edges_must_reference_registered_executors() {
    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .add_edge("S", "ghost")
        .set_start("S")
        .build();
    assert!(matches!(result, Err(GraphError::UnknownExecutor { .. })));
}

#[test]
fn start_must_be_set_and_registered() {
    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .build();
    assert!(matches!(result, Err(GraphError::StartNotSet)));

    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .set_start("ghost")
        .build();
    assert!(matches!(result, Err(GraphError::UnknownExecutor { .. })));
}

#[test]
fn placeholders_must_be_bound_before_build() {
    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::placeholder("later"))
        .set_start("later")
        .build();
    assert!(matches!(result, Err(GraphError::UnboundPlaceholder { .. })));

    let registry = test_registry();
    let bound = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::placeholder("later"))
        .bind_placeholder(
            "later",
            RegistrationKind::Instance(Arc::new(echo_executor("later", &registry))),
        )
        .set_start("later")
        .build();
    assert!(bound.is_ok());
}

#[test]
fn degenerate_fan_ins_and_switches_are_rejected() {
    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "J",
            join_executor("J", &registry),
        ))
        .add_fan_in(Vec::<&str>::new(), "J")
        .set_start("J")
        .build();
    assert!(matches!(result, Err(GraphError::EmptyFanIn { .. })));

    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .add_switch("S", SwitchBuilder::new())
        .set_start("S")
        .build();
    assert!(matches!(result, Err(GraphError::EmptySwitch { .. })));

    let registry = test_registry();
    let result = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "A",
            const_executor("A", "a", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "J",
            join_executor("J", &registry),
        ))
        .add_fan_in(["A", "A"], "J")
        .set_start("A")
        .build();
    assert!(matches!(
        result,
        Err(GraphError::DuplicateFanInSource { .. })
    ));
}

#[test]
fn chains_materialize_as_direct_edges() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "a",
            echo_executor("a", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "b",
            echo_executor("b", &registry),
        ))
        .add_executor(ExecutorRegistration::instance(
            "c",
            echo_executor("c", &registry),
        ))
        .add_chain(["a", "b", "c"])
        .set_start("a")
        .build()
        .unwrap();
    assert_eq!(workflow.edges().len(), 2);
}

#[test]
fn descriptor_aggregates_instance_protocols() {
    let registry = test_registry();
    let workflow = WorkflowBuilder::with_registry(Arc::clone(&registry))
        .add_executor(ExecutorRegistration::instance(
            "S",
            echo_executor("S", &registry),
        ))
        .set_start("S")
        .build()
        .unwrap();
    let descriptor = workflow.descriptor();
    assert!(descriptor.accepts.contains(&"text".into()));
    assert!(descriptor.sends.contains(&"text".into()));
}
