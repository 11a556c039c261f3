//! Superstep throughput: drive a linear chain end to end and measure the
//! full scheduler cadence (intake, dispatch, barrier, expansion).

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;

use relaygraph::executor::ExecutorRegistration;
use relaygraph::graph::WorkflowBuilder;
use relaygraph::registry::TypeRegistry;
use relaygraph::router::value_handler_fn;
use relaygraph::runtime::{EventBusConfig, Runner, RuntimeConfig};
use relaygraph::types::TypeId;

const CHAIN_LEN: usize = 32;

fn chain_workflow(registry: &Arc<TypeRegistry>) -> relaygraph::graph::Workflow {
    let ids: Vec<String> = (0..CHAIN_LEN).map(|i| format!("stage-{i}")).collect();
    let mut builder = WorkflowBuilder::with_registry(Arc::clone(registry));
    for id in &ids {
        let relay = relaygraph::executor::RoutedExecutor::builder(id.as_str(), Arc::clone(registry))
            .on_with_output("text", "text", value_handler_fn(Ok))
            .build()
            .unwrap();
        builder = builder.add_executor(ExecutorRegistration::instance(id.as_str(), relay));
    }
    builder
        .add_chain(ids.iter().map(String::as_str))
        .set_start("stage-0")
        .build()
        .unwrap()
}

fn bench_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(TypeRegistry::new());
    registry.register("text").unwrap();

    c.bench_function("chain_32_supersteps", |b| {
        b.to_async(&rt).iter(|| {
            let registry = Arc::clone(&registry);
            async move {
                let workflow = chain_workflow(&registry);
                let config = RuntimeConfig::default()
                    .without_checkpoints()
                    .with_event_bus(EventBusConfig::new(4096, vec![]));
                let runner = Runner::with_config(workflow, config).await;
                let run = runner.run(json!("ping"), TypeId::of("text")).await.unwrap();
                assert_eq!(run.steps(), CHAIN_LEN as u64);
            }
        })
    });
}

criterion_group!(benches, bench_chain);
criterion_main!(benches);
