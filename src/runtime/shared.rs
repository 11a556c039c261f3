//! Shared-resource policy: instance hand-back between sequential runs.
//!
//! Concurrent-shareable executors live once per workflow and are never
//! reset by the runtime (their reset is a warned no-op, since a concurrent
//! peer may be mid-flight). Resettable, non-shareable executors are reset
//! on run completion and parked in the workflow's pool for the next run.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::executor::Executor;
use crate::graph::Workflow;
use crate::types::ExecutorId;

pub(crate) async fn release_run_instances(
    workflow: &Arc<Workflow>,
    instances: FxHashMap<ExecutorId, Arc<dyn Executor>>,
) {
    for (id, executor) in instances {
        let Some(registration) = workflow.registration(&id) else {
            continue;
        };
        let options = registration.options;
        if options.concurrent_shareable {
            if options.resettable {
                tracing::warn!(
                    target: "relaygraph::runtime",
                    executor = %id,
                    "reset is a no-op for concurrent-shareable executors"
                );
            }
            continue;
        }
        if options.resettable {
            match executor.reset().await {
                Ok(()) => workflow.pool_return(&id, executor),
                Err(err) => {
                    tracing::warn!(
                        target: "relaygraph::runtime",
                        executor = %id,
                        error = %err,
                        "reset failed; instance dropped instead of pooled"
                    );
                }
            }
        }
    }
}
