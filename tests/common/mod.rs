#![allow(dead_code)]

pub mod executors;

use std::sync::Arc;

use relaygraph::event_bus::Event;
use relaygraph::registry::TypeRegistry;
use relaygraph::runtime::{EventBusConfig, RuntimeConfig};
use relaygraph::scheduler::FAN_IN_AGGREGATE_TYPE;

pub use executors::*;

/// Scoped registry with the types the fixtures use.
pub fn test_registry() -> Arc<TypeRegistry> {
    let registry = Arc::new(TypeRegistry::new());
    registry.register("text").unwrap();
    registry.register_with_supertype("greeting", "text").unwrap();
    registry.register("number").unwrap();
    registry.register("question").unwrap();
    registry.register("answer").unwrap();
    registry.register(FAN_IN_AGGREGATE_TYPE).unwrap();
    registry
}

/// Runtime config with no sinks so tests stay quiet; events are observed
/// through the runner's event stream instead.
pub fn quiet_config() -> RuntimeConfig {
    RuntimeConfig::default().with_event_bus(EventBusConfig::new(1024, vec![]))
}

/// Kind labels of a drained event sequence, the unit determinism tests
/// compare (timestamps and payload identity are excluded on purpose).
pub fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::kind).collect()
}

/// Executor ids attached to a drained event sequence, in order.
pub fn executor_ids(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.executor_id().map(|id| id.as_str().to_string()))
        .collect()
}

/// The payloads of all workflow-output events, in order.
pub fn output_payloads(events: &[Event]) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Output(out) => Some(out.payload.clone()),
            _ => None,
        })
        .collect()
}

/// The request id of the first request-info event, if any.
pub fn first_request_id(events: &[Event]) -> Option<relaygraph::types::RequestId> {
    events.iter().find_map(|e| match e {
        Event::Request(req) => Some(req.request.request_id.clone()),
        _ => None,
    })
}
