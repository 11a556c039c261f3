//! # Relaygraph: Deterministic Message-Passing Workflow Runtime
//!
//! Relaygraph drives a graph of typed executors through discrete supersteps
//! until quiescence: messages produced in one step are delivered in the
//! next, every step is bounded by a barrier, and complete run state can be
//! captured into a tree of checkpoints and restored later — including runs
//! suspended on out-of-band request/response exchanges.
//!
//! ## Core Concepts
//!
//! - **Executors**: Named units that consume typed messages and produce
//!   sends, yields, and events
//! - **Envelopes**: Payloads tagged with a declared [`TypeId`] for routing
//!   and checkpoint portability
//! - **Edges**: Direct, conditional, fan-out, fan-in, and switch-case
//!   routing with deterministic expansion
//! - **Supersteps**: Barrier-bounded ticks; distinct executors run in
//!   parallel, the same executor never does
//! - **Checkpoints**: Serialized run state forming a per-session tree with
//!   branch-on-restore
//!
//! ## Building a Simple Workflow
//!
//! ```no_run
//! use std::sync::Arc;
//! use relaygraph::executor::{ExecutorRegistration, RoutedExecutor};
//! use relaygraph::graph::WorkflowBuilder;
//! use relaygraph::registry::TypeRegistry;
//! use relaygraph::router::value_handler_fn;
//! use relaygraph::runtime::Runner;
//! use relaygraph::types::TypeId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TypeRegistry::new());
//! registry.register("text")?;
//!
//! let echo = RoutedExecutor::builder("echo", Arc::clone(&registry))
//!     .on_with_output("text", "text", value_handler_fn(Ok))
//!     .build()?;
//!
//! let workflow = WorkflowBuilder::with_registry(registry)
//!     .add_executor(ExecutorRegistration::instance("echo", echo))
//!     .set_start("echo")
//!     .build()?;
//!
//! let runner = Runner::new(workflow).await;
//! let run = runner.run(serde_json::json!("hi"), TypeId::of("text")).await?;
//! println!("{:?}", run.outputs());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - Identifiers: executors, message types, ports, requests
//! - [`registry`] - Global and scoped type registries
//! - [`envelope`] - Message envelopes and targeted deliveries
//! - [`router`] - Typed handler tables with supertype fallback
//! - [`executor`] - Executor contract, protocol, registrations
//! - [`context`] - Handler capabilities: send, yield, state, requests
//! - [`graph`] - Workflow definition and edge routing
//! - [`scheduler`] - The superstep engine
//! - [`gate`] - External request/response correlation
//! - [`subworkflow`] - Workflows embedded as executors
//! - [`checkpoint`] - Capture, storage back-ends, restoration
//! - [`runtime`] - Runner, runs, streaming, configuration
//! - [`event_bus`] - Event fan-out, sinks, and subscriber streams
//!
//! [`TypeId`]: types::TypeId

pub mod checkpoint;
pub mod context;
pub mod envelope;
pub mod event_bus;
pub mod executor;
pub mod gate;
pub mod graph;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod subworkflow;
pub mod telemetry;
pub mod types;
pub mod util;
