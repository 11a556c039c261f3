//! Workflow runtime: run surface, streaming execution, configuration, and
//! the shared-resource policy.
//!
//! The runtime layers session management and event plumbing over the
//! scheduler:
//!
//! - **[`Runner`]** — builds the environment (event bus, checkpoint store)
//!   and opens runs
//! - **[`Run`]** — caller-driven execution: run to completion, inject
//!   messages, answer requests, restore checkpoints
//! - **[`StreamingRun`]** — background execution with an event stream and a
//!   control channel
//!
//! # Usage
//!
//! ```rust,no_run
//! use relaygraph::runtime::{Runner, RuntimeConfig};
//! use relaygraph::types::TypeId;
//! # use relaygraph::graph::Workflow;
//! # async fn example(workflow: Workflow) -> Result<(), Box<dyn std::error::Error>> {
//! let runner = Runner::with_config(workflow, RuntimeConfig::default()).await;
//! let run = runner.run(serde_json::json!("input"), TypeId::of("text")).await?;
//! assert!(run.phase().is_ended());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod runner;
pub(crate) mod shared;
pub mod streaming;
pub mod types;

pub use config::{EventBusConfig, RuntimeConfig, SinkConfig};
pub use runner::{Run, Runner};
pub use streaming::{RunReport, StreamingRun};
pub use types::{SessionId, StepNumber};

use miette::Diagnostic;
use thiserror::Error;
use tokio::task::JoinError;

use crate::checkpoint::CheckpointError;
use crate::gate::GateError;
use crate::graph::GraphError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;
use crate::types::RunPhase;

/// Errors surfaced by the run surface.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error("operation `{operation}` is not legal in phase {phase}")]
    #[diagnostic(
        code(relaygraph::runtime::invalid_phase),
        help("Messages may be injected only into idle or quiescent runs.")
    )]
    InvalidPhase {
        operation: &'static str,
        phase: RunPhase,
    },

    #[error("no checkpoint store is configured for this runner")]
    #[diagnostic(
        code(relaygraph::runtime::no_store),
        help("Configure a store with RuntimeConfig::with_store.")
    )]
    NoCheckpointStore,

    #[error("run control channel closed")]
    #[diagnostic(code(relaygraph::runtime::stream_closed))]
    StreamClosed,

    #[error("run task join error: {0}")]
    #[diagnostic(code(relaygraph::runtime::join))]
    Join(#[from] JoinError),
}
