//! Workflow definition: executors, edges, ports, and the builder.
//!
//! A [`Workflow`] is the immutable topology the scheduler drives. The
//! [`WorkflowBuilder`] validates it at build time: unique executor ids,
//! known edge endpoints, bound placeholders, non-degenerate fan-ins and
//! switches.

pub mod builder;
pub mod edges;
pub mod workflow;

pub use builder::{GraphError, WorkflowBuilder};
pub use edges::{
    Edge, EdgePredicate, FanInPredicate, FanOutMode, FanOutTarget, SwitchBuilder, SwitchCase,
};
pub use workflow::{OwnershipToken, ProtocolDescriptor, Workflow};

pub(crate) use builder::SUBWORKFLOW_TICK_TYPE;
