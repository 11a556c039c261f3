//! WorkflowBuilder: fluent construction and build-time validation.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::executor::{ExecutorRegistration, RegistrationKind};
use crate::registry::TypeRegistry;
use crate::types::{ExecutorId, PortId};

use super::edges::{
    Edge, EdgePredicate, FanInPredicate, FanOutMode, FanOutTarget, SwitchBuilder,
};
use super::workflow::Workflow;

/// Declared type of the internal control message a subworkflow host sends
/// itself to keep driving its inner scheduler.
pub(crate) const SUBWORKFLOW_TICK_TYPE: &str = "relaygraph.subworkflow.tick";

/// Build-time validation failures.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("executor id `{id}` is registered twice")]
    #[diagnostic(
        code(relaygraph::graph::duplicate_executor),
        help("Executor ids must be unique within a workflow.")
    )]
    DuplicateExecutor { id: ExecutorId },

    #[error("{role} references unknown executor `{id}`")]
    #[diagnostic(
        code(relaygraph::graph::unknown_executor),
        help("Register `{id}` with add_executor before wiring edges to it.")
    )]
    UnknownExecutor { id: ExecutorId, role: &'static str },

    #[error("no start executor set")]
    #[diagnostic(
        code(relaygraph::graph::start_not_set),
        help("Call set_start with the executor that should receive run input.")
    )]
    StartNotSet,

    #[error("placeholder registration `{id}` was never bound")]
    #[diagnostic(
        code(relaygraph::graph::unbound_placeholder),
        help("Bind the placeholder with bind_placeholder before build().")
    )]
    UnboundPlaceholder { id: ExecutorId },

    #[error("fan-in targeting `{target}` declares no sources")]
    #[diagnostic(code(relaygraph::graph::empty_fan_in))]
    EmptyFanIn { target: ExecutorId },

    #[error("fan-in targeting `{target}` declares duplicate source `{from}`")]
    #[diagnostic(code(relaygraph::graph::duplicate_fan_in_source))]
    DuplicateFanInSource {
        target: ExecutorId,
        from: ExecutorId,
    },

    #[error("switch from `{from}` has no cases and no default")]
    #[diagnostic(code(relaygraph::graph::empty_switch))]
    EmptySwitch { from: ExecutorId },

    #[error("chain needs at least two executors")]
    #[diagnostic(code(relaygraph::graph::short_chain))]
    ShortChain,

    #[error("workflow is already owned by another host")]
    #[diagnostic(
        code(relaygraph::graph::ownership_claimed),
        help("A workflow can be embedded under exactly one subworkflow host.")
    )]
    OwnershipClaimed,
}

/// Fluent builder producing an immutable [`Workflow`].
///
/// # Examples
///
/// ```no_run
/// use relaygraph::graph::WorkflowBuilder;
/// use relaygraph::executor::ExecutorRegistration;
/// # fn executor() -> relaygraph::executor::ExecutorRegistration { unimplemented!() }
///
/// let workflow = WorkflowBuilder::new()
///     .add_executor(executor())
///     .set_start("source")
///     .build()
///     .unwrap();
/// ```
pub struct WorkflowBuilder {
    registrations: FxHashMap<ExecutorId, ExecutorRegistration>,
    order: Vec<ExecutorId>,
    edges: Vec<Edge>,
    ports: FxHashSet<PortId>,
    start: Option<ExecutorId>,
    registry: Arc<TypeRegistry>,
    error: Option<GraphError>,
}

impl WorkflowBuilder {
    /// Builder backed by the process-global type registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(TypeRegistry::global())
    }

    /// Builder backed by a scoped registry (isolated tests, embedding).
    #[must_use]
    pub fn with_registry(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registrations: FxHashMap::default(),
            order: Vec::new(),
            edges: Vec::new(),
            ports: FxHashSet::default(),
            start: None,
            registry,
            error: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Register an executor. Duplicate ids fail the build.
    #[must_use]
    pub fn add_executor(mut self, registration: ExecutorRegistration) -> Self {
        if self.error.is_some() {
            return self;
        }
        let id = registration.id.clone();
        if self.registrations.contains_key(&id) {
            self.error = Some(GraphError::DuplicateExecutor { id });
            return self;
        }
        if let RegistrationKind::Port(spec) = &registration.kind {
            self.ports.insert(spec.port.clone());
        }
        self.order.push(id.clone());
        self.registrations.insert(id, registration);
        self
    }

    /// Replace a placeholder registration with a concrete kind.
    #[must_use]
    pub fn bind_placeholder(
        mut self,
        id: impl Into<ExecutorId>,
        kind: RegistrationKind,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let id = id.into();
        match self.registrations.get_mut(&id) {
            Some(reg) if reg.is_placeholder() => {
                if let RegistrationKind::Port(spec) = &kind {
                    self.ports.insert(spec.port.clone());
                }
                reg.kind = kind;
            }
            Some(_) => {
                self.error = Some(GraphError::DuplicateExecutor { id });
            }
            None => {
                self.error = Some(GraphError::UnknownExecutor {
                    id,
                    role: "bind_placeholder",
                });
            }
        }
        self
    }

    /// Unconditional `source → target` edge.
    #[must_use]
    pub fn add_edge(
        mut self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
    ) -> Self {
        self.edges.push(Edge::Direct {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// `source → target` gated by `predicate`.
    #[must_use]
    pub fn add_conditional_edge(
        mut self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        predicate: EdgePredicate,
    ) -> Self {
        self.edges.push(Edge::Conditional {
            source: source.into(),
            target: target.into(),
            predicate,
        });
        self
    }

    /// Unconditional fan-out to every listed target.
    #[must_use]
    pub fn add_fan_out<I, T>(self, source: impl Into<ExecutorId>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
    {
        let targets = targets
            .into_iter()
            .map(|t| FanOutTarget::unconditional(t))
            .collect();
        self.add_fan_out_with(source, targets, FanOutMode::AnyMatching)
    }

    /// Fan-out with per-target conditions and an explicit saturation mode.
    #[must_use]
    pub fn add_fan_out_with(
        mut self,
        source: impl Into<ExecutorId>,
        targets: Vec<FanOutTarget>,
        mode: FanOutMode,
    ) -> Self {
        self.edges.push(Edge::FanOut {
            source: source.into(),
            targets,
            mode,
        });
        self
    }

    /// Fan-in that fires once every source has contributed within a step.
    #[must_use]
    pub fn add_fan_in<I, S>(self, sources: I, target: impl Into<ExecutorId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        self.add_fan_in_inner(sources, target, None)
    }

    /// Fan-in with a completion predicate that may fire the aggregate early.
    #[must_use]
    pub fn add_fan_in_with<I, S>(
        self,
        sources: I,
        target: impl Into<ExecutorId>,
        completion: FanInPredicate,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        self.add_fan_in_inner(sources, target, Some(completion))
    }

    fn add_fan_in_inner<I, S>(
        mut self,
        sources: I,
        target: impl Into<ExecutorId>,
        completion: Option<FanInPredicate>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        self.edges.push(Edge::FanIn {
            sources: sources.into_iter().map(Into::into).collect(),
            target: target.into(),
            completion,
        });
        self
    }

    /// Switch-case edge; see [`SwitchBuilder`].
    #[must_use]
    pub fn add_switch(mut self, source: impl Into<ExecutorId>, cases: SwitchBuilder) -> Self {
        let (cases, default) = cases.into_parts();
        self.edges.push(Edge::Switch {
            source: source.into(),
            cases,
            default,
        });
        self
    }

    /// Chain sugar: direct edges between consecutive executors.
    #[must_use]
    pub fn add_chain<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        let ids: Vec<ExecutorId> = ids.into_iter().map(Into::into).collect();
        if ids.len() < 2 {
            if self.error.is_none() {
                self.error = Some(GraphError::ShortChain);
            }
            return self;
        }
        for pair in ids.windows(2) {
            self.edges.push(Edge::Direct {
                source: pair[0].clone(),
                target: pair[1].clone(),
            });
        }
        self
    }

    /// Register a request port usable by any executor's context.
    #[must_use]
    pub fn add_port(mut self, port: impl Into<PortId>) -> Self {
        self.ports.insert(port.into());
        self
    }

    /// Designate the executor that receives run input.
    #[must_use]
    pub fn set_start(mut self, id: impl Into<ExecutorId>) -> Self {
        self.start = Some(id.into());
        self
    }

    /// Validate and freeze the workflow.
    pub fn build(self) -> Result<Workflow, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let start = self.start.ok_or(GraphError::StartNotSet)?;
        if !self.registrations.contains_key(&start) {
            return Err(GraphError::UnknownExecutor {
                id: start,
                role: "start",
            });
        }
        for (id, reg) in &self.registrations {
            if reg.is_placeholder() {
                return Err(GraphError::UnboundPlaceholder { id: id.clone() });
            }
        }
        for edge in &self.edges {
            for id in edge.referenced_ids() {
                if !self.registrations.contains_key(id) {
                    return Err(GraphError::UnknownExecutor {
                        id: id.clone(),
                        role: "edge",
                    });
                }
            }
            match edge {
                Edge::FanIn {
                    sources, target, ..
                } => {
                    if sources.is_empty() {
                        return Err(GraphError::EmptyFanIn {
                            target: target.clone(),
                        });
                    }
                    let mut seen = FxHashSet::default();
                    for source in sources {
                        if !seen.insert(source) {
                            return Err(GraphError::DuplicateFanInSource {
                                target: target.clone(),
                                from: source.clone(),
                            });
                        }
                    }
                }
                Edge::Switch { source, cases, default } => {
                    if cases.is_empty() && default.is_none() {
                        return Err(GraphError::EmptySwitch {
                            from: source.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        // Internal control and aggregate types participate in deliveries and
        // checkpoints, so they must resolve in the registry backing this
        // workflow. Registration is idempotent.
        let _ = self.registry.register(SUBWORKFLOW_TICK_TYPE);
        let _ = self
            .registry
            .register(crate::scheduler::FAN_IN_AGGREGATE_TYPE);

        Ok(Workflow::assemble(
            self.registrations,
            self.order,
            self.edges,
            start,
            self.ports,
            self.registry,
        ))
    }
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
