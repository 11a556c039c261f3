//! Immutable, compiled workflow: executors, edges, ports, and sharing state.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::executor::{Executor, ExecutorRegistration, RegistrationKind};
use crate::registry::TypeRegistry;
use crate::types::{ExecutorId, PortId, TypeId};

use super::edges::Edge;
use super::GraphError;

/// Workflow-level protocol summary aggregated from registered executors.
///
/// Factory-backed registrations contribute only once instantiated, so the
/// descriptor reflects what is statically known at build time.
#[derive(Clone, Debug, Default)]
pub struct ProtocolDescriptor {
    pub accepts: FxHashSet<TypeId>,
    pub sends: FxHashSet<TypeId>,
    pub yields: FxHashSet<TypeId>,
}

/// A compiled workflow graph, immutable once built.
///
/// The workflow owns declarative state only: registrations, edges, ports,
/// and the caches backing the shared-resource policy. Execution state lives
/// in the scheduler; event configuration lives in the runner.
pub struct Workflow {
    pub(crate) registrations: FxHashMap<ExecutorId, ExecutorRegistration>,
    /// Executor ids in declaration order; the deterministic iteration basis.
    pub(crate) order: Vec<ExecutorId>,
    pub(crate) edges: Vec<Edge>,
    /// Indices into `edges` per single-source edge, declaration-ordered.
    pub(crate) edges_by_source: FxHashMap<ExecutorId, Vec<usize>>,
    /// Indices of fan-in edges.
    pub(crate) fan_in_indices: Vec<usize>,
    pub(crate) start: ExecutorId,
    pub(crate) ports: Arc<FxHashSet<PortId>>,
    pub(crate) registry: Arc<TypeRegistry>,
    /// One instance per workflow for concurrent-shareable registrations.
    pub(crate) shared_instances: tokio::sync::Mutex<FxHashMap<ExecutorId, Arc<dyn Executor>>>,
    /// Instances returned by completed runs, awaiting reuse after reset().
    pub(crate) reset_pool: parking_lot::Mutex<FxHashMap<ExecutorId, Vec<Arc<dyn Executor>>>>,
    owned: AtomicBool,
}

impl Workflow {
    pub(crate) fn assemble(
        registrations: FxHashMap<ExecutorId, ExecutorRegistration>,
        order: Vec<ExecutorId>,
        edges: Vec<Edge>,
        start: ExecutorId,
        ports: FxHashSet<PortId>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        let mut edges_by_source: FxHashMap<ExecutorId, Vec<usize>> = FxHashMap::default();
        let mut fan_in_indices = Vec::new();
        for (idx, edge) in edges.iter().enumerate() {
            match edge.single_source() {
                Some(source) => edges_by_source.entry(source.clone()).or_default().push(idx),
                None => fan_in_indices.push(idx),
            }
        }
        Self {
            registrations,
            order,
            edges,
            edges_by_source,
            fan_in_indices,
            start,
            ports: Arc::new(ports),
            registry,
            shared_instances: tokio::sync::Mutex::new(FxHashMap::default()),
            reset_pool: parking_lot::Mutex::new(FxHashMap::default()),
            owned: AtomicBool::new(false),
        }
    }

    /// The designated start executor that receives run input.
    #[must_use]
    pub fn start(&self) -> &ExecutorId {
        &self.start
    }

    #[must_use]
    pub fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn registration(&self, id: &ExecutorId) -> Option<&ExecutorRegistration> {
        self.registrations.get(id)
    }

    /// Executor ids in declaration order.
    #[must_use]
    pub fn executor_ids(&self) -> &[ExecutorId] {
        &self.order
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn ports(&self) -> &FxHashSet<PortId> {
        &self.ports
    }

    /// Edge indices (into [`edges`](Self::edges)) whose single source is `id`.
    #[must_use]
    pub(crate) fn edge_indices_from(&self, id: &ExecutorId) -> &[usize] {
        self.edges_by_source
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[must_use]
    pub(crate) fn fan_in_indices(&self) -> &[usize] {
        &self.fan_in_indices
    }

    /// Aggregate the statically known protocol surface of the workflow.
    #[must_use]
    pub fn descriptor(&self) -> ProtocolDescriptor {
        let mut descriptor = ProtocolDescriptor::default();
        for id in &self.order {
            if let Some(reg) = self.registrations.get(id) {
                let protocol = match &reg.kind {
                    RegistrationKind::Instance(executor) => Some(executor.protocol().clone()),
                    RegistrationKind::Port(spec) => Some(
                        crate::executor::Protocol::new()
                            .accept(spec.accepts.clone())
                            .send(spec.response_type.clone())
                            .yield_type(spec.response_type.clone()),
                    ),
                    _ => None,
                };
                if let Some(p) = protocol {
                    descriptor.accepts.extend(p.accepts);
                    descriptor.sends.extend(p.sends);
                    descriptor.yields.extend(p.yields);
                }
            }
        }
        descriptor
    }

    /// Claim exclusive ownership for embedding as a subworkflow.
    ///
    /// A workflow can be hosted by at most one parent; a second claim is
    /// refused.
    pub fn claim_ownership(self: &Arc<Self>) -> Result<OwnershipToken, GraphError> {
        if self.owned.swap(true, Ordering::SeqCst) {
            return Err(GraphError::OwnershipClaimed);
        }
        Ok(OwnershipToken {
            workflow: Arc::clone(self),
        })
    }

    pub(crate) fn pool_take(&self, id: &ExecutorId) -> Option<Arc<dyn Executor>> {
        self.reset_pool.lock().get_mut(id).and_then(Vec::pop)
    }

    pub(crate) fn pool_return(&self, id: &ExecutorId, executor: Arc<dyn Executor>) {
        self.reset_pool
            .lock()
            .entry(id.clone())
            .or_default()
            .push(executor);
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("start", &self.start)
            .field("executors", &self.order)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

/// Exclusive ownership handle over an embedded workflow.
///
/// Held by a subworkflow registration; dropping it releases the claim.
pub struct OwnershipToken {
    workflow: Arc<Workflow>,
}

impl OwnershipToken {
    #[must_use]
    pub fn workflow(&self) -> Arc<Workflow> {
        Arc::clone(&self.workflow)
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.workflow.owned.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for OwnershipToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipToken")
            .field("start", &self.workflow.start)
            .finish()
    }
}
