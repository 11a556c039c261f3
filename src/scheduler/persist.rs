//! Capture and restore of scheduler run state.
//!
//! Pure data transformation between the in-memory [`SchedulerCore`] and the
//! serde-friendly [`PersistedRunState`] shape the checkpoint engine encodes.
//! Live suspended invocations cannot be serialized; their identity survives
//! through the outstanding-request records, and a response that arrives
//! after restoration re-enters the origin executor's router.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::{StateKey, StateScope};
use crate::envelope::Delivery;
use crate::executor::ExecutorError;
use crate::gate::ExternalRequest;
use crate::registry::RegistryError;
use crate::types::{ExecutorId, RunPhase, TypeId};

use super::SchedulerCore;

/// Serde shape of a run's execution state at a step boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRunState {
    pub step: u64,
    pub phase: RunPhase,
    pub pending_deliveries: Vec<Delivery>,
    pub outstanding_requests: Vec<ExternalRequest>,
    /// Opaque executor snapshots keyed by executor id, sorted at capture.
    pub executor_states: FxHashMap<String, Value>,
    pub state_bag: Vec<PersistedStateEntry>,
}

/// One state-bag entry with its scope key flattened for serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedStateEntry {
    pub scope: StateScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorId>,
    pub key: String,
    pub value: Value,
}

impl PersistedRunState {
    /// Every type id referenced by the captured messages and requests; the
    /// restoring process must know them all.
    #[must_use]
    pub fn type_fingerprint(&self) -> Vec<TypeId> {
        let mut ids: Vec<TypeId> = self
            .pending_deliveries
            .iter()
            .map(|d| d.envelope.type_id.clone())
            .chain(self.outstanding_requests.iter().map(|r| r.type_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Failures while rebuilding a run from captured state.
#[derive(Debug, Error, Diagnostic)]
pub enum RestoreError {
    #[error("captured state references executor `{id}` that is not registered")]
    #[diagnostic(
        code(relaygraph::restore::unknown_executor),
        help("The restoring workflow must register every executor the captured run used.")
    )]
    UnknownExecutor { id: ExecutorId },

    #[error("executor `{id}` failed to restore its captured state")]
    #[diagnostic(code(relaygraph::restore::executor))]
    Executor {
        id: ExecutorId,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),
}

impl SchedulerCore {
    /// Capture the run state at the current step boundary.
    ///
    /// Invokes `on_checkpointing` on every instantiated executor, in id
    /// order, so snapshots are deterministic.
    pub(crate) async fn capture_run_state(
        &mut self,
    ) -> Result<PersistedRunState, ExecutorError> {
        let mut executor_states = FxHashMap::default();
        for (id, executor) in self.instantiated() {
            let ctx = self.hook_context(&id);
            let snapshot = executor.on_checkpointing(&ctx).await?;
            if !snapshot.is_null() {
                executor_states.insert(id.as_str().to_string(), snapshot);
            }
        }

        let state_bag = self
            .state
            .entries()
            .into_iter()
            .map(|(key, value)| PersistedStateEntry {
                scope: key.scope,
                executor: key.executor,
                key: key.key,
                value,
            })
            .collect();

        Ok(PersistedRunState {
            step: self.step_number(),
            phase: self.phase(),
            pending_deliveries: self.pending_snapshot(),
            outstanding_requests: self.outstanding_snapshot(),
            executor_states,
            state_bag,
        })
    }

    /// Rebuild this core from captured state.
    ///
    /// Validates the type fingerprint, rehydrates executors through their
    /// factories and `on_restored`, reinstalls request correlation, and
    /// resumes in the recorded phase. Restoring the same state twice yields
    /// identical cores.
    pub(crate) async fn restore_run_state(
        &mut self,
        persisted: PersistedRunState,
    ) -> Result<(), RestoreError> {
        self.workflow
            .registry()
            .validate_fingerprint(&persisted.type_fingerprint())?;

        self.set_step(persisted.step);
        self.set_pending(persisted.pending_deliveries);

        self.state.replace(
            persisted
                .state_bag
                .into_iter()
                .map(|entry| {
                    (
                        StateKey {
                            scope: entry.scope,
                            executor: entry.executor,
                            key: entry.key,
                        },
                        entry.value,
                    )
                })
                .collect(),
        );

        let mut states: Vec<(String, Value)> = persisted.executor_states.into_iter().collect();
        states.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (id, snapshot) in states {
            let id = ExecutorId::from(id);
            if self.workflow.registration(&id).is_none() {
                return Err(RestoreError::UnknownExecutor { id });
            }
            let executor = self
                .instance(&id)
                .await
                .map_err(|err| RestoreError::Executor {
                    id: id.clone(),
                    source: ExecutorError::msg(err.to_string()),
                })?;
            let ctx = self.hook_context(&id);
            executor
                .on_restored(snapshot, &ctx)
                .await
                .map_err(|source| RestoreError::Executor {
                    id: id.clone(),
                    source,
                })?;
            self.mark_initialized(&id);
        }

        self.reinstall_requests(persisted.outstanding_requests);
        self.set_phase(persisted.phase);
        Ok(())
    }
}
