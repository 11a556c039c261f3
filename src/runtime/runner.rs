//! Run surface: open, run, stream, resume.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::checkpoint::{
    CheckpointInfo, CheckpointManager, CheckpointStore, CheckpointStoreType,
    InMemoryCheckpointStore,
};
use crate::event_bus::{Event, EventBus, EventStream, STREAM_END_SCOPE};
use crate::gate::ExternalResponse;
use crate::graph::Workflow;
use crate::registry::TypeRegistry;
use crate::scheduler::SchedulerCore;
use crate::types::{RunPhase, TypeId};
use crate::util::ids::IdGenerator;

use super::config::RuntimeConfig;
use super::streaming::{drive_streaming, ControlMsg, StreamingRun};
use super::RunError;

/// Runtime execution engine for a compiled workflow.
///
/// The runner owns the runtime environment around the graph: the event bus
/// with its sinks, the checkpoint store, and session identity. One workflow
/// can be served by several runners with different event configurations
/// (e.g. one per client connection).
///
/// # Example
///
/// ```rust,no_run
/// use relaygraph::runtime::{Runner, RuntimeConfig};
/// use relaygraph::types::TypeId;
/// # use relaygraph::graph::Workflow;
/// # async fn example(workflow: Workflow) -> Result<(), Box<dyn std::error::Error>> {
/// let runner = Runner::new(workflow).await;
/// let run = runner.run(serde_json::json!("hi"), TypeId::of("text")).await?;
/// println!("outputs: {:?}", run.outputs());
/// # Ok(())
/// # }
/// ```
pub struct Runner {
    workflow: Arc<Workflow>,
    config: RuntimeConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    event_bus: EventBus,
    event_stream_taken: bool,
    ids: IdGenerator,
}

impl Runner {
    /// Runner with the default configuration (in-memory store, stdout bus).
    pub async fn new(workflow: Workflow) -> Self {
        Self::with_config(workflow, RuntimeConfig::default()).await
    }

    pub async fn with_config(workflow: Workflow, config: RuntimeConfig) -> Self {
        let bus = config.event_bus.build_event_bus();
        Self::with_config_and_bus(workflow, config, bus, true).await
    }

    /// Runner with a caller-supplied event bus for custom sinks.
    ///
    /// This is the entry point for streaming events to web clients: build
    /// an [`EventBus`] with a
    /// [`ChannelSink`](crate::event_bus::ChannelSink) and pass it here.
    pub async fn with_config_and_bus(
        workflow: Workflow,
        config: RuntimeConfig,
        event_bus: EventBus,
        start_listener: bool,
    ) -> Self {
        // First scheduler construction in the process freezes the global
        // type registry; scoped registries are unaffected.
        TypeRegistry::global().seal();
        let store = Self::create_store(&config).await;
        if start_listener {
            event_bus.listen_for_events();
        }
        Self {
            workflow: Arc::new(workflow),
            config,
            store,
            event_bus,
            event_stream_taken: false,
            ids: IdGenerator::new(),
        }
    }

    async fn create_store(config: &RuntimeConfig) -> Option<Arc<dyn CheckpointStore>> {
        match &config.store {
            None => None,
            Some(CheckpointStoreType::InMemory) => Some(Arc::new(InMemoryCheckpointStore::new())),
            #[cfg(feature = "sqlite")]
            Some(CheckpointStoreType::Sqlite) => {
                let db_url = std::env::var("RELAYGRAPH_SQLITE_URL")
                    .ok()
                    .or_else(|| {
                        config
                            .sqlite_db_name
                            .as_ref()
                            .map(|name| format!("sqlite://{name}"))
                    })
                    .unwrap_or_else(|| "sqlite://relaygraph.db".to_string());
                // The sqlite driver wants the file to exist before connect.
                if let Some(path) = db_url.strip_prefix("sqlite://") {
                    let path = path.trim();
                    if !path.is_empty() && path != ":memory:" {
                        let p = std::path::Path::new(path);
                        if let Some(parent) = p.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        if !p.exists() {
                            let _ = std::fs::File::create_new(p);
                        }
                    }
                }
                match crate::checkpoint::SqliteCheckpointStore::connect(&db_url).await {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn CheckpointStore>),
                    Err(err) => {
                        tracing::error!(
                            target: "relaygraph::runtime",
                            url = %db_url,
                            error = %err,
                            "sqlite checkpoint store initialization failed; checkpointing disabled"
                        );
                        None
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn workflow(&self) -> Arc<Workflow> {
        Arc::clone(&self.workflow)
    }

    #[must_use]
    pub fn checkpoint_store(&self) -> Option<Arc<dyn CheckpointStore>> {
        self.store.clone()
    }

    /// Subscribe to the runner's event stream. May be taken once.
    pub fn event_stream(&mut self) -> EventStream {
        if self.event_stream_taken {
            panic!("event stream already requested for this runner");
        }
        self.event_stream_taken = true;
        self.event_bus.subscribe()
    }

    fn session_id(&self, explicit: Option<String>) -> String {
        explicit
            .or_else(|| self.config.session_id.clone())
            .unwrap_or_else(|| self.ids.generate_session_id())
    }

    fn build_core(&self, session_id: &str) -> SchedulerCore {
        let run_id = self.ids.generate_run_id();
        tracing::debug!(
            target: "relaygraph::runtime",
            session = %session_id,
            run = %run_id,
            "opening run"
        );
        match self.config.concurrency {
            Some(limit) => SchedulerCore::with_concurrency(
                Arc::clone(&self.workflow),
                run_id,
                self.event_bus.get_emitter(),
                limit,
            ),
            None => SchedulerCore::new(
                Arc::clone(&self.workflow),
                run_id,
                self.event_bus.get_emitter(),
            ),
        }
    }

    /// Open a run without executing any step.
    pub async fn open(&self, session_id: Option<String>) -> Result<Run, RunError> {
        let session_id = self.session_id(session_id);
        let core = self.build_core(&session_id);
        let manager = self
            .store
            .clone()
            .map(|store| CheckpointManager::new(store, session_id.clone()));
        Ok(Run {
            core,
            manager,
            session_id,
            autosave: self.config.autosave,
        })
    }

    /// Drive a workflow to termination over one input.
    #[instrument(skip(self, payload), err)]
    pub async fn run(&self, payload: Value, type_id: TypeId) -> Result<Run, RunError> {
        let mut run = self.open(None).await?;
        run.core.inject(payload, type_id);
        run.drive().await?;
        self.finalize_event_stream(&run.session_id, run.phase());
        Ok(run)
    }

    /// Drive a workflow on a background task, exposing control and events.
    pub fn stream(&self, payload: Value, type_id: TypeId) -> Result<StreamingRun, RunError> {
        let session_id = self.session_id(None);
        let mut core = self.build_core(&session_id);
        core.inject(payload, type_id);
        let manager = self
            .store
            .clone()
            .map(|store| CheckpointManager::new(store, session_id.clone()));
        let (control_tx, control_rx) = flume::unbounded::<ControlMsg>();
        let emitter = self.event_bus.get_emitter();
        let events = self.event_bus.subscribe();
        let autosave = self.config.autosave;
        let loop_session = session_id.clone();
        let handle = tokio::spawn(async move {
            drive_streaming(core, manager, autosave, control_rx, emitter, loop_session).await
        });
        Ok(StreamingRun::new(session_id, control_tx, events, handle))
    }

    /// Restore a run from a checkpoint and return it without stepping.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, info: &CheckpointInfo) -> Result<Run, RunError> {
        let mut run = self.open(Some(info.session_id.clone())).await?;
        let manager = run.manager.as_ref().ok_or(RunError::NoCheckpointStore)?;
        manager.restore(&mut run.core, info).await?;
        Ok(run)
    }

    fn finalize_event_stream(&self, session_id: &str, phase: RunPhase) {
        let message = format!("session={session_id} status={phase}");
        if let Err(err) = self
            .event_bus
            .get_emitter()
            .emit(Event::diagnostic(STREAM_END_SCOPE, message.clone()))
        {
            tracing::debug!(
                session = %session_id,
                scope = STREAM_END_SCOPE,
                completion_message = %message,
                error = ?err,
                "failed to emit stream termination event"
            );
        }
    }
}

/// A run owned by the caller, driven to quiescence between control calls.
///
/// A run is in exactly one of three modes: actively stepping (inside a
/// `drive`), paused awaiting an external response, or ended.
pub struct Run {
    core: SchedulerCore,
    manager: Option<CheckpointManager>,
    session_id: String,
    autosave: bool,
}

impl Run {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.core.phase()
    }

    /// Number of supersteps executed so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.core.step_number()
    }

    /// Payloads yielded so far, in emission order.
    #[must_use]
    pub fn outputs(&self) -> &[Value] {
        self.core.outputs()
    }

    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.core.outstanding_requests()
    }

    /// Drive supersteps until quiescence, error, or an awaited response.
    pub async fn run_to_completion(&mut self) -> Result<RunPhase, RunError> {
        self.drive().await?;
        Ok(self.core.phase())
    }

    /// Inject a new input message; legal only when the run is idle or has
    /// reached quiescence. Drives the run afterwards.
    pub async fn send_message(&mut self, payload: Value, type_id: TypeId) -> Result<(), RunError> {
        match self.core.phase() {
            RunPhase::Idle | RunPhase::Terminal => {
                self.core.inject(payload, type_id);
                self.drive().await
            }
            phase => Err(RunError::InvalidPhase {
                operation: "send_message",
                phase,
            }),
        }
    }

    /// Satisfy an outstanding external request, then drive the run.
    pub async fn send_response(&mut self, response: ExternalResponse) -> Result<(), RunError> {
        self.core.apply_response(response)?;
        self.drive().await
    }

    /// Cooperatively cancel the run and drain in-flight work.
    pub async fn cancel(&mut self) {
        self.core.cancel();
        self.core.drain_cancelled().await;
        self.core.release_instances().await;
    }

    /// Index of this session's checkpoints.
    pub async fn current_checkpoints(&self) -> Result<Vec<CheckpointInfo>, RunError> {
        let manager = self.manager.as_ref().ok_or(RunError::NoCheckpointStore)?;
        Ok(manager.index(None).await?)
    }

    /// Replace this run's state with a stored checkpoint.
    pub async fn restore_checkpoint(&mut self, info: &CheckpointInfo) -> Result<(), RunError> {
        let manager = self.manager.as_ref().ok_or(RunError::NoCheckpointStore)?;
        manager.restore(&mut self.core, info).await?;
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), RunError> {
        loop {
            if self.core.cancel_requested() {
                self.core.drain_cancelled().await;
                break;
            }
            if !self.core.has_work() {
                break;
            }
            let manager = if self.autosave {
                self.manager.as_ref()
            } else {
                None
            };
            let outcome = self.core.step_once(manager).await?;
            if outcome.cancelled || outcome.failed || outcome.terminal {
                break;
            }
        }
        if self.core.phase().is_ended() {
            self.core.release_instances().await;
        }
        Ok(())
    }
}
