//! Runtime configuration: session identity, checkpoint store selection,
//! event bus shape.

use crate::checkpoint::CheckpointStoreType;
use crate::event_bus::{EventBus, EventSink, MemorySink, StdOutSink};
use crate::util::ids::IdGenerator;

/// Configuration applied when a [`Runner`](crate::runtime::Runner) is built.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Session id for checkpoints; generated when not provided.
    pub session_id: Option<String>,
    /// Which checkpoint store to construct; `None` disables checkpointing.
    pub store: Option<CheckpointStoreType>,
    /// SQLite database file, resolved from the environment when absent.
    pub sqlite_db_name: Option<String>,
    /// Capture a checkpoint at every step boundary.
    pub autosave: bool,
    /// Parallel-executor limit per step; defaults to available parallelism.
    pub concurrency: Option<usize>,
    pub event_bus: EventBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_id: Some(IdGenerator::new().generate_session_id()),
            store: Some(CheckpointStoreType::InMemory),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
            autosave: true,
            concurrency: None,
            event_bus: EventBusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if let Some(name) = provided {
            return Some(name);
        }
        dotenvy::dotenv().ok();
        Some(
            std::env::var("RELAYGRAPH_SQLITE_DB").unwrap_or_else(|_| "relaygraph.db".to_string()),
        )
    }

    #[must_use]
    pub fn new(
        session_id: Option<String>,
        store: Option<CheckpointStoreType>,
        sqlite_db_name: Option<String>,
    ) -> Self {
        Self {
            session_id,
            store,
            sqlite_db_name: Self::resolve_sqlite_db_name(sqlite_db_name),
            autosave: true,
            concurrency: None,
            event_bus: EventBusConfig::default(),
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: CheckpointStoreType) -> Self {
        self.store = Some(store);
        self
    }

    /// Disable checkpointing entirely.
    #[must_use]
    pub fn without_checkpoints(mut self) -> Self {
        self.store = None;
        self
    }

    #[must_use]
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_stdout_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_stdout_only())
    }

    #[must_use]
    pub fn with_memory_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_memory_sink())
    }
}

/// Declarative sink selection for the default event bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

/// Shape of the event bus a runner constructs.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub buffer_capacity: usize,
    pub sinks: Vec<SinkConfig>,
}

impl EventBusConfig {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(buffer_capacity: usize, sinks: Vec<SinkConfig>) -> Self {
        Self {
            buffer_capacity: if buffer_capacity == 0 {
                Self::DEFAULT_BUFFER_CAPACITY
            } else {
                buffer_capacity
            },
            sinks,
        }
    }

    #[must_use]
    pub fn with_stdout_only() -> Self {
        Self::new(Self::DEFAULT_BUFFER_CAPACITY, vec![SinkConfig::StdOut])
    }

    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self::new(
            Self::DEFAULT_BUFFER_CAPACITY,
            vec![SinkConfig::StdOut, SinkConfig::Memory],
        )
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    pub(crate) fn build_event_bus(&self) -> EventBus {
        let sinks: Vec<Box<dyn EventSink>> = self
            .sinks
            .iter()
            .map(|sink| match sink {
                SinkConfig::StdOut => Box::new(StdOutSink::default()) as Box<dyn EventSink>,
                SinkConfig::Memory => Box::new(MemorySink::new()) as Box<dyn EventSink>,
            })
            .collect();
        EventBus::with_capacity(sinks, self.buffer_capacity)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::with_stdout_only()
    }
}
