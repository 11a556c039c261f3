use std::fmt;
use thiserror::Error;

use super::event::Event;

/// Abstract event emitter handed to scheduler internals and handler contexts.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event in a synchronous, non-blocking manner.
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub closed")]
    Closed,
    #[error("event lag exceeded buffer; dropped {0} messages")]
    Lagged(usize),
    #[error("event emission failed: {0}")]
    Other(String),
}

impl EmitterError {
    pub fn other(error: impl Into<String>) -> Self {
        Self::Other(error.into())
    }
}

/// Emitter that appends to a shared in-memory buffer.
///
/// The subworkflow host uses this to collect an inner step's events for
/// translation into outer sends and yields.
#[derive(Clone, Debug, Default)]
pub struct CollectingEmitter {
    events: std::sync::Arc<parking_lot::Mutex<Vec<Event>>>,
}

impl CollectingEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything collected so far, in emission order.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventEmitter for CollectingEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.events.lock().push(event);
        Ok(())
    }
}
