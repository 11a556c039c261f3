//! Broadcast point between a run and its event consumers.
//!
//! The hub is deliberately small: the scheduler publishes, sink workers and
//! callers subscribe, and the runtime closes the hub when it tears down.
//! A bounded broadcast channel sits underneath so a slow subscriber can
//! never stall a step; whatever a subscriber misses past the buffer is
//! counted rather than silently ignored, and the count is shared between
//! the hub and every stream it hands out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};

use super::emitter::{EmitterError, EventEmitter};
use super::event::Event;

/// Snapshot of hub health for monitoring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHubMetrics {
    /// Events buffered per subscriber before overflow discards the oldest.
    pub capacity: usize,
    /// Total events lost to slow or absent subscribers.
    pub dropped: usize,
}

/// Fan-out point for a run's events.
///
/// Publishing never blocks. An event published while no subscriber exists
/// is a counted drop, not an error; only a closed hub refuses events.
#[derive(Debug)]
pub struct EventHub {
    sender: Mutex<Option<Sender<Event>>>,
    dropped: Arc<AtomicUsize>,
    capacity: usize,
}

impl EventHub {
    /// `capacity` is clamped to at least 1 to satisfy the broadcast API.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            dropped: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Publish an event to every live subscriber.
    ///
    /// Returns [`EmitterError::Closed`] only after [`close`](Self::close).
    pub fn publish(&self, event: Event) -> Result<(), EmitterError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(EmitterError::Closed);
        };
        if sender.send(event).is_err() {
            // No subscriber right now; the event is gone but the hub is
            // healthy.
            record_drops(&self.dropped, 1);
        }
        Ok(())
    }

    /// Open a fresh subscription.
    ///
    /// On an already-closed hub the stream yields nothing, which keeps
    /// downstream code free of a special case.
    pub fn subscribe(&self) -> EventStream {
        let receiver = match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                drop(sender);
                receiver
            }
        };
        EventStream {
            receiver,
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> EventHubMetrics {
        EventHubMetrics {
            capacity: self.capacity,
            dropped: self.dropped(),
        }
    }

    /// Close the hub; subscribers observe end-of-stream once they drain.
    pub fn close(&self) {
        let _ = self.sender.lock().take();
    }
}

fn record_drops(counter: &AtomicUsize, missed: usize) {
    if missed == 0 {
        return;
    }
    let total = counter
        .fetch_add(missed, Ordering::Relaxed)
        .saturating_add(missed);
    tracing::warn!(
        target: "relaygraph::event_bus",
        missed,
        total_dropped = total,
        "events dropped before a subscriber consumed them"
    );
}

/// Emitter handle cloned into scheduler internals and handler contexts.
#[derive(Clone, Debug)]
pub struct HubEmitter {
    hub: Arc<EventHub>,
}

impl HubEmitter {
    #[must_use]
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

impl EventEmitter for HubEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}

/// Ordered subscription to a run's events.
///
/// Overflow is absorbed here: a lagged receiver skips ahead, adds the miss
/// to the shared drop counter, and keeps yielding.
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<Event>,
    dropped: Arc<AtomicUsize>,
}

impl EventStream {
    /// Wait for the next event; `None` means the hub closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    record_drops(&self.dropped, usize::try_from(missed).unwrap_or(usize::MAX));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` means nothing
    /// is buffered or the hub closed.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    record_drops(&self.dropped, usize::try_from(missed).unwrap_or(usize::MAX));
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered without waiting.
    pub fn drain_now(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }
}
