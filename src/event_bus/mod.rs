//! Event bus utilities providing fan-out, sinks, and subscriber APIs.
//!
//! The module is organised around a broadcast-based [`EventHub`] and helpers
//! for configuring sinks ([`EventBus`]) and consuming the resulting
//! [`EventStream`].

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{CollectingEmitter, EmitterError, EventEmitter};
pub use event::{
    CancelledEvent, DiagnosticEvent, Event, ExecutorEvent, ExecutorPhase, OutputEvent,
    RequestEvent, RunErrorEvent, StepEvent, STREAM_END_SCOPE,
};
pub use hub::{EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
