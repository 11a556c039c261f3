//! Event rendering and tracing bootstrap.
//!
//! Formatters turn [`Event`]s into sink-consumable text; `init_tracing`
//! installs an env-filtered `tracing` subscriber for hosts that want the
//! runtime's spans and diagnostics on stderr.

use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for a telemetry item that can be consumed by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
}

/// Single-line ANSI formatter; the default for [`StdOutSink`](crate::event_bus::StdOutSink).
pub struct PlainFormatter;

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{LINE_COLOR}{event}{RESET_COLOR}\n");
        EventRender {
            context: Some(event.kind().to_string()),
            lines: vec![line],
        }
    }
}

/// Install a global tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutorId;

    #[test]
    fn plain_formatter_emits_single_line() {
        let event = Event::executor_completed(ExecutorId::from("worker"), 2);
        let render = PlainFormatter::new().render_event(&event);
        assert_eq!(render.lines.len(), 1);
        assert!(render.join_lines().ends_with('\n'));
        assert_eq!(render.context.as_deref(), Some("executorCompleted"));
    }
}
