use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::{sync::oneshot, task};

use super::emitter::EventEmitter;
use super::hub::{EventHub, EventStream, HubEmitter};
use super::sink::{EventSink, StdOutSink};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Central event broadcasting system for workflow execution events.
///
/// `EventBus` receives events from the scheduler and broadcasts them to
/// subscribed [`EventStream`]s and to the configured sinks (stdout, channels,
/// files, monitoring systems). The bus is a runtime concern owned by the
/// [`Runner`](crate::runtime::Runner), not by the workflow definition, so
/// multiple runners can execute the same workflow with different event
/// configurations (e.g. one bus per HTTP client connection).
///
/// ```text
/// Handler contexts / scheduler
///     │ emit()
///     ▼
/// EventBus (hub broadcast)
///     ├─────┬─────┬─────┐
///     ▼     ▼     ▼     ▼
/// StdOut Channel JSONL Memory
///  Sink   Sink   Sink   Sink
/// ```
pub struct EventBus {
    sinks: Arc<Mutex<Vec<SinkEntry>>>,
    hub: Arc<EventHub>,
    started: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    pub(crate) fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        let hub = Arc::new(EventHub::new(buffer_capacity));
        let entries = sinks.into_iter().map(SinkEntry::new).collect();
        Self {
            sinks: Arc::new(Mutex::new(entries)),
            hub,
            started: AtomicBool::new(false),
        }
    }

    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.add_boxed_sink(Box::new(sink));
    }

    pub fn add_boxed_sink(&self, sink: Box<dyn EventSink>) {
        let mut sinks = self.sinks.lock().unwrap();
        let mut entry = SinkEntry::new(sink);
        if self.started.load(Ordering::SeqCst) {
            entry.spawn_worker(self.hub.clone());
        }
        sinks.push(entry);
    }

    pub fn get_emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(HubEmitter::new(Arc::clone(&self.hub)))
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    pub fn metrics(&self) -> super::hub::EventHubMetrics {
        self.hub.metrics()
    }

    /// Start one worker per sink, each consuming its own hub subscription.
    pub fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter_mut() {
            entry.spawn_worker(self.hub.clone());
        }
    }

    /// Stop sink workers gracefully, letting them drain buffered events.
    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter_mut() {
            entry.stop_worker().await;
        }
    }

    /// Close the hub so subscribers observe end-of-stream.
    pub fn close_channel(&self) {
        self.hub.close();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            if let Ok(mut sinks) = self.sinks.lock() {
                for entry in sinks.iter_mut() {
                    entry.abort_worker();
                }
            }
        }
    }
}

struct SinkEntry {
    sink: Arc<parking_lot::Mutex<Box<dyn EventSink>>>,
    worker: Option<SinkWorker>,
}

struct SinkWorker {
    handle: task::JoinHandle<()>,
    stop: Option<oneshot::Sender<()>>,
}

impl SinkEntry {
    fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink: Arc::new(parking_lot::Mutex::new(sink)),
            worker: None,
        }
    }

    fn spawn_worker(&mut self, hub: Arc<EventHub>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut stream = hub.subscribe();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    received = stream.recv() => match received {
                        Some(event) => {
                            let sink = Arc::clone(&sink);
                            // Sinks may block on I/O; keep the runtime responsive.
                            let outcome =
                                task::spawn_blocking(move || sink.lock().handle(&event)).await;
                            match outcome {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => {
                                    tracing::warn!(
                                        target: "relaygraph::event_bus",
                                        error = %err,
                                        "sink failed to handle event"
                                    );
                                }
                                Err(join_err) => {
                                    tracing::warn!(
                                        target: "relaygraph::event_bus",
                                        error = %join_err,
                                        "sink worker panicked"
                                    );
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        self.worker = Some(SinkWorker {
            handle,
            stop: Some(stop_tx),
        });
    }

    async fn stop_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            if let Some(stop) = worker.stop.take() {
                let _ = stop.send(());
            }
            let _ = (&mut worker.handle).await;
        }
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
    }
}
