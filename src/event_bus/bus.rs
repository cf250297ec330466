//! Multi-sink event bus: one [`EventHub`] feeding N independently-running
//! sink workers, plus direct `subscribe()` access for components (the
//! orchestrator's pending-response correlation, the recovery manager) that
//! want to consume the stream themselves rather than register a sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::emitter::{EmitterError, EventEmitter};
use super::event::Event;
use super::hub::{EventHub, EventStream, HubEmitter};
use super::sink::{EventSink, StdOutSink};

struct SinkWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct SinkEntry {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    worker: Option<SinkWorker>,
}

impl SinkEntry {
    fn spawn_worker(&mut self, hub: Arc<EventHub>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let mut stream = hub.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = stream.recv() => {
                        match event {
                            Ok(event) => {
                                let mut guard = sink.lock().await;
                                guard.handle(&event).await;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        self.worker = Some(SinkWorker { shutdown: shutdown_tx, handle });
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            worker.handle.abort();
        }
    }
}

/// Owns a set of sinks and the [`EventHub`] that fans events out to them.
///
/// `App::invoke()`-equivalent callers can rely on [`EventBus::default()`]
/// (stdout only); anything that wants per-request isolation or a custom
/// sink set should build one explicitly and pass it to the orchestrator.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<SinkEntry>>>,
    hub: Arc<EventHub>,
    started: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(Box::new(StdOutSink))
    }
}

impl EventBus {
    pub fn with_sink(sink: Box<dyn EventSink>) -> Self {
        Self::with_sinks(vec![sink])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(1024, sinks)
    }

    pub fn with_capacity(capacity: usize, sinks: Vec<Box<dyn EventSink>>) -> Self {
        let entries = sinks
            .into_iter()
            .map(|sink| SinkEntry {
                sink: Arc::new(Mutex::new(sink)),
                worker: None,
            })
            .collect();
        Self {
            sinks: Arc::new(Mutex::new(entries)),
            hub: EventHub::new(capacity),
            started: AtomicBool::new(false),
        }
    }

    pub async fn add_sink(&self, sink: Box<dyn EventSink>) {
        let mut entry = SinkEntry {
            sink: Arc::new(Mutex::new(sink)),
            worker: None,
        };
        if self.started.load(Ordering::SeqCst) {
            entry.spawn_worker(Arc::clone(&self.hub));
        }
        self.sinks.lock().await.push(entry);
    }

    pub fn get_emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Idempotent: spawns one worker per registered sink if not already
    /// listening.
    pub async fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().await;
        for entry in sinks.iter_mut() {
            entry.spawn_worker(Arc::clone(&self.hub));
        }
    }

    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().await;
        for entry in sinks.iter_mut() {
            entry.stop_worker().await;
        }
    }

    pub fn publish(&self, event: Event) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            if let Ok(mut sinks) = self.sinks.try_lock() {
                for entry in sinks.iter_mut() {
                    entry.abort_worker();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::sink::MemorySink;

    #[tokio::test]
    async fn published_events_reach_memory_sink() {
        let sink = MemorySink::new();
        let events = sink.handle_ref();
        let bus = EventBus::with_sink(Box::new(sink));
        bus.listen_for_events().await;

        bus.publish(Event::new("execution.started", "exec-1", "execution")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(events.lock().len(), 1);
        bus.stop_listener().await;
    }
}
