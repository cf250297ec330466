//! Pluggable event sinks consumed by [`super::bus::EventBus`].

use async_trait::async_trait;
use parking_lot::Mutex;

use super::event::Event;

/// A destination for published events. Each sink gets its own dedicated
/// subscriber task inside the bus so a slow sink cannot block others.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&mut self, event: &Event);
}

/// Writes a one-line rendering of every event to stdout. The default sink
/// used when no bus is explicitly configured.
#[derive(Debug, Default)]
pub struct StdOutSink;

#[async_trait]
impl EventSink for StdOutSink {
    async fn handle(&mut self, event: &Event) {
        println!("{event}");
    }
}

/// Accumulates events in memory; used by tests and by components that want
/// a queryable tail of recent activity without round-tripping through a
/// subscription.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_ref(&self) -> std::sync::Arc<Mutex<Vec<Event>>> {
        self.events.clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn handle(&mut self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
