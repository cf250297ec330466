use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{
    broadcast::{self, Receiver, Sender},
    watch,
};
use tokio::time::timeout;

use super::emitter::{EmitterError, EventEmitter};
use super::event::Event;

/// Snapshot of hub health for monitoring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHubMetrics {
    pub capacity: usize,
    pub dropped: usize,
}

/// Broadcast-backed event hub with a per-`aggregate_id` sequencer and a
/// bounded replay buffer.
///
/// A plain `tokio::broadcast` channel fans out to every live subscriber but
/// gives no per-key ordering and can drop messages under subscriber lag —
/// insufficient for the bus contract's at-least-once-per-partition-key
/// guarantee. This hub closes that gap two ways: (1) every published event
/// is stamped with a monotonically increasing `metadata.sequence` scoped to
/// its `aggregate_id`, so a subscriber can detect gaps by comparing
/// consecutive sequence numbers; (2) each aggregate keeps a bounded ring of
/// its most recent events that [`EventHub::replay_since`] can hand a
/// lagging subscriber to catch back up, bounding redelivery cost instead of
/// replaying unboundedly.
#[derive(Debug)]
pub struct EventHub {
    sender: RwLock<Option<Sender<Event>>>,
    dropped_events: AtomicUsize,
    capacity: usize,
    sequences: Mutex<FxHashMap<String, u64>>,
    replay: Mutex<FxHashMap<String, VecDeque<Event>>>,
    replay_capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_replay_capacity(capacity, 256)
    }

    pub fn with_replay_capacity(capacity: usize, replay_capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped_events: AtomicUsize::new(0),
            capacity,
            sequences: Mutex::new(FxHashMap::default()),
            replay: Mutex::new(FxHashMap::default()),
            replay_capacity: replay_capacity.max(1),
        })
    }

    /// Publish an event, stamping its per-aggregate sequence number first.
    pub fn publish(&self, mut event: Event) -> Result<(), EmitterError> {
        let seq = {
            let mut seqs = self.sequences.lock();
            let counter = seqs.entry(event.aggregate_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        event.metadata.sequence = seq;

        {
            let mut replay = self.replay.lock();
            let ring = replay.entry(event.aggregate_id.clone()).or_default();
            ring.push_back(event.clone());
            while ring.len() > self.replay_capacity {
                ring.pop_front();
            }
        }

        match self.current_sender() {
            Some(sender) => match sender.send(event) {
                Ok(_) => Ok(()),
                Err(broadcast::error::SendError(event)) => {
                    drop(event);
                    Err(EmitterError::Closed)
                }
            },
            None => Err(EmitterError::Closed),
        }
    }

    /// Events for `aggregate_id` with sequence strictly greater than
    /// `after_seq`, bounded by the replay ring's capacity.
    pub fn replay_since(&self, aggregate_id: &str, after_seq: u64) -> Vec<Event> {
        self.replay
            .lock()
            .get(aggregate_id)
            .map(|ring| {
                ring.iter()
                    .filter(|e| e.metadata.sequence > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let receiver = self
            .current_sender()
            .map(|sender| sender.subscribe())
            .unwrap_or_else(|| {
                let (sender, receiver) = broadcast::channel(self.capacity.max(1));
                drop(sender);
                receiver
            });
        EventStream {
            receiver,
            hub: Arc::clone(self),
            shutdown: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> EventHubMetrics {
        EventHubMetrics {
            capacity: self.capacity(),
            dropped: self.dropped(),
        }
    }

    pub fn emitter(self: &Arc<Self>) -> HubEmitter {
        HubEmitter { hub: Arc::clone(self) }
    }

    pub fn close(&self) {
        let _ = self.sender.write().take();
    }

    fn current_sender(&self) -> Option<Sender<Event>> {
        self.sender.read().clone()
    }

    fn record_lag(&self, missed: u64) {
        if missed == 0 {
            return;
        }
        let increment = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self
            .dropped_events
            .fetch_add(increment, Ordering::Relaxed)
            .saturating_add(increment);
        tracing::warn!(
            target: "loomwork::event_bus",
            missed,
            total_dropped = total,
            "event stream lagged; dropped events"
        );
    }
}

#[derive(Clone, Debug)]
pub struct HubEmitter {
    hub: Arc<EventHub>,
}

impl EventEmitter for HubEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}

#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<Event>,
    hub: Arc<EventHub>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Err(broadcast::error::RecvError::Lagged(missed))
            }
            Err(err) => Err(err),
        }
    }

    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Err(broadcast::error::TryRecvError::Lagged(missed))
            }
            Err(err) => Err(err),
        }
    }

    pub fn into_inner(self) -> Receiver<Event> {
        self.receiver
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn into_async_stream(self) -> BoxStream<'static, Event> {
        let EventStream { receiver, hub, shutdown } = self;
        stream::unfold((receiver, hub, shutdown), |(mut receiver, hub, mut shutdown)| async move {
            loop {
                if let Some(ref mut shutdown_rx) = shutdown {
                    tokio::select! {
                        biased;
                        changed = shutdown_rx.changed() => {
                            if changed.is_ok() && *shutdown_rx.borrow() {
                                return None;
                            }
                            continue;
                        }
                        recv = receiver.recv() => {
                            match recv {
                                Ok(event) => return Some((event, (receiver, hub.clone(), shutdown))),
                                Err(broadcast::error::RecvError::Lagged(missed)) => {
                                    hub.record_lag(missed);
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => return None,
                            }
                        }
                    }
                } else {
                    match receiver.recv().await {
                        Ok(event) => return Some((event, (receiver, hub.clone(), shutdown))),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            hub.record_lag(missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    pub async fn next_timeout(&mut self, duration: Duration) -> Option<Event> {
        loop {
            match timeout(duration, self.recv()).await {
                Ok(Ok(event)) => return Some(event),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_stamps_monotonic_per_aggregate_sequence() {
        let hub = EventHub::new(16);
        let mut stream = hub.subscribe();
        hub.publish(Event::new("execution.started", "exec-1", "execution")).unwrap();
        hub.publish(Event::new("execution.completed", "exec-1", "execution")).unwrap();
        hub.publish(Event::new("execution.started", "exec-2", "execution")).unwrap();

        let e1 = stream.recv().await.unwrap();
        let e2 = stream.recv().await.unwrap();
        let e3 = stream.recv().await.unwrap();
        assert_eq!(e1.metadata.sequence, 1);
        assert_eq!(e2.metadata.sequence, 2);
        assert_eq!(e3.metadata.sequence, 1, "distinct aggregate has its own sequence");
    }

    #[test]
    fn replay_since_returns_only_newer_events() {
        let hub = EventHub::new(16);
        for _ in 0..5 {
            hub.publish(Event::new("task.completed", "exec-1", "execution")).unwrap();
        }
        let replayed = hub.replay_since("exec-1", 3);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].metadata.sequence, 4);
    }
}
