//! Event bus contract (C1): at-least-once publish/subscribe keyed by
//! aggregate id, used for fan-out/fan-in between every other component.

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{EmitterError, EventEmitter};
pub use event::{Event, EventMetadata, Topic};
pub use hub::{EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{EventSink, MemorySink, StdOutSink};
