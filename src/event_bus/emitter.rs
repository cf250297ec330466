use std::fmt;

use thiserror::Error;

use super::event::Event;

/// Narrow publish-only view of the bus. Handed out to nodes, the
/// orchestrator, and anything else that only needs to produce events and
/// shouldn't be able to subscribe.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// Failure modes a publish-side call can surface; distinct from the errors
/// a subscriber sees on `recv`, since a slow subscriber lagging behind
/// never blocks or fails a publisher.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event bus closed")]
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

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_wraps_an_arbitrary_message() {
        let err = EmitterError::other("sink unreachable");
        assert_eq!(err.to_string(), "event emission failed: sink unreachable");
        assert!(!err.is_closed());
    }

    #[test]
    fn closed_is_distinguishable_from_other_variants() {
        assert!(EmitterError::Closed.is_closed());
        assert!(!EmitterError::Lagged(3).is_closed());
    }
}
