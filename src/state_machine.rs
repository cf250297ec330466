//! Per-execution lifecycle state machine with an append-only transition log.
//!
//! Transitions are a sparse table; anything not in the table is
//! `invalid transition`, never silently coerced.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Cancelled | ExecutionStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    Queue,
    Start,
    Cancel,
    Timeout,
    Pause,
    Resume,
    Complete,
    Fail,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StateMachineError {
    #[error("invalid transition: {event:?} is not valid from {from:?}")]
    #[diagnostic(code(loomwork::state_machine::invalid_transition))]
    InvalidTransition {
        from: ExecutionStatus,
        event: TransitionEvent,
    },
}

/// An immutable, append-only log record of one transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ExecutionStatus,
    pub to_state: ExecutionStatus,
    pub event: TransitionEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

fn next_state(from: ExecutionStatus, event: TransitionEvent) -> Option<ExecutionStatus> {
    use ExecutionStatus::*;
    use TransitionEvent::*;
    match (from, event) {
        (Pending, Queue) => Some(Queued),
        (Pending, Start) | (Queued, Start) => Some(Running),
        (Pending, Cancel) | (Queued, Cancel) | (Running, Cancel) | (Paused, Cancel) => Some(Cancelled),
        (Queued, TransitionEvent::Timeout) | (Running, TransitionEvent::Timeout) | (Paused, TransitionEvent::Timeout) => {
            Some(ExecutionStatus::Timeout)
        }
        (Running, Pause) => Some(Paused),
        (Paused, Resume) => Some(Running),
        (Running, Complete) => Some(Success),
        (Running, Fail) => Some(Failed),
        (Failed, Start) => Some(Running),
        _ => None,
    }
}

/// Drives one execution's lifecycle. Cheap to construct; the orchestrator
/// owns exactly one instance per live execution.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    status: ExecutionStatus,
    history: Vec<StateTransition>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            history: Vec::new(),
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Apply `event`, appending a transition record on success.
    ///
    /// Cancellation is idempotent: a `Cancel` event issued after the
    /// machine is already terminal returns `InvalidTransition` without
    /// mutating state, rather than being treated as an unexpected caller
    /// bug.
    pub fn apply(&mut self, event: TransitionEvent, metadata: Value) -> Result<ExecutionStatus, StateMachineError> {
        if self.status.is_terminal() {
            return Err(StateMachineError::InvalidTransition {
                from: self.status,
                event,
            });
        }
        let to = next_state(self.status, event).ok_or(StateMachineError::InvalidTransition {
            from: self.status,
            event,
        })?;
        let from = self.status;
        let now = Utc::now();
        if to == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        self.history.push(StateTransition {
            from_state: from,
            to_state: to,
            event,
            timestamp: now,
            metadata,
        });
        Ok(to)
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn happy_path_pending_to_success() {
        let mut sm = ExecutionStateMachine::new();
        sm.apply(TransitionEvent::Start, Value::Null).unwrap();
        assert_eq!(sm.status(), ExecutionStatus::Running);
        assert!(sm.started_at.is_some());
        sm.apply(TransitionEvent::Complete, Value::Null).unwrap();
        assert_eq!(sm.status(), ExecutionStatus::Success);
        assert!(sm.completed_at.is_some());
        assert_eq!(sm.history().len(), 2);
    }

    #[test]
    fn terminal_state_never_transitions_again() {
        let mut sm = ExecutionStateMachine::new();
        sm.apply(TransitionEvent::Start, Value::Null).unwrap();
        sm.apply(TransitionEvent::Complete, Value::Null).unwrap();
        let err = sm.apply(TransitionEvent::Cancel, Value::Null).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.history().len(), 2);
    }

    #[test]
    fn failed_is_retriable_via_start() {
        let mut sm = ExecutionStateMachine::new();
        sm.apply(TransitionEvent::Start, Value::Null).unwrap();
        sm.apply(TransitionEvent::Fail, json!({"error": "boom"})).unwrap();
        assert_eq!(sm.status(), ExecutionStatus::Failed);
        sm.apply(TransitionEvent::Start, Value::Null).unwrap();
        assert_eq!(sm.status(), ExecutionStatus::Running);
    }

    #[test]
    fn invalid_transition_rejected_without_mutation() {
        let mut sm = ExecutionStateMachine::new();
        let err = sm.apply(TransitionEvent::Complete, Value::Null).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.status(), ExecutionStatus::Pending);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn cancel_idempotent_after_terminal() {
        let mut sm = ExecutionStateMachine::new();
        sm.apply(TransitionEvent::Cancel, Value::Null).unwrap();
        assert_eq!(sm.status(), ExecutionStatus::Cancelled);
        let err = sm.apply(TransitionEvent::Cancel, Value::Null).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.history().len(), 1);
    }
}
