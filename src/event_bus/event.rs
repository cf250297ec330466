//! The bus envelope and well-known topic names.

use std::fmt;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation headers every event carries, per the bus contract's
/// "headers carry event-type, trace-id, correlation-id" guarantee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    /// Per-aggregate monotonic sequence number, stamped by the hub at
    /// publish time to give subscriber groups an ordering key even though
    /// the underlying transport is a fan-out broadcast channel.
    #[serde(default)]
    pub sequence: u64,
}

/// The bus envelope. `aggregate_id` is the partition key: the hub assigns
/// `metadata.sequence` per-`aggregate_id` so per-key ordering is observable
/// downstream even though delivery itself fans out to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub version: u32,
    #[serde(default)]
    pub payload: FxHashMap<String, Value>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(event_type: impl Into<String>, aggregate_id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            timestamp: Utc::now(),
            user_id: None,
            version: 1,
            payload: FxHashMap::default(),
            metadata: EventMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    pub fn to_json_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} aggregate={} seq={}",
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.aggregate_id,
            self.metadata.sequence
        )
    }
}

/// Closed enum of topic names the core publishes or subscribes to, with a
/// stable string mapping for the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ExecutionStarted,
    ExecutionStateChanged,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionTimeout,
    ExecutionTimeoutWarning,
    NodeExecutionStarted,
    NodeExecutionCompleted,
    NodeExecutionFailed,
    NodeExecuteRequest,
    NodeExecuteResponse,
    NodesStopRequest,
    CheckpointSaved,
    RecoveryCompleted,
    RecoveryFailed,
    RecoveryMetrics,
    ScheduleTriggered,
    TaskCompleted,
    WorkerPoolMetrics,
    CancelRequest,
    ErrorWorkflowTrigger,
    TimeoutRetryTrigger,
}

impl Topic {
    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::ExecutionStarted => "execution.started",
            Topic::ExecutionStateChanged => "execution.state_changed",
            Topic::ExecutionCompleted => "execution.completed",
            Topic::ExecutionFailed => "execution.failed",
            Topic::ExecutionCancelled => "execution.cancelled",
            Topic::ExecutionTimeout => "execution.timeout",
            Topic::ExecutionTimeoutWarning => "execution.timeout.warning",
            Topic::NodeExecutionStarted => "node.execution.started",
            Topic::NodeExecutionCompleted => "node.execution.completed",
            Topic::NodeExecutionFailed => "node.execution.failed",
            Topic::NodeExecuteRequest => "node.execute.request",
            Topic::NodeExecuteResponse => "node.execute.response",
            Topic::NodesStopRequest => "nodes.stop.request",
            Topic::CheckpointSaved => "checkpoint.saved",
            Topic::RecoveryCompleted => "recovery.completed",
            Topic::RecoveryFailed => "recovery.failed",
            Topic::RecoveryMetrics => "recovery.metrics",
            Topic::ScheduleTriggered => "schedule.triggered",
            Topic::TaskCompleted => "task.completed",
            Topic::WorkerPoolMetrics => "workerpool.metrics",
            Topic::CancelRequest => "cancel.request",
            Topic::ErrorWorkflowTrigger => "error.workflow.trigger",
            Topic::TimeoutRetryTrigger => "timeout.retry.trigger",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_strings_match_contract() {
        assert_eq!(Topic::ExecutionStarted.as_str(), "execution.started");
        assert_eq!(Topic::NodeExecuteRequest.as_str(), "node.execute.request");
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::new(Topic::ExecutionStarted.as_str(), "exec-1", "execution")
            .with_payload("workflowId", Value::String("wf-1".into()));
        let json = event.to_json_value();
        assert_eq!(json["type"], "execution.started");
        assert_eq!(json["aggregateId"], "exec-1");
    }
}
