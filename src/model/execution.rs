//! Execution and NodeExecution row types — the persisted, outward-facing
//! record of a workflow run, as distinct from the in-memory
//! [`crate::model::context::ExecutionContext`] the owning executor mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state_machine::ExecutionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_millis: Option<i64>,
    pub input: Value,
    pub data: Value,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Execution {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, workflow_version: u32, input: Value) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            workflow_version,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            duration_millis: None,
            input,
            data: Value::Null,
            error: None,
            retry_count: 0,
        }
    }

    pub fn mark_completed(&mut self, data: Value) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_millis = Some((now - self.started_at).num_milliseconds());
        self.data = data;
        self.status = ExecutionStatus::Success;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_millis = Some((now - self.started_at).num_milliseconds());
        self.error = Some(error.into());
        self.status = ExecutionStatus::Failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub status: NodeExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl NodeExecution {
    pub fn start(execution_id: impl Into<String>, node_id: impl Into<String>, input_data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            status: NodeExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            input_data,
            output_data: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn mark_completed(&mut self, output: Value) {
        self.finished_at = Some(Utc::now());
        self.output_data = Some(output);
        self.status = NodeExecutionStatus::Completed;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self.status = NodeExecutionStatus::Failed;
    }

    pub fn mark_skipped(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = NodeExecutionStatus::Skipped;
    }
}
