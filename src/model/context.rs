//! In-memory execution context and its persisted snapshot shape.
//!
//! [`ExecutionContext`] is mutated only by the owning executor; readers take
//! a [`ContextSnapshot`] — an immutable point-in-time view — instead of
//! sharing mutable access.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ExecutionError;
use crate::state_machine::ExecutionStatus;
use parking_lot::Mutex;

/// Immutable point-in-time view of an [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub variables: Value,
    pub node_outputs: FxHashMap<String, Value>,
    pub errors: Vec<ExecutionError>,
}

/// Per-execution mutable scratch space threaded through the graph walk.
///
/// `variables` and `node_outputs` are guarded by a single lock so concurrent
/// node completions merge deterministically: every write to `Variables`
/// goes through the same writer lock, never a per-field one.
pub struct ExecutionContext {
    pub execution_id: String,
    inner: Mutex<Inner>,
    pub start_time: DateTime<Utc>,
    pub metadata: FxHashMap<String, String>,
}

struct Inner {
    variables: Value,
    node_outputs: FxHashMap<String, Value>,
    errors: Vec<ExecutionError>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id: execution_id.into(),
            inner: Mutex::new(Inner {
                variables: input,
                node_outputs: FxHashMap::default(),
                errors: Vec::new(),
            }),
            start_time: Utc::now(),
            metadata: FxHashMap::default(),
        }
    }

    pub fn from_state(execution_id: impl Into<String>, state: &ExecutionState) -> Self {
        Self {
            execution_id: execution_id.into(),
            inner: Mutex::new(Inner {
                variables: state.variables.clone(),
                node_outputs: state.node_outputs.clone(),
                errors: state.errors.clone(),
            }),
            start_time: state.start_time,
            metadata: FxHashMap::default(),
        }
    }

    /// Merge a node's output into `NodeOutputs[nodeID]` and top-level-merge
    /// its object keys into `Variables`. Last-writer-wins under this single
    /// lock: two parallel branches racing on the same key means the later
    /// caller of this method determines the final value.
    pub fn merge_node_output(&self, node_id: &str, output: Value) {
        let mut guard = self.inner.lock();
        if let Value::Object(map) = &output {
            if let Value::Object(vars) = &mut guard.variables {
                for (k, v) in map {
                    vars.insert(k.clone(), v.clone());
                }
            } else {
                guard.variables = output.clone();
            }
        }
        guard.node_outputs.insert(node_id.to_string(), output);
    }

    pub fn push_error(&self, error: ExecutionError) {
        self.inner.lock().errors.push(error);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let guard = self.inner.lock();
        ContextSnapshot {
            variables: guard.variables.clone(),
            node_outputs: guard.node_outputs.clone(),
            errors: guard.errors.clone(),
        }
    }

    pub fn variables(&self) -> Value {
        self.inner.lock().variables.clone()
    }
}

/// The body of a persisted checkpoint: everything required to resume an
/// execution without the live [`ExecutionContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub variables: Value,
    pub node_outputs: FxHashMap<String, Value>,
    pub completed_nodes: Vec<String>,
    pub pending_nodes: Vec<String>,
    pub errors: Vec<ExecutionError>,
    pub start_time: DateTime<Utc>,
    pub last_checkpoint_time: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>, variables: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            variables,
            node_outputs: FxHashMap::default(),
            completed_nodes: Vec::new(),
            pending_nodes: Vec::new(),
            errors: Vec::new(),
            start_time: now,
            last_checkpoint_time: now,
        }
    }

    /// Completed and pending node sets never overlap after a checkpoint is
    /// taken.
    pub fn completed_and_pending_disjoint(&self) -> bool {
        let completed: std::collections::HashSet<_> = self.completed_nodes.iter().collect();
        !self.pending_nodes.iter().any(|n| completed.contains(n))
    }
}

/// A durable snapshot of an execution, sufficient to resume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: String,
    /// Empty string means this is a full-state snapshot rather than a
    /// single node's incremental update.
    pub node_id: String,
    pub state: ExecutionState,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub metadata: Value,
}

impl Checkpoint {
    pub fn full_snapshot(execution_id: impl Into<String>, state: ExecutionState, version: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            node_id: String::new(),
            state,
            timestamp: Utc::now(),
            version,
            metadata: Value::Null,
        }
    }

    pub fn is_full_snapshot(&self) -> bool {
        self.node_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_node_output_last_writer_wins() {
        let ctx = ExecutionContext::new("exec1", json!({"x": 1}));
        ctx.merge_node_output("n1", json!({"x": 2, "y": 3}));
        let snap = ctx.snapshot();
        assert_eq!(snap.variables, json!({"x": 2, "y": 3}));
        assert_eq!(snap.node_outputs.get("n1"), Some(&json!({"x": 2, "y": 3})));
    }

    #[test]
    fn execution_state_disjoint_invariant_detects_overlap() {
        let mut state = ExecutionState::new("e1", "wf1", json!({}));
        state.completed_nodes.push("n1".into());
        state.pending_nodes.push("n2".into());
        assert!(state.completed_and_pending_disjoint());
        state.pending_nodes.push("n1".into());
        assert!(!state.completed_and_pending_disjoint());
    }
}
