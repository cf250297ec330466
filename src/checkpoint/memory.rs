//! In-memory [`Checkpointer`]: the hot cache used directly in tests and as
//! the cache layer in front of a durable store in production.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{CheckpointError, Checkpointer};
use crate::model::Checkpoint;

#[derive(Default)]
pub struct InMemoryCheckpointer {
    by_execution: RwLock<HashMap<String, Vec<Checkpoint>>>,
    by_id: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save_checkpoint_sync(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.by_id.write().insert(checkpoint.id.clone(), checkpoint.clone());
        let mut by_execution = self.by_execution.write();
        let entries = by_execution.entry(checkpoint.execution_id.clone()).or_default();
        entries.push(checkpoint);
        entries.sort_by_key(|c| c.version);
        Ok(())
    }

    async fn get_latest_checkpoint(&self, execution_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.by_execution
            .read()
            .get(execution_id)
            .and_then(|entries| entries.iter().max_by_key(|c| (c.timestamp, c.version)).cloned())
            .ok_or_else(|| CheckpointError::NotFound(execution_id.to_string()))
    }

    async fn get_checkpoint_by_id(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.by_id
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    async fn list_checkpoints(&self, execution_id: &str, limit: usize) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut entries = self
            .by_execution
            .read()
            .get(execution_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.version.cmp(&a.version)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<(), CheckpointError> {
        if let Some(checkpoint) = self.by_id.write().remove(id) {
            if let Some(entries) = self.by_execution.write().get_mut(&checkpoint.execution_id) {
                entries.retain(|c| c.id != id);
            }
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        let mut by_id = self.by_id.write();
        let mut by_execution = self.by_execution.write();
        let stale_ids: Vec<String> = by_id
            .values()
            .filter(|c| c.timestamp < cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in stale_ids {
            if let Some(checkpoint) = by_id.remove(&id) {
                if let Some(entries) = by_execution.get_mut(&checkpoint.execution_id) {
                    entries.retain(|c| c.id != id);
                }
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionState;

    fn state(execution_id: &str) -> ExecutionState {
        ExecutionState::new(execution_id, "wf-1", serde_json::json!({}))
    }

    #[tokio::test]
    async fn latest_checkpoint_breaks_ties_by_version() {
        let store = InMemoryCheckpointer::new();
        let now = Utc::now();
        let mut c1 = Checkpoint::full_snapshot("exec-1", state("exec-1"), 1);
        c1.timestamp = now;
        let mut c2 = Checkpoint::full_snapshot("exec-1", state("exec-1"), 2);
        c2.timestamp = now;

        store.save_checkpoint_sync(c1).await.unwrap();
        store.save_checkpoint_sync(c2.clone()).await.unwrap();

        let latest = store.get_latest_checkpoint("exec-1").await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.id, c2.id);
    }

    #[tokio::test]
    async fn list_checkpoints_respects_limit() {
        let store = InMemoryCheckpointer::new();
        for version in 1..=5 {
            store
                .save_checkpoint_sync(Checkpoint::full_snapshot("exec-2", state("exec-2"), version))
                .await
                .unwrap();
        }
        let listed = store.list_checkpoints("exec-2", 3).await.unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn gc_sweep_removes_only_stale_entries() {
        let store = InMemoryCheckpointer::new();
        let mut old = Checkpoint::full_snapshot("exec-3", state("exec-3"), 1);
        old.timestamp = Utc::now() - chrono::Duration::days(30);
        store.save_checkpoint_sync(old).await.unwrap();
        store
            .save_checkpoint_sync(Checkpoint::full_snapshot("exec-3", state("exec-3"), 2))
            .await
            .unwrap();

        let removed = store.delete_older_than(Utc::now() - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_checkpoints("exec-3", 10).await.unwrap().len(), 1);
    }
}
