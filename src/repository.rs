//! Collaborator contracts the execution core depends on but does not own:
//! workflow CRUD/versioning and execution/node-execution persistence live
//! behind these traits so the core stays storage-agnostic.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::model::{Execution, NodeExecution, Workflow};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RepositoryError {
    #[error("workflow {0} not found")]
    #[diagnostic(code(loomwork::repository::workflow_not_found))]
    WorkflowNotFound(String),

    #[error("execution {0} not found")]
    #[diagnostic(code(loomwork::repository::execution_not_found))]
    ExecutionNotFound(String),
}

/// Read access to workflow definitions. Loading and activation state are
/// owned by whatever persists workflow authoring changes; the core only
/// reads.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn load(&self, workflow_id: &str, version: Option<u32>) -> Result<Workflow, RepositoryError>;
    async fn is_active(&self, workflow_id: &str) -> Result<bool, RepositoryError>;
}

/// Persistence for `Execution` and `NodeExecution` rows. The core writes
/// through this on every status transition; it never reads its own writes
/// back except through the in-memory registry it already holds.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn save_execution(&self, execution: Execution) -> Result<(), RepositoryError>;
    async fn get_execution(&self, execution_id: &str) -> Result<Execution, RepositoryError>;
    async fn save_node_execution(&self, node_execution: NodeExecution) -> Result<(), RepositoryError>;
    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecution>, RepositoryError>;
}

/// In-memory `WorkflowRepository` for tests and single-process demos.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<FxHashMap<String, Workflow>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: Workflow) {
        self.workflows.write().insert(workflow.id.clone(), workflow);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn load(&self, workflow_id: &str, _version: Option<u32>) -> Result<Workflow, RepositoryError> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn is_active(&self, workflow_id: &str) -> Result<bool, RepositoryError> {
        self.workflows
            .read()
            .get(workflow_id)
            .map(|w| w.is_active)
            .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_id.to_string()))
    }
}

/// In-memory `ExecutionRepository` for tests and single-process demos.
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<FxHashMap<String, Execution>>,
    node_executions: RwLock<FxHashMap<String, Vec<NodeExecution>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save_execution(&self, execution: Execution) -> Result<(), RepositoryError> {
        self.executions.write().insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Execution, RepositoryError> {
        self.executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| RepositoryError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn save_node_execution(&self, node_execution: NodeExecution) -> Result<(), RepositoryError> {
        self.node_executions
            .write()
            .entry(node_execution.execution_id.clone())
            .or_default()
            .push(node_execution);
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.node_executions.read().get(execution_id).cloned().unwrap_or_default())
    }
}

pub type SharedWorkflowRepository = Arc<dyn WorkflowRepository>;
pub type SharedExecutionRepository = Arc<dyn ExecutionRepository>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Workflow;

    #[tokio::test]
    async fn load_missing_workflow_errors() {
        let repo = InMemoryWorkflowRepository::new();
        let result = repo.load("missing", None).await;
        assert!(matches!(result, Err(RepositoryError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn save_and_load_roundtrips() {
        let repo = InMemoryWorkflowRepository::new();
        repo.insert(Workflow::new("wf-1", 1));
        let loaded = repo.load("wf-1", None).await.unwrap();
        assert_eq!(loaded.id, "wf-1");
    }
}
