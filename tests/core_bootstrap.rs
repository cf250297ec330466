use std::sync::Arc;
use std::time::Duration;

use loomwork::config::CoreConfig;
use loomwork::model::{Connection, Node, NodeType, Workflow};
use loomwork::repository::InMemoryWorkflowRepository;
use loomwork::state_machine::ExecutionStatus;
use loomwork::Core;

fn linear_workflow() -> Workflow {
    Workflow::new("greet", 1)
        .with_node(Node::new("start", NodeType::Trigger))
        .with_node(Node::new("echo", NodeType::Code))
        .with_connection(Connection::new("start", "echo"))
}

#[tokio::test]
async fn bootstrap_runs_a_workflow_to_completion() {
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    workflows.insert(linear_workflow());

    let core = Core::bootstrap(CoreConfig::default(), workflows).await.expect("bootstrap succeeds");

    let execution = core
        .orchestrator
        .execute_workflow("greet", serde_json::json!({"input": 1}))
        .await
        .expect("execute_workflow accepts an active workflow");
    assert_eq!(execution.status, ExecutionStatus::Running);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(core.orchestrator.cancel_token(&execution.id).is_none(), "execution should have finished and been reaped");
}

#[tokio::test]
async fn bootstrap_rejects_unknown_workflow() {
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let core = Core::bootstrap(CoreConfig::default(), workflows).await.expect("bootstrap succeeds");

    let result = core.orchestrator.execute_workflow("missing", serde_json::json!({})).await;
    assert!(result.is_err());
}
