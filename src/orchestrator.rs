//! Orchestrator (C7): drives a workflow from `execute_workflow` through the
//! graph walk to a terminal state, dispatching inline node types directly
//! and routing everything else through the bus-based executor service.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cancellation::CancellationManager;
use crate::checkpoint::CheckpointBatcher;
use crate::errors::ExecutionError;
use crate::event_bus::{Event, EventBus, Topic};
use crate::model::{
    Checkpoint, Execution, ExecutionContext, ExecutionState, Node, NodeExecution, NodeType, Workflow,
};
use crate::recovery::ExecutionDispatcher;
use crate::repository::{ExecutionRepository, RepositoryError, WorkflowRepository};
use crate::state_machine::{ExecutionStateMachine, ExecutionStatus, StateMachineError, TransitionEvent};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum OrchestratorError {
    #[error("workflow {0} is not active")]
    #[diagnostic(code(loomwork::orchestrator::workflow_inactive))]
    WorkflowInactive(String),

    #[error(transparent)]
    #[diagnostic(code(loomwork::orchestrator::repository))]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    #[diagnostic(code(loomwork::orchestrator::state_machine))]
    StateMachine(#[from] StateMachineError),

    #[error("execution {0} not found among live executors")]
    #[diagnostic(code(loomwork::orchestrator::execution_not_found))]
    ExecutionNotFound(String),
}

/// Node-type-specific inline behavior; `execute_node` dispatches here for
/// every type except the ones handled directly (trigger is a pass-through,
/// `External` always routes to the executor service).
#[async_trait]
pub trait InlineNodeRunner: Send + Sync {
    async fn run(&self, node: &Node, variables: &Value) -> Result<Value, String>;
}

/// Default inline runner: trivial pass-through/echo behavior for
/// `httpRequest`/`code`/`condition`/`loop`, sufficient for graphs that don't
/// need real HTTP or sandboxed code execution. Swap in a richer
/// implementation (wired to `reqwest` under the `http` feature, or a real
/// sandbox) without touching the orchestrator.
pub struct DefaultInlineRunner;

#[async_trait]
impl InlineNodeRunner for DefaultInlineRunner {
    async fn run(&self, node: &Node, variables: &Value) -> Result<Value, String> {
        match &node.node_type {
            NodeType::HttpRequest => Ok(serde_json::json!({"status": "ok", "node": node.id})),
            NodeType::Code => Ok(variables.clone()),
            NodeType::Condition => Ok(serde_json::json!({"matched": true})),
            NodeType::Loop => Ok(variables.clone()),
            _ => Ok(variables.clone()),
        }
    }
}

struct PendingResponse {
    sender: oneshot::Sender<Value>,
}

struct LiveExecutor {
    workflow: Workflow,
    execution_id: String,
    context: Arc<ExecutionContext>,
    state_machine: RwLock<ExecutionStateMachine>,
    cancel_token: CancellationToken,
    started_at: std::time::Instant,
    timeout: Duration,
    /// Nodes the walk has finished (success or `continueOnFail` error) and
    /// the current BFS frontier, kept current by `walk_graph` so a
    /// checkpoint taken mid-walk carries the real progress instead of an
    /// empty placeholder.
    completed_nodes: parking_lot::Mutex<Vec<String>>,
    pending_nodes: parking_lot::Mutex<Vec<String>>,
}

/// Owns every live execution, the pending node-execute-response
/// correlation map, and the background monitors. Constructed once per
/// process and shared behind an `Arc`.
pub struct Orchestrator {
    workflows: Arc<dyn WorkflowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    event_bus: Arc<EventBus>,
    checkpoints: Arc<CheckpointBatcher>,
    inline_runner: Arc<dyn InlineNodeRunner>,
    live: RwLock<FxHashMap<String, Arc<LiveExecutor>>>,
    pending_requests: RwLock<FxHashMap<String, PendingResponse>>,
    checkpoint_version: AtomicU64,
    /// Per-execution cancellation contexts (C5): every `LiveExecutor`'s
    /// token is a child of the context registered here, so a cancel routed
    /// through the manager actually reaches the running walk.
    cancellation: Arc<CancellationManager>,
    /// Lets the `ExecutionDispatcher` impl (only `&self`) recover an
    /// `Arc<Self>` to call the real `self: &Arc<Self>` dispatch path.
    self_ref: std::sync::Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        event_bus: Arc<EventBus>,
        checkpoints: Arc<CheckpointBatcher>,
        inline_runner: Arc<dyn InlineNodeRunner>,
        cancellation: Arc<CancellationManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            workflows,
            executions,
            event_bus,
            checkpoints,
            inline_runner,
            live: RwLock::new(FxHashMap::default()),
            pending_requests: RwLock::new(FxHashMap::default()),
            checkpoint_version: AtomicU64::new(0),
            cancellation,
            self_ref: weak.clone(),
        })
    }

    pub async fn execute_workflow(self: &Arc<Self>, workflow_id: &str, input: Value) -> Result<Execution, OrchestratorError> {
        let workflow = self.workflows.load(workflow_id, None).await?;
        if !workflow.is_active {
            return Err(OrchestratorError::WorkflowInactive(workflow_id.to_string()));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut execution = Execution::new(&execution_id, workflow_id, workflow.version, input.clone());
        execution.status = ExecutionStatus::Running;
        self.executions.save_execution(execution.clone()).await?;

        let _ = self.event_bus.publish(
            Event::new(Topic::ExecutionStarted.as_str(), &execution_id, "execution")
                .with_payload("workflowId", serde_json::json!(workflow_id)),
        );

        let context = Arc::new(ExecutionContext::new(&execution_id, input));
        let mut state_machine = ExecutionStateMachine::new();
        state_machine.apply(TransitionEvent::Start, Value::Null)?;
        self.publish_state_changed(&execution_id, ExecutionStatus::Pending, ExecutionStatus::Running, TransitionEvent::Start);

        let cancellation_ctx = self.cancellation.register(execution_id.clone());
        let live = Arc::new(LiveExecutor {
            workflow: workflow.clone(),
            execution_id: execution_id.clone(),
            context,
            state_machine: RwLock::new(state_machine),
            cancel_token: cancellation_ctx.child_token(),
            started_at: std::time::Instant::now(),
            timeout: workflow.settings.timeout,
            completed_nodes: parking_lot::Mutex::new(Vec::new()),
            pending_nodes: parking_lot::Mutex::new(Vec::new()),
        });
        self.live.write().insert(execution_id.clone(), Arc::clone(&live));

        let orchestrator = Arc::clone(self);
        let exec_id_for_task = execution_id.clone();
        tokio::spawn(async move {
            orchestrator.run_executor(exec_id_for_task).await;
        });

        Ok(execution)
    }

    async fn run_executor(self: &Arc<Self>, execution_id: String) {
        let Some(live) = self.live.read().get(&execution_id).cloned() else { return };

        let outcome = self.walk_graph_from_triggers(&live).await;

        match outcome {
            Ok(()) => self.complete_execution(&live).await,
            Err(error) => self.handle_execution_error(&live, error).await,
        }

        self.live.write().remove(&execution_id);
        self.cancellation.forget(&execution_id);
    }

    /// Fresh run: BFS from the workflow's trigger nodes.
    async fn walk_graph_from_triggers(&self, live: &LiveExecutor) -> Result<(), ExecutionError> {
        let queue: VecDeque<String> = live.workflow.trigger_nodes().map(|n| n.id.clone()).collect();
        self.walk_graph(live, HashSet::new(), queue).await
    }

    /// Resume: re-drive exactly the checkpoint's `pending_nodes` frontier,
    /// treating `completed_nodes` as already executed so they are never
    /// re-run. Falls back to a fresh trigger-node walk if the checkpoint
    /// carries no frontier (e.g. a checkpoint taken before the first node
    /// completed).
    async fn walk_graph_from_checkpoint(&self, live: &LiveExecutor, state: &ExecutionState) -> Result<(), ExecutionError> {
        if state.pending_nodes.is_empty() {
            return self.walk_graph_from_triggers(live).await;
        }
        let executed: HashSet<String> = state.completed_nodes.iter().cloned().collect();
        let queue: VecDeque<String> = state.pending_nodes.iter().cloned().collect();
        self.walk_graph(live, executed, queue).await
    }

    async fn walk_graph(
        &self,
        live: &LiveExecutor,
        mut executed: HashSet<String>,
        mut queue: VecDeque<String>,
    ) -> Result<(), ExecutionError> {
        self.sync_progress(live, &executed, &queue);

        while let Some(node_id) = queue.pop_front() {
            if executed.contains(&node_id) {
                continue;
            }
            if live.cancel_token.is_cancelled() {
                return Err(ExecutionError::new(crate::errors::ErrorKind::Unknown, "execution cancelled"));
            }
            executed.insert(node_id.clone());

            match self.execute_node(live, &node_id).await {
                Ok(_) => {
                    for target in live.workflow.outgoing(&node_id) {
                        if !executed.contains(target) {
                            queue.push_back(target.to_string());
                        }
                    }
                    self.sync_progress(live, &executed, &queue);
                    self.maybe_checkpoint(live).await;
                }
                Err(error) => {
                    if live.workflow.settings.error_handling.continue_on_fail {
                        live.context.push_error(error);
                        for target in live.workflow.outgoing(&node_id) {
                            if !executed.contains(target) {
                                queue.push_back(target.to_string());
                            }
                        }
                        self.sync_progress(live, &executed, &queue);
                    } else {
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Publish the walk's current completed/pending sets into `live` so a
    /// checkpoint taken at any point carries real progress.
    fn sync_progress(&self, live: &LiveExecutor, executed: &HashSet<String>, queue: &VecDeque<String>) {
        *live.completed_nodes.lock() = executed.iter().cloned().collect();
        *live.pending_nodes.lock() = queue.iter().cloned().collect();
    }

    async fn execute_node(&self, live: &LiveExecutor, node_id: &str) -> Result<Value, ExecutionError> {
        let Some(node) = live.workflow.node(node_id) else {
            return Err(ExecutionError::new(crate::errors::ErrorKind::ResourceNotFound, format!("node {node_id} not found")));
        };
        if node.config.disabled {
            return Ok(Value::Null);
        }

        let variables = live.context.variables();
        let mut node_execution = NodeExecution::start(&live.execution_id, node_id, variables.clone());
        let _ = self.event_bus.publish(
            Event::new(Topic::NodeExecutionStarted.as_str(), &live.execution_id, "execution")
                .with_payload("nodeId", serde_json::json!(node_id)),
        );

        let mut retry_count: u32 = 0;
        loop {
            let result = self.dispatch_node(live, node).await;
            match result {
                Ok(output) => {
                    live.context.merge_node_output(node_id, output.clone());
                    node_execution.mark_completed(output.clone());
                    let _ = self.executions.save_node_execution(node_execution).await;
                    let _ = self.event_bus.publish(
                        Event::new(Topic::NodeExecutionCompleted.as_str(), &live.execution_id, "execution")
                            .with_payload("nodeId", serde_json::json!(node_id))
                            .with_payload("status", serde_json::json!("completed")),
                    );
                    return Ok(output);
                }
                Err(message) => {
                    let error = ExecutionError::from_message(message).with_node(node_id);
                    if node.config.max_retries > 0 && retry_count < node.config.max_retries {
                        retry_count += 1;
                        tokio::time::sleep(node.config.wait_between_tries).await;
                        continue;
                    }
                    node_execution.retry_count = retry_count;
                    node_execution.mark_failed(error.message.clone());
                    let _ = self.executions.save_node_execution(node_execution).await;
                    let _ = self.event_bus.publish(
                        Event::new(Topic::NodeExecutionFailed.as_str(), &live.execution_id, "execution")
                            .with_payload("nodeId", serde_json::json!(node_id))
                            .with_payload("retryable", serde_json::json!(error.retryable)),
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn dispatch_node(&self, live: &LiveExecutor, node: &Node) -> Result<Value, String> {
        let variables = live.context.variables();
        match &node.node_type {
            NodeType::Trigger => Ok(variables),
            NodeType::HttpRequest | NodeType::Code | NodeType::Condition | NodeType::Loop => {
                self.inline_runner.run(node, &variables).await
            }
            NodeType::External(_) => self.send_to_executor_service(live, node).await,
        }
    }

    /// Publish `node.execute.request`, then await a correlated response,
    /// cancellation, or a hard 10 s timeout — whichever comes first.
    async fn send_to_executor_service(&self, live: &LiveExecutor, node: &Node) -> Result<Value, String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_requests.write().insert(request_id.clone(), PendingResponse { sender: tx });

        let _ = self.event_bus.publish(
            Event::new(Topic::NodeExecuteRequest.as_str(), &live.execution_id, "execution")
                .with_payload("requestId", serde_json::json!(request_id))
                .with_payload("nodeId", serde_json::json!(node.id))
                .with_payload("nodeType", serde_json::json!(node.node_type.to_string()))
                .with_payload("parameters", serde_json::json!(node.parameters))
                .with_payload("inputData", live.context.variables()),
        );

        let result = tokio::select! {
            received = rx => received.map_err(|_| "node execute response channel closed".to_string()),
            _ = live.cancel_token.cancelled() => Err("execution cancelled".to_string()),
            _ = tokio::time::sleep(Duration::from_secs(10)) => Err("timeout waiting for node execution response".to_string()),
        };

        self.pending_requests.write().remove(&request_id);
        result
    }

    /// Bus handler: deliver a `node.execute.response` event to its waiting
    /// caller, if any (best-effort; unknown or stale request ids are
    /// silently dropped).
    pub fn handle_node_execute_response(&self, event: &Event) {
        let Some(request_id) = event.payload.get("requestId").and_then(|v| v.as_str()) else { return };
        if let Some(pending) = self.pending_requests.write().remove(request_id) {
            let result = event.payload.get("result").cloned().unwrap_or(Value::Null);
            let _ = pending.sender.send(result);
        }
    }

    async fn maybe_checkpoint(&self, live: &LiveExecutor) {
        let version = self.checkpoint_version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = live.context.snapshot();
        let state = ExecutionState {
            execution_id: live.execution_id.clone(),
            workflow_id: live.workflow.id.clone(),
            status: live.state_machine.read().status(),
            variables: snapshot.variables,
            node_outputs: snapshot.node_outputs,
            completed_nodes: live.completed_nodes.lock().clone(),
            pending_nodes: live.pending_nodes.lock().clone(),
            errors: snapshot.errors,
            start_time: live.context.start_time,
            last_checkpoint_time: Utc::now(),
        };
        let checkpoint = Checkpoint::full_snapshot(&live.execution_id, state, version);
        if let Err(err) = self.checkpoints.save_checkpoint(checkpoint).await {
            tracing::warn!(target: "loomwork::orchestrator", %err, "checkpoint enqueue failed");
        }
    }

    /// Best-effort publish of `execution.state_changed`, carrying the
    /// from/to statuses and the triggering transition event.
    fn publish_state_changed(&self, execution_id: &str, from: ExecutionStatus, to: ExecutionStatus, event: TransitionEvent) {
        let _ = self.event_bus.publish(
            Event::new(Topic::ExecutionStateChanged.as_str(), execution_id, "execution")
                .with_payload("from", serde_json::json!(from))
                .with_payload("to", serde_json::json!(to))
                .with_payload("event", serde_json::json!(event)),
        );
    }

    async fn complete_execution(&self, live: &LiveExecutor) {
        let from = live.state_machine.read().status();
        if let Err(err) = live.state_machine.write().apply(TransitionEvent::Complete, Value::Null) {
            tracing::warn!(target: "loomwork::orchestrator", %err, "complete transition rejected");
            return;
        }
        self.publish_state_changed(&live.execution_id, from, ExecutionStatus::Success, TransitionEvent::Complete);
        let snapshot = live.context.snapshot();
        let mut execution = match self.executions.get_execution(&live.execution_id).await {
            Ok(execution) => execution,
            Err(_) => return,
        };
        execution.mark_completed(snapshot.variables);
        let _ = self.executions.save_execution(execution).await;
        let _ = self.event_bus.publish(Event::new(Topic::ExecutionCompleted.as_str(), &live.execution_id, "execution"));
    }

    async fn handle_execution_error(&self, live: &LiveExecutor, error: ExecutionError) {
        let from = live.state_machine.read().status();
        if live
            .state_machine
            .write()
            .apply(TransitionEvent::Fail, serde_json::json!({"error": error.message, "code": error.kind}))
            .is_ok()
        {
            self.publish_state_changed(&live.execution_id, from, ExecutionStatus::Failed, TransitionEvent::Fail);
        }
        if let Ok(mut execution) = self.executions.get_execution(&live.execution_id).await {
            execution.mark_failed(error.message.clone());
            let _ = self.executions.save_execution(execution).await;
        }
        let _ = self.event_bus.publish(
            Event::new(Topic::ExecutionFailed.as_str(), &live.execution_id, "execution")
                .with_payload("error", serde_json::json!(error.message)),
        );
    }

    /// Cancellation token for a live execution, if it is still running.
    pub fn cancel_token(&self, execution_id: &str) -> Option<CancellationToken> {
        self.live.read().get(execution_id).map(|live| live.cancel_token.clone())
    }

    /// Every 30 s: cancel any live executor whose wall-clock age exceeds
    /// its workflow's configured timeout.
    pub async fn monitor_timeouts_once(&self) {
        let stale: Vec<Arc<LiveExecutor>> = self
            .live
            .read()
            .values()
            .filter(|live| live.started_at.elapsed() > live.timeout)
            .cloned()
            .collect();
        for live in stale {
            live.cancel_token.cancel();
        }
    }
}

#[async_trait]
impl ExecutionDispatcher for Orchestrator {
    async fn resume_pending(&self, state: ExecutionState) -> Result<(), String> {
        let Some(workflow) = self.workflows.load(&state.workflow_id, None).await.ok() else {
            return Err(format!("workflow {} not found", state.workflow_id));
        };
        let context = Arc::new(ExecutionContext::from_state(&state.execution_id, &state));
        let mut state_machine = ExecutionStateMachine::new();
        let _ = state_machine.apply(TransitionEvent::Start, Value::Null);
        self.publish_state_changed(&state.execution_id, ExecutionStatus::Pending, ExecutionStatus::Running, TransitionEvent::Start);

        let cancellation_ctx = self.cancellation.register(state.execution_id.clone());
        let live = Arc::new(LiveExecutor {
            timeout: workflow.settings.timeout,
            workflow,
            execution_id: state.execution_id.clone(),
            context,
            state_machine: RwLock::new(state_machine),
            cancel_token: cancellation_ctx.child_token(),
            started_at: std::time::Instant::now(),
            completed_nodes: parking_lot::Mutex::new(state.completed_nodes.clone()),
            pending_nodes: parking_lot::Mutex::new(state.pending_nodes.clone()),
        });
        self.live.write().insert(state.execution_id.clone(), Arc::clone(&live));

        match self.walk_graph_from_checkpoint(&live, &state).await {
            Ok(()) => self.complete_execution(&live).await,
            Err(error) => self.handle_execution_error(&live, error).await,
        }
        self.live.write().remove(&state.execution_id);
        self.cancellation.forget(&state.execution_id);
        Ok(())
    }

    async fn execute_workflow(&self, workflow_id: &str, input: Value) -> Result<String, String> {
        let Some(strong) = self.self_ref.upgrade() else {
            return Err("orchestrator is shutting down".to_string());
        };
        let execution = strong.execute_workflow(workflow_id, input).await.map_err(|e| e.to_string())?;
        Ok(execution.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationManager;
    use crate::checkpoint::memory::InMemoryCheckpointer;
    use crate::checkpoint::{CheckpointBatcher, Checkpointer};
    use crate::model::{Connection, Node, NodeConfig, Workflow};
    use crate::repository::{InMemoryExecutionRepository, InMemoryWorkflowRepository};

    fn linear_workflow() -> Workflow {
        Workflow::new("wf-1", 1)
            .with_node(Node::new("start", NodeType::Trigger))
            .with_node(Node::new("n1", NodeType::Code))
            .with_connection(Connection::new("start", "n1"))
    }

    async fn build_orchestrator() -> (Arc<Orchestrator>, Arc<InMemoryWorkflowRepository>) {
        let workflows = Arc::new(InMemoryWorkflowRepository::new());
        let mut workflow = linear_workflow();
        workflow.is_active = true;
        workflows.insert(workflow);

        let executions = Arc::new(InMemoryExecutionRepository::new());
        let bus = Arc::new(EventBus::default());
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let batcher = CheckpointBatcher::new(checkpointer, Duration::from_millis(50), 10, Duration::from_secs(5));
        let cancellation = CancellationManager::new(bus.clone(), 0.8);
        let orchestrator =
            Orchestrator::new(workflows.clone(), executions, bus, batcher, Arc::new(DefaultInlineRunner), cancellation);
        (orchestrator, workflows)
    }

    #[tokio::test]
    async fn execute_workflow_rejects_inactive_workflow() {
        let (orchestrator, workflows) = build_orchestrator().await;
        let mut workflow = linear_workflow();
        workflow.is_active = false;
        workflows.insert(workflow);

        let result = orchestrator.execute_workflow("wf-1", serde_json::json!({})).await;
        assert!(matches!(result, Err(OrchestratorError::WorkflowInactive(_))));
    }

    #[tokio::test]
    async fn execute_workflow_runs_to_completion() {
        let (orchestrator, _workflows) = build_orchestrator().await;
        let execution = orchestrator.execute_workflow("wf-1", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(orchestrator.live.read().get(&execution.id).is_none());
    }

    #[test]
    fn node_config_defaults_have_no_retries() {
        let config = NodeConfig::default();
        assert_eq!(config.max_retries, 0);
    }

    #[tokio::test]
    async fn checkpoint_carries_real_completed_and_pending_nodes() {
        let workflows = Arc::new(InMemoryWorkflowRepository::new());
        let mut workflow = Workflow::new("wf-chain", 1)
            .with_node(Node::new("start", NodeType::Trigger))
            .with_node(Node::new("n1", NodeType::Code))
            .with_node(Node::new("n2", NodeType::Code))
            .with_connection(Connection::new("start", "n1"))
            .with_connection(Connection::new("n1", "n2"));
        workflow.is_active = true;
        workflows.insert(workflow);

        let executions = Arc::new(InMemoryExecutionRepository::new());
        let bus = Arc::new(EventBus::default());
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let batcher = CheckpointBatcher::new(checkpointer.clone(), Duration::from_millis(10), 1, Duration::from_secs(5));
        let cancellation = CancellationManager::new(bus.clone(), 0.8);
        let orchestrator =
            Orchestrator::new(workflows, executions, bus, batcher, Arc::new(DefaultInlineRunner), cancellation);

        let execution = orchestrator.execute_workflow("wf-chain", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let checkpoint = checkpointer.get_latest_checkpoint(&execution.id).await.unwrap();
        assert!(checkpoint.state.completed_nodes.contains(&"start".to_string()));
        assert!(checkpoint.state.completed_nodes.contains(&"n1".to_string()));
        assert!(checkpoint.state.completed_nodes.contains(&"n2".to_string()));
        assert!(checkpoint.state.pending_nodes.is_empty());
    }

    struct CountingRunner {
        calls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InlineNodeRunner for CountingRunner {
        async fn run(&self, node: &Node, variables: &Value) -> Result<Value, String> {
            self.calls.lock().push(node.id.clone());
            Ok(variables.clone())
        }
    }

    #[tokio::test]
    async fn resume_pending_redrives_only_the_checkpointed_frontier() {
        let workflows = Arc::new(InMemoryWorkflowRepository::new());
        let mut workflow = Workflow::new("wf-1", 1)
            .with_node(Node::new("n1", NodeType::Code))
            .with_node(Node::new("n2", NodeType::Code))
            .with_node(Node::new("n3", NodeType::Code))
            .with_connection(Connection::new("n1", "n2"))
            .with_connection(Connection::new("n2", "n3"));
        workflow.is_active = true;
        workflows.insert(workflow);

        let executions = Arc::new(InMemoryExecutionRepository::new());
        let bus = Arc::new(EventBus::default());
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let batcher = CheckpointBatcher::new(checkpointer, Duration::from_millis(50), 10, Duration::from_secs(5));
        let cancellation = CancellationManager::new(bus.clone(), 0.8);
        let runner = Arc::new(CountingRunner { calls: parking_lot::Mutex::new(Vec::new()) });
        let orchestrator = Orchestrator::new(workflows, executions, bus, batcher, runner.clone(), cancellation);

        let mut state = ExecutionState::new("exec-resume", "wf-1", serde_json::json!({}));
        state.completed_nodes = vec!["n1".to_string(), "n2".to_string()];
        state.pending_nodes = vec!["n3".to_string()];

        orchestrator.resume_pending(state).await.unwrap();

        assert_eq!(*runner.calls.lock(), vec!["n3".to_string()]);
    }
}
