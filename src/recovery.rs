//! Recovery Manager (C8): re-drives failed executions from their latest
//! checkpoint under a selectable strategy, backing off between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::checkpoint::Checkpointer;
use crate::event_bus::{Event, EventBus, Topic};
use crate::model::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Resume,
    Restart,
    Rollback,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RecoveryTask {
    pub execution_id: String,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    pub attempts: u32,
}

/// What the recovery manager needs from the orchestrator to actually
/// re-drive an execution; kept as a trait so this module doesn't depend on
/// the orchestrator's concrete type.
#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    async fn resume_pending(&self, state: ExecutionState) -> Result<(), String>;
    async fn execute_workflow(&self, workflow_id: &str, input: serde_json::Value) -> Result<String, String>;
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RecoveryError {
    #[error("no checkpoint available for execution {0}")]
    #[diagnostic(code(loomwork::recovery::no_checkpoint))]
    NoCheckpoint(String),

    #[error("rollback requires at least 2 checkpoints, execution {0} has fewer")]
    #[diagnostic(code(loomwork::recovery::insufficient_checkpoints))]
    InsufficientCheckpoints(String),

    #[error("dispatcher error: {0}")]
    #[diagnostic(code(loomwork::recovery::dispatch_failed))]
    DispatchFailed(String),
}

pub struct RecoveryManager {
    checkpointer: Arc<dyn Checkpointer>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    event_bus: Arc<EventBus>,
    tasks: Mutex<FxHashMap<String, RecoveryTask>>,
    recovery_timeout: Duration,
    max_attempts: u32,
}

impl RecoveryManager {
    pub fn new(
        checkpointer: Arc<dyn Checkpointer>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        event_bus: Arc<EventBus>,
        recovery_timeout: Duration,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            checkpointer,
            dispatcher,
            event_bus,
            tasks: Mutex::new(FxHashMap::default()),
            recovery_timeout,
            max_attempts,
        })
    }

    /// Kick off recovery for `execution_id`, running `perform_recovery` in
    /// the background bounded by `recoveryTimeout`.
    pub fn recover_execution(self: &Arc<Self>, execution_id: impl Into<String>, strategy: RecoveryStrategy) {
        let execution_id = execution_id.into();
        {
            let mut tasks = self.tasks.lock();
            tasks.insert(
                execution_id.clone(),
                RecoveryTask { execution_id: execution_id.clone(), strategy, status: RecoveryStatus::Pending, attempts: 0 },
            );
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_with_backoff(execution_id).await;
        });
    }

    async fn run_with_backoff(self: &Arc<Self>, execution_id: String) {
        loop {
            let (strategy, attempts) = {
                let mut tasks = self.tasks.lock();
                let Some(task) = tasks.get_mut(&execution_id) else { return };
                task.status = RecoveryStatus::Running;
                (task.strategy, task.attempts)
            };

            let result = tokio::time::timeout(self.recovery_timeout, self.perform_recovery(&execution_id, strategy)).await;

            match &result {
                Ok(Ok(())) => {
                    let mut tasks = self.tasks.lock();
                    if let Some(task) = tasks.get_mut(&execution_id) {
                        task.status = RecoveryStatus::Completed;
                    }
                    tasks.remove(&execution_id);
                    let _ = self.event_bus.publish(
                        Event::new(Topic::RecoveryCompleted.as_str(), &execution_id, "execution")
                            .with_payload("strategy", serde_json::json!(format!("{strategy:?}"))),
                    );
                    return;
                }
                Ok(Err(_)) | Err(_) => {
                    let message = match &result {
                        Ok(Err(err)) => err.to_string(),
                        _ => "recovery timed out".to_string(),
                    };
                    let next_attempts = attempts + 1;
                    let should_fail = {
                        let mut tasks = self.tasks.lock();
                        let Some(task) = tasks.get_mut(&execution_id) else { return };
                        task.attempts = next_attempts;

                        if next_attempts >= self.max_attempts {
                            task.status = RecoveryStatus::Failed;
                            true
                        } else {
                            false
                        }
                    };

                    if should_fail {
                        let _ = self.event_bus.publish(
                            Event::new(Topic::RecoveryFailed.as_str(), &execution_id, "execution")
                                .with_payload("error", serde_json::json!(message))
                                .with_payload("attempts", serde_json::json!(next_attempts)),
                        );
                        self.tasks.lock().remove(&execution_id);
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(u64::from(next_attempts) * 30)).await;
                }
            }
        }
    }

    async fn perform_recovery(&self, execution_id: &str, strategy: RecoveryStrategy) -> Result<(), RecoveryError> {
        match strategy {
            RecoveryStrategy::Resume => {
                let checkpoint = self
                    .checkpointer
                    .get_latest_checkpoint(execution_id)
                    .await
                    .map_err(|_| RecoveryError::NoCheckpoint(execution_id.to_string()))?;
                self.dispatcher
                    .resume_pending(checkpoint.state)
                    .await
                    .map_err(RecoveryError::DispatchFailed)
            }
            RecoveryStrategy::Restart => {
                let checkpoint = self
                    .checkpointer
                    .get_latest_checkpoint(execution_id)
                    .await
                    .map_err(|_| RecoveryError::NoCheckpoint(execution_id.to_string()))?;
                self.dispatcher
                    .execute_workflow(&checkpoint.state.workflow_id, checkpoint.state.variables)
                    .await
                    .map(|_| ())
                    .map_err(RecoveryError::DispatchFailed)
            }
            RecoveryStrategy::Rollback => {
                let checkpoints = self
                    .checkpointer
                    .list_checkpoints(execution_id, 2)
                    .await
                    .map_err(|_| RecoveryError::NoCheckpoint(execution_id.to_string()))?;
                if checkpoints.len() < 2 {
                    return Err(RecoveryError::InsufficientCheckpoints(execution_id.to_string()));
                }
                let second_latest = checkpoints.into_iter().nth(1).unwrap();
                self.dispatcher
                    .resume_pending(second_latest.state)
                    .await
                    .map_err(RecoveryError::DispatchFailed)
            }
            RecoveryStrategy::Skip => {
                let checkpoint = self
                    .checkpointer
                    .get_latest_checkpoint(execution_id)
                    .await
                    .map_err(|_| RecoveryError::NoCheckpoint(execution_id.to_string()))?;
                let mut state = checkpoint.state;
                if let Some(failed_node) = state.pending_nodes.pop() {
                    state.completed_nodes.push(failed_node);
                }
                self.dispatcher.resume_pending(state).await.map_err(RecoveryError::DispatchFailed)
            }
        }
    }

    /// React to a `execution.failed` or `node.execution.failed` event,
    /// starting recovery with `resume`, switching to `skip` if the payload
    /// marks the failure as non-retryable.
    pub fn handle_failure_event(self: &Arc<Self>, event: &Event) {
        let retryable = event
            .payload
            .get("retryable")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let strategy = if retryable { RecoveryStrategy::Resume } else { RecoveryStrategy::Skip };
        self.recover_execution(event.aggregate_id.clone(), strategy);
    }

    pub fn task(&self, execution_id: &str) -> Option<RecoveryTask> {
        self.tasks.lock().get(execution_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::memory::InMemoryCheckpointer;
    use crate::model::Checkpoint;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingDispatcher {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl ExecutionDispatcher for FailingDispatcher {
        async fn resume_pending(&self, _state: ExecutionState) -> Result<(), String> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err("transient dispatch failure".to_string())
            } else {
                Ok(())
            }
        }

        async fn execute_workflow(&self, _workflow_id: &str, _input: serde_json::Value) -> Result<String, String> {
            Ok("new-exec".to_string())
        }
    }

    #[tokio::test]
    async fn resume_strategy_requires_a_checkpoint() {
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let dispatcher = Arc::new(FailingDispatcher { fail_times: AtomicU32::new(0) });
        let bus = Arc::new(EventBus::default());
        let manager = RecoveryManager::new(checkpointer, dispatcher, bus, Duration::from_secs(5), 3);

        let result = manager.perform_recovery("missing-exec", RecoveryStrategy::Resume).await;
        assert!(matches!(result, Err(RecoveryError::NoCheckpoint(_))));
    }

    #[tokio::test]
    async fn resume_succeeds_once_checkpoint_and_dispatcher_cooperate() {
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let state = ExecutionState::new("exec-1", "wf-1", serde_json::json!({}));
        checkpointer
            .save_checkpoint_sync(Checkpoint::full_snapshot("exec-1", state, 1))
            .await
            .unwrap();
        let dispatcher = Arc::new(FailingDispatcher { fail_times: AtomicU32::new(0) });
        let bus = Arc::new(EventBus::default());
        let manager = RecoveryManager::new(checkpointer, dispatcher, bus, Duration::from_secs(5), 3);

        let result = manager.perform_recovery("exec-1", RecoveryStrategy::Resume).await;
        assert!(result.is_ok());
    }
}
