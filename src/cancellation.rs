//! Cancellation & Timeout Manager (C5): per-execution cancellation contexts,
//! global/per-node deadline timers, and graceful-then-forceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::event_bus::{Event, EventBus, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CancellationError {
    #[error("execution {0} already has a cancellation in progress or completed")]
    #[diagnostic(code(loomwork::cancellation::duplicate))]
    Duplicate(String),

    #[error("no cancellation context registered for execution {0}")]
    #[diagnostic(code(loomwork::cancellation::not_found))]
    NotFound(String),
}

#[derive(Clone, Copy, Debug)]
pub struct TimeoutPolicy {
    pub auto_cancel: bool,
    pub retry_on_timeout: bool,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { auto_cancel: true, retry_on_timeout: false }
    }
}

/// Per-execution cancellation state: the token, why/who requested it, and
/// progress through the graceful-cancel sequence.
pub struct CancellationContext {
    pub execution_id: String,
    pub token: CancellationToken,
    pub reason: Mutex<Option<String>>,
    pub requested_by: Mutex<Option<String>>,
    pub status: Mutex<CancellationStatus>,
    pub cancelled_nodes: Mutex<Vec<String>>,
}

impl CancellationContext {
    fn new(execution_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            execution_id: execution_id.into(),
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            requested_by: Mutex::new(None),
            status: Mutex::new(CancellationStatus::Pending),
            cancelled_nodes: Mutex::new(Vec::new()),
        })
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn status(&self) -> CancellationStatus {
        *self.status.lock()
    }
}

struct TimeoutHandles {
    global: tokio::task::JoinHandle<()>,
    warning: Option<tokio::task::JoinHandle<()>>,
    nodes: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// Owns the live cancellation contexts and timeout timers for every active
/// execution. One instance is shared between the orchestrator and anything
/// (HTTP layer, cron scheduler) that needs to request a cancel.
pub struct CancellationManager {
    contexts: Mutex<HashMap<String, Arc<CancellationContext>>>,
    timeouts: Mutex<HashMap<String, TimeoutHandles>>,
    event_bus: Arc<EventBus>,
    warn_threshold: f64,
}

impl CancellationManager {
    pub fn new(event_bus: Arc<EventBus>, warn_threshold: f64) -> Arc<Self> {
        Arc::new(Self {
            contexts: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            event_bus,
            warn_threshold,
        })
    }

    /// Register a fresh cancellation context for a newly started execution.
    pub fn register(&self, execution_id: impl Into<String>) -> Arc<CancellationContext> {
        let ctx = CancellationContext::new(execution_id);
        self.contexts.lock().insert(ctx.execution_id.clone(), Arc::clone(&ctx));
        ctx
    }

    pub fn context(&self, execution_id: &str) -> Option<Arc<CancellationContext>> {
        self.contexts.lock().get(execution_id).cloned()
    }

    /// Request cancellation of a running execution. Rejects duplicates once
    /// a prior cancel is in progress or completed.
    pub async fn cancel_execution(
        self: &Arc<Self>,
        execution_id: &str,
        reason: impl Into<String>,
        requested_by: impl Into<String>,
        grace_period: Duration,
        force_cancel: bool,
    ) -> Result<(), CancellationError> {
        let ctx = self
            .context(execution_id)
            .ok_or_else(|| CancellationError::NotFound(execution_id.to_string()))?;

        {
            let mut status = ctx.status.lock();
            if matches!(*status, CancellationStatus::InProgress | CancellationStatus::Completed) {
                return Err(CancellationError::Duplicate(execution_id.to_string()));
            }
            *status = CancellationStatus::InProgress;
            *ctx.reason.lock() = Some(reason.into());
            *ctx.requested_by.lock() = Some(requested_by.into());
        }

        ctx.token.cancel();

        if !force_cancel && !grace_period.is_zero() {
            tokio::time::sleep(grace_period).await;
        }

        let _ = self.event_bus.publish(
            Event::new(Topic::NodesStopRequest.as_str(), execution_id, "execution")
                .with_payload("reason", serde_json::json!(*ctx.reason.lock())),
        );

        self.clear_timeout(execution_id);

        let _ = self.event_bus.publish(
            Event::new(Topic::ExecutionStateChanged.as_str(), execution_id, "execution")
                .with_payload("to", serde_json::json!("cancelled")),
        );
        let _ = self.event_bus.publish(
            Event::new(Topic::ExecutionCancelled.as_str(), execution_id, "execution")
                .with_payload("reason", serde_json::json!(*ctx.reason.lock()))
                .with_payload("requestedBy", serde_json::json!(*ctx.requested_by.lock())),
        );

        *ctx.status.lock() = CancellationStatus::Completed;
        Ok(())
    }

    /// Install global and per-node deadline timers for `execution_id`.
    pub fn set_timeout(
        self: &Arc<Self>,
        execution_id: &str,
        global_timeout: Duration,
        node_timeouts: HashMap<String, Duration>,
        policy: TimeoutPolicy,
    ) {
        let manager = Arc::clone(self);
        let exec_id = execution_id.to_string();
        let global = tokio::spawn({
            let manager = Arc::clone(&manager);
            let exec_id = exec_id.clone();
            async move {
                tokio::time::sleep(global_timeout).await;
                let _ = manager.event_bus.publish(
                    Event::new(Topic::ExecutionTimeout.as_str(), &exec_id, "execution"),
                );
                if policy.auto_cancel {
                    let _ = manager.cancel_execution(&exec_id, "global timeout", "system", Duration::ZERO, true).await;
                }
                if policy.retry_on_timeout {
                    let _ = manager.event_bus.publish(
                        Event::new(Topic::TimeoutRetryTrigger.as_str(), &exec_id, "execution"),
                    );
                }
            }
        });

        let warning = if self.warn_threshold > 0.0 && self.warn_threshold < 1.0 {
            let warn_delay = global_timeout.mul_f64(self.warn_threshold);
            let manager = Arc::clone(&manager);
            let exec_id = exec_id.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(warn_delay).await;
                let _ = manager.event_bus.publish(
                    Event::new(Topic::ExecutionTimeoutWarning.as_str(), &exec_id, "execution"),
                );
            }))
        } else {
            None
        };

        let nodes = node_timeouts
            .into_iter()
            .map(|(node_id, timeout)| {
                let manager = Arc::clone(&manager);
                let exec_id = exec_id.clone();
                let node_id_clone = node_id.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = manager.event_bus.publish(
                        Event::new(Topic::ExecutionTimeout.as_str(), &exec_id, "execution")
                            .with_payload("nodeId", serde_json::json!(node_id_clone)),
                    );
                });
                (node_id, handle)
            })
            .collect();

        self.timeouts
            .lock()
            .insert(execution_id.to_string(), TimeoutHandles { global, warning, nodes });
    }

    /// Abort every timer registered for `execution_id`.
    pub fn clear_timeout(&self, execution_id: &str) {
        if let Some(handles) = self.timeouts.lock().remove(execution_id) {
            handles.global.abort();
            if let Some(warning) = handles.warning {
                warning.abort();
            }
            for (_, handle) in handles.nodes {
                handle.abort();
            }
        }
    }

    /// Drop bookkeeping for a completed execution (idempotent).
    pub fn forget(&self, execution_id: &str) {
        self.clear_timeout(execution_id);
        self.contexts.lock().remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_execution_is_idempotent_against_double_requests() {
        let bus = Arc::new(EventBus::default());
        let manager = CancellationManager::new(bus, 0.8);
        manager.register("exec-1");

        manager
            .cancel_execution("exec-1", "user requested", "tester", Duration::ZERO, true)
            .await
            .unwrap();

        let second = manager
            .cancel_execution("exec-1", "user requested again", "tester", Duration::ZERO, true)
            .await;
        assert!(matches!(second, Err(CancellationError::Duplicate(_))));
    }

    #[tokio::test]
    async fn child_token_cancels_when_root_cancels() {
        let bus = Arc::new(EventBus::default());
        let manager = CancellationManager::new(bus, 0.8);
        let ctx = manager.register("exec-2");
        let child = ctx.child_token();
        assert!(!child.is_cancelled());

        manager
            .cancel_execution("exec-2", "timeout", "system", Duration::ZERO, true)
            .await
            .unwrap();
        assert!(child.is_cancelled());
    }
}
