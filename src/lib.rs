//! # loomwork
//!
//! Execution core for a distributed workflow automation platform: a graph
//! orchestrator, checkpointed recovery, a bounded worker pool with
//! autoscaling, and a leader-elected cron scheduler, all wired together
//! through a single at-least-once event bus.
//!
//! ## Module guide
//!
//! - [`event_bus`] — publish/subscribe backbone every other component
//!   fans in and out through.
//! - [`model`] — workflow definitions, execution records, and the
//!   in-memory execution context.
//! - [`state_machine`] — per-execution lifecycle transitions.
//! - [`orchestrator`] — drives a workflow from start to a terminal state.
//! - [`worker_pool`] — bounded, autoscaling concurrent task execution.
//! - [`retry`] — classification, backoff strategies, and circuit breaking.
//! - [`cancellation`] — cooperative cancellation and timeout enforcement.
//! - [`checkpoint`] — durable execution-state snapshots.
//! - [`recovery`] — re-drives failed executions from their last checkpoint.
//! - [`cron`] — leader-elected schedule triggering.
//! - [`repository`] — storage contracts the core depends on but doesn't own.
//! - [`config`] — environment-driven tuning knobs.
//! - [`errors`] — shared error taxonomy.
//! - [`telemetry`] — human-readable event/error rendering.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use loomwork::Core;
//! use loomwork::config::CoreConfig;
//! use loomwork::model::{Node, NodeType, Workflow};
//! use loomwork::repository::InMemoryWorkflowRepository;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let workflows = Arc::new(InMemoryWorkflowRepository::new());
//! workflows.insert(Workflow::new("greet", 1).with_node(Node::new("start", NodeType::Trigger)));
//!
//! let core = Core::bootstrap(CoreConfig::from_env(), workflows).await?;
//! let execution = core.orchestrator.execute_workflow("greet", serde_json::json!({})).await?;
//! println!("started {}", execution.id);
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod cron;
pub mod errors;
pub mod event_bus;
pub mod model;
pub mod orchestrator;
pub mod recovery;
pub mod repository;
pub mod retry;
pub mod state_machine;
pub mod telemetry;
pub mod worker_pool;

use std::sync::Arc;

use cancellation::CancellationManager;
use checkpoint::memory::InMemoryCheckpointer;
use checkpoint::CheckpointBatcher;
use config::CoreConfig;
use cron::{CronScheduler, InMemoryLeaderLattice, LeaderLattice};
use event_bus::EventBus;
use orchestrator::{DefaultInlineRunner, Orchestrator};
use recovery::RecoveryManager;
use repository::{ExecutionRepository, InMemoryExecutionRepository, WorkflowRepository};
use worker_pool::WorkerPool;

/// Assembles every long-lived component behind one `Arc`-friendly handle.
///
/// `bootstrap` spawns one detached background task per router/monitor
/// (response routing, failure routing, timeout sweep, misfire sweep,
/// leader-election tick), each holding its own `Arc` clone of the
/// component it drives. They run for the life of the process; there's no
/// supervised shutdown here, matching the single-process, run-until-killed
/// deployment this constructor targets.
pub struct Core {
    pub event_bus: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub worker_pool: Arc<WorkerPool>,
    pub recovery: Arc<RecoveryManager>,
    pub cron: Arc<CronScheduler>,
    pub checkpoints: Arc<CheckpointBatcher>,
    pub cancellation: Arc<CancellationManager>,
}

impl Core {
    /// Wire up a fully in-memory runtime: an in-memory checkpoint store, an
    /// in-memory execution repository, and (absent a real `LeaderLattice`)
    /// an always-leader election fallback. Swap individual collaborators
    /// via the lower-level constructors on each component for a durable,
    /// multi-process deployment.
    pub async fn bootstrap(
        config: CoreConfig,
        workflows: Arc<dyn WorkflowRepository>,
    ) -> Result<Arc<Self>, cron::CronError> {
        let event_bus = Arc::new(EventBus::default());
        let executions: Arc<dyn ExecutionRepository> = Arc::new(InMemoryExecutionRepository::new());

        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let checkpoints = CheckpointBatcher::new(
            checkpointer.clone(),
            config.checkpoint.batch_interval,
            config.checkpoint.batch_size,
            config.checkpoint.enqueue_timeout,
        );

        let cancellation = CancellationManager::new(event_bus.clone(), config.cancellation.warn_threshold);

        let orchestrator = Orchestrator::new(
            workflows,
            executions,
            event_bus.clone(),
            checkpoints.clone(),
            Arc::new(DefaultInlineRunner),
            cancellation.clone(),
        );

        let recovery = RecoveryManager::new(
            checkpointer,
            orchestrator.clone(),
            event_bus.clone(),
            config.recovery.recovery_timeout,
            config.recovery.max_recovery_attempts,
        );

        let leader: Arc<dyn LeaderLattice> = InMemoryLeaderLattice::new();
        let cron = CronScheduler::new(leader, event_bus.clone(), config.scheduler.max_catch_up).await?;

        let worker_pool = Arc::new(WorkerPool::new(
            config.worker_pool.clone(),
            worker_pool_echo_executor(),
            Some(event_bus.clone()),
        ));
        worker_pool.start().await;

        spawn_response_router(event_bus.clone(), orchestrator.clone());
        spawn_failure_router(event_bus.clone(), recovery.clone());
        spawn_timeout_monitor(orchestrator.clone());
        spawn_misfire_monitor(cron.clone(), config.scheduler.misfire_check_interval);
        spawn_election_loop(cron.clone(), config.scheduler.leader_renew_interval, config.scheduler.leader_ttl);

        Ok(Arc::new(Self { event_bus, orchestrator, worker_pool, recovery, cron, checkpoints, cancellation }))
    }
}

/// Forward `node.execute.response` events to the orchestrator's pending
/// request/response correlation map.
fn spawn_response_router(event_bus: Arc<EventBus>, orchestrator: Arc<Orchestrator>) {
    let mut stream = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = stream.recv().await {
            if event.event_type == event_bus::Topic::NodeExecuteResponse.as_str() {
                orchestrator.handle_node_execute_response(&event);
            }
        }
    });
}

/// Forward `execution.failed`/`node.execution.failed` events to the
/// recovery manager so it can decide whether to re-drive the execution.
fn spawn_failure_router(event_bus: Arc<EventBus>, recovery: Arc<RecoveryManager>) {
    let mut stream = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = stream.recv().await {
            if event.event_type == event_bus::Topic::ExecutionFailed.as_str() {
                recovery.handle_failure_event(&event);
            }
        }
    });
}

/// Every 30s, cancel any live executor that has exceeded its workflow's
/// configured timeout.
fn spawn_timeout_monitor(orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            orchestrator.monitor_timeouts_once().await;
        }
    });
}

/// Drive the cron scheduler's misfire sweep on `misfire_check_interval`.
fn spawn_misfire_monitor(cron: Arc<CronScheduler>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cron.check_missed_runs().await;
        }
    });
}

/// Drive the cron scheduler's leader-election tick on
/// `leader_renew_interval`, with `leader_ttl` as the lease length.
fn spawn_election_loop(cron: Arc<CronScheduler>, renew_interval: std::time::Duration, ttl: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(renew_interval);
        loop {
            ticker.tick().await;
            cron.election_tick(ttl).await;
        }
    });
}

/// Trivial default executor: echoes the task payload back as its output.
/// Replace with a real job executor when wiring a deployment.
fn worker_pool_echo_executor() -> worker_pool::ExecutorFn {
    Arc::new(|task: worker_pool::WorkerTask| Box::pin(async move { Ok(task.payload) }))
}
