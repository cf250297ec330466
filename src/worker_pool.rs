//! Worker Pool (C3): bounded concurrent execution of [`WorkerTask`] with
//! cooperative, cooldown-protected autoscaling.
//!
//! Spawns a fixed floor of workers against a shared bounded queue, then
//! grows or shrinks that pool under a cooldown-protected autoscaler reacting
//! to utilization and queue depth.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::WorkerPoolConfig;
use crate::event_bus::{Event, EventBus, Topic};

pub type TaskOutput = Result<serde_json::Value, String>;
pub type ExecutorFn =
    Arc<dyn Fn(WorkerTask) -> Pin<Box<dyn Future<Output = TaskOutput> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: String,
    pub payload: serde_json::Value,
    pub timeout: Duration,
}

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerPoolError {
    #[error("submit timed out after queue stayed full for {0:?}")]
    #[diagnostic(code(loomwork::worker_pool::queue_full))]
    QueueFull(Duration),
    #[error("worker pool is stopped")]
    #[diagnostic(code(loomwork::worker_pool::stopped))]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPoolMetrics {
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
}

struct Worker {
    id: String,
    handle: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

struct Shared {
    config: WorkerPoolConfig,
    executor: ExecutorFn,
    event_bus: Option<Arc<EventBus>>,
    running: AtomicBool,
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    active_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
}

/// Bounded concurrent task executor with dynamic worker count.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tx: parking_lot::Mutex<Option<flume::Sender<WorkerTask>>>,
    rx: flume::Receiver<WorkerTask>,
    workers: Arc<AsyncMutex<Vec<Worker>>>,
    autoscale_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, executor: ExecutorFn, event_bus: Option<Arc<EventBus>>) -> Self {
        let (tx, rx) = flume::bounded(config.queue_capacity);
        let shared = Arc::new(Shared {
            config,
            executor,
            event_bus,
            running: AtomicBool::new(true),
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
        });
        Self {
            shared,
            tx: parking_lot::Mutex::new(Some(tx)),
            rx,
            workers: Arc::new(AsyncMutex::new(Vec::new())),
            autoscale_handle: AsyncMutex::new(None),
        }
    }

    /// Spawn `min_workers` workers and the autoscaling background task.
    pub async fn start(self: &Arc<Self>) {
        let min = self.shared.config.min_workers;
        let mut workers = self.workers.lock().await;
        for _ in 0..min {
            workers.push(self.spawn_worker());
        }
        drop(workers);

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.autoscale_loop().await });
        *self.autoscale_handle.lock().await = Some(handle);
    }

    fn spawn_worker(&self) -> Worker {
        let worker_id = format!("worker-{}", self.shared.next_worker_id.fetch_add(1, Ordering::SeqCst));
        let active = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let rx = self.rx.clone();
        let worker_active = Arc::clone(&active);
        let worker_id_for_task = worker_id.clone();
        let handle = tokio::spawn(async move {
            while shared.running.load(Ordering::SeqCst) {
                let Ok(task) = rx.recv_async().await else { break };
                worker_active.store(true, Ordering::SeqCst);
                shared.active_workers.fetch_add(1, Ordering::SeqCst);

                let task_id = task.id.clone();
                let task_timeout = task.timeout;
                let started = Instant::now();
                let fut = (shared.executor)(task);
                let result = tokio::time::timeout(task_timeout, fut).await;

                let (success, error) = match result {
                    Ok(Ok(_)) => {
                        shared.completed_tasks.fetch_add(1, Ordering::SeqCst);
                        (true, None)
                    }
                    Ok(Err(e)) => {
                        shared.failed_tasks.fetch_add(1, Ordering::SeqCst);
                        (false, Some(e))
                    }
                    Err(_) => {
                        shared.failed_tasks.fetch_add(1, Ordering::SeqCst);
                        (false, Some("task timed out".to_string()))
                    }
                };

                if let Some(bus) = &shared.event_bus {
                    let mut event = Event::new(Topic::TaskCompleted.as_str(), task_id, "worker_pool")
                        .with_payload("success", serde_json::json!(success))
                        .with_payload("durationMs", serde_json::json!(started.elapsed().as_millis() as u64))
                        .with_payload("workerId", serde_json::json!(worker_id_for_task));
                    if let Some(err) = error {
                        event = event.with_payload("error", serde_json::json!(err));
                    }
                    let _ = bus.publish(event);
                }

                worker_active.store(false, Ordering::SeqCst);
                shared.active_workers.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Worker { id: worker_id, handle, active }
    }

    /// Push `task` to the bounded queue; fails after 5 s (configurable) if
    /// the queue stays full.
    pub async fn submit(&self, task: WorkerTask) -> Result<(), WorkerPoolError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(WorkerPoolError::Stopped);
        }
        let Some(tx) = self.tx.lock().clone() else {
            return Err(WorkerPoolError::Stopped);
        };
        match tokio::time::timeout(self.shared.config.submit_timeout, tx.send_async(task)).await {
            Ok(Ok(())) => {
                self.shared.total_tasks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(WorkerPoolError::QueueFull(self.shared.config.submit_timeout)),
        }
    }

    pub fn metrics(&self) -> WorkerPoolMetrics {
        WorkerPoolMetrics {
            total_workers: 0, // filled in by caller via `workers.lock()`-aware snapshot below
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
            total_tasks: self.shared.total_tasks.load(Ordering::SeqCst),
            completed_tasks: self.shared.completed_tasks.load(Ordering::SeqCst),
            failed_tasks: self.shared.failed_tasks.load(Ordering::SeqCst),
            queue_size: self.rx.len(),
            queue_capacity: self.shared.config.queue_capacity,
        }
    }

    pub async fn metrics_full(&self) -> WorkerPoolMetrics {
        let mut m = self.metrics();
        m.total_workers = self.workers.lock().await.len();
        m
    }

    async fn autoscale_loop(&self) {
        let mut last_scale = Instant::now() - self.shared.config.scale_cooldown;
        let mut ticker = tokio::time::interval(self.shared.config.autoscale_interval);
        loop {
            ticker.tick().await;
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            if last_scale.elapsed() < self.shared.config.scale_cooldown {
                continue;
            }
            let mut workers = self.workers.lock().await;
            let total = workers.len();
            let active = self.shared.active_workers.load(Ordering::SeqCst);
            let queue_size = self.rx.len();
            let utilization = if total == 0 { 0.0 } else { active as f64 / total as f64 };

            if (utilization > self.shared.config.scale_up_threshold
                || queue_size > self.shared.config.queue_capacity / 2)
                && total < self.shared.config.max_workers
            {
                let worker = self.spawn_worker();
                tracing::debug!(target: "loomwork::worker_pool", worker_id = %worker.id, "scaled up");
                workers.push(worker);
                last_scale = Instant::now();
            } else if utilization < self.shared.config.scale_down_threshold
                && queue_size == 0
                && total > self.shared.config.min_workers
            {
                if let Some(idx) = workers.iter().position(|w| !w.active.load(Ordering::SeqCst)) {
                    let removed = workers.remove(idx);
                    tracing::debug!(target: "loomwork::worker_pool", worker_id = %removed.id, "scaled down");
                    removed.handle.abort();
                    last_scale = Instant::now();
                }
            }
            drop(workers);

            if let Some(bus) = &self.shared.event_bus {
                let metrics = self.metrics_full().await;
                let _ = bus.publish(
                    Event::new(Topic::WorkerPoolMetrics.as_str(), "worker_pool", "worker_pool")
                        .with_payload("totalWorkers", serde_json::json!(metrics.total_workers))
                        .with_payload("activeWorkers", serde_json::json!(metrics.active_workers))
                        .with_payload("queueSize", serde_json::json!(metrics.queue_size))
                        .with_payload("queueCapacity", serde_json::json!(metrics.queue_capacity))
                        .with_payload("totalTasks", serde_json::json!(metrics.total_tasks))
                        .with_payload("completedTasks", serde_json::json!(metrics.completed_tasks))
                        .with_payload("failedTasks", serde_json::json!(metrics.failed_tasks)),
                );
            }
        }
    }

    /// Stop accepting tasks, close the queue, and wait for workers to drain
    /// (bounded by `deadline`).
    pub async fn stop(&self, deadline: Duration) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.tx.lock().take(); // drop the sender so recv_async() unblocks with Err once the queue drains
        if let Some(handle) = self.autoscale_handle.lock().await.take() {
            handle.abort();
        }
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if tokio::time::timeout(deadline, worker.handle).await.is_err() {
                tracing::warn!(target: "loomwork::worker_pool", "worker join timed out during stop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn noop_executor(counter: Arc<StdAtomicUsize>) -> ExecutorFn {
        Arc::new(move |_task| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"ok": true}))
            })
        })
    }

    #[tokio::test]
    async fn submitted_tasks_are_executed() {
        let counter = Arc::new(StdAtomicUsize::new(0));
        let mut config = WorkerPoolConfig::default();
        config.min_workers = 2;
        config.max_workers = 2;
        let pool = Arc::new(WorkerPool::new(config, noop_executor(Arc::clone(&counter)), None));
        pool.start().await;

        for i in 0..5 {
            pool.submit(WorkerTask {
                id: format!("t{i}"),
                payload: serde_json::json!({}),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.metrics().completed_tasks, 5);
        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn min_and_max_worker_bounds_hold_after_start() {
        let counter = Arc::new(StdAtomicUsize::new(0));
        let mut config = WorkerPoolConfig::default();
        config.min_workers = 2;
        config.max_workers = 4;
        let pool = Arc::new(WorkerPool::new(config, noop_executor(counter), None));
        pool.start().await;
        let total = pool.metrics_full().await.total_workers;
        assert!((2..=4).contains(&total));
        pool.stop(Duration::from_secs(1)).await;
    }
}
