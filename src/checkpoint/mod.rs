//! Checkpoint Store (C2): durable + hot-cache snapshots of per-execution
//! state, with an async batched writer and an hourly TTL sweep.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Checkpoint, ExecutionState};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint queue full")]
    #[diagnostic(code(loomwork::checkpoint::queue_full))]
    QueueFull,

    #[error("no checkpoint found for execution {0}")]
    #[diagnostic(code(loomwork::checkpoint::not_found))]
    NotFound(String),

    #[error(transparent)]
    #[diagnostic(code(loomwork::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Storage contract the batcher and recovery manager depend on. An
/// in-memory implementation ([`memory::InMemoryCheckpointer`]) ships for
/// tests and single-process deployments; a durable implementation can be
/// layered behind the same trait using `sqlx` under the `sqlite`/`postgres`
/// features.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save_checkpoint_sync(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;
    async fn get_latest_checkpoint(&self, execution_id: &str) -> Result<Checkpoint, CheckpointError>;
    async fn get_checkpoint_by_id(&self, id: &str) -> Result<Checkpoint, CheckpointError>;
    async fn list_checkpoints(&self, execution_id: &str, limit: usize) -> Result<Vec<Checkpoint>, CheckpointError>;
    async fn delete_checkpoint(&self, id: &str) -> Result<(), CheckpointError>;
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CheckpointError>;

    async fn save_execution_state(&self, execution_id: &str, state: ExecutionState, version: u64) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint::full_snapshot(execution_id, state, version);
        self.save_checkpoint_sync(checkpoint).await
    }

    async fn get_execution_state(&self, execution_id: &str) -> Result<ExecutionState, CheckpointError> {
        Ok(self.get_latest_checkpoint(execution_id).await?.state)
    }
}

/// Async batching front for a [`Checkpointer`]: `save_checkpoint` enqueues
/// and returns once a background task has accepted it; the task drains the
/// queue every second or once 10 entries have accumulated, whichever first,
/// and flushes the residual on [`CheckpointBatcher::stop`].
pub struct CheckpointBatcher {
    store: std::sync::Arc<dyn Checkpointer>,
    tx: parking_lot::Mutex<Option<flume::Sender<Checkpoint>>>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    enqueue_timeout: std::time::Duration,
}

impl CheckpointBatcher {
    pub fn new(
        store: std::sync::Arc<dyn Checkpointer>,
        batch_interval: std::time::Duration,
        batch_size: usize,
        enqueue_timeout: std::time::Duration,
    ) -> std::sync::Arc<Self> {
        let (tx, rx) = flume::unbounded();
        let batcher = std::sync::Arc::new(Self {
            store: std::sync::Arc::clone(&store),
            tx: parking_lot::Mutex::new(Some(tx)),
            worker: parking_lot::Mutex::new(None),
            enqueue_timeout,
        });

        let store_for_worker = store;
        let handle = tokio::spawn(async move {
            let mut pending = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(batch_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::flush(&store_for_worker, &mut pending).await;
                    }
                    received = rx.recv_async() => {
                        match received {
                            Ok(checkpoint) => {
                                pending.push(checkpoint);
                                if pending.len() >= batch_size {
                                    Self::flush(&store_for_worker, &mut pending).await;
                                }
                            }
                            Err(_) => {
                                Self::flush(&store_for_worker, &mut pending).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
        *batcher.worker.lock() = Some(handle);
        batcher
    }

    async fn flush(store: &std::sync::Arc<dyn Checkpointer>, pending: &mut Vec<Checkpoint>) {
        for checkpoint in pending.drain(..) {
            if let Err(err) = store.save_checkpoint_sync(checkpoint).await {
                tracing::warn!(target: "loomwork::checkpoint", %err, "batched checkpoint flush failed");
            }
        }
    }

    /// Enqueue `checkpoint`; fails with `queue full` if the send doesn't
    /// land within the configured enqueue timeout (the queue itself is
    /// unbounded, so this only trips if the receiver task has died).
    pub async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(CheckpointError::QueueFull);
        };
        tokio::time::timeout(self.enqueue_timeout, tx.send_async(checkpoint))
            .await
            .map_err(|_| CheckpointError::QueueFull)?
            .map_err(|_| CheckpointError::QueueFull)
    }

    pub async fn save_checkpoint_sync(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.store.save_checkpoint_sync(checkpoint).await
    }

    pub async fn stop(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.await;
        }
    }
}

/// Delete checkpoints older than `ttl` once, for use inside an hourly GC
/// loop spawned by the caller (kept as a free function so it can be driven
/// either by a `tokio::time::interval` or invoked directly in tests).
pub async fn run_gc_sweep(store: &dyn Checkpointer, ttl: std::time::Duration) -> Result<usize, CheckpointError> {
    let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(7));
    store.delete_older_than(cutoff).await
}
