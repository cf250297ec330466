//! Runtime configuration knobs for the execution core.
//!
//! Every knob can be overridden by an environment variable, loaded via
//! `dotenvy` before the process environment is consulted.

use std::time::Duration;

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Checkpoint store tuning: TTL for GC, cap on listed checkpoints per
/// execution, and the batching window of the async save queue.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub ttl: Duration,
    pub max_checkpoints: usize,
    pub batch_interval: Duration,
    pub batch_size: usize,
    pub enqueue_timeout: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl: env_duration_secs("LOOMWORK_CHECKPOINT_TTL_SECS", Duration::from_secs(7 * 24 * 3600)),
            max_checkpoints: env_usize("LOOMWORK_MAX_CHECKPOINTS", 100),
            batch_interval: Duration::from_secs(1),
            batch_size: 10,
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

/// Worker pool sizing and autoscaling thresholds.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_cooldown: Duration,
    pub submit_timeout: Duration,
    pub autoscale_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            min_workers: env_usize("LOOMWORK_WORKER_MIN", 2),
            max_workers: env_usize("LOOMWORK_WORKER_MAX", 2 * cpus),
            queue_capacity: env_usize("LOOMWORK_WORKER_QUEUE", 1000),
            scale_up_threshold: env_f64("LOOMWORK_WORKER_SCALE_UP", 0.8),
            scale_down_threshold: env_f64("LOOMWORK_WORKER_SCALE_DOWN", 0.2),
            scale_cooldown: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(5),
            autoscale_interval: Duration::from_secs(10),
        }
    }
}

/// Default retry strategy selection knobs (see `retry` module for the
/// strategies themselves; this just carries the name of the default).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub default_strategy: String,
    pub circuit_max_requests: u32,
    pub circuit_interval: Duration,
    pub circuit_open_timeout: Duration,
    pub circuit_failure_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_strategy: "exponential".to_string(),
            circuit_max_requests: 3,
            circuit_interval: Duration::from_secs(10),
            circuit_open_timeout: Duration::from_secs(30),
            circuit_failure_ratio: 0.6,
        }
    }
}

/// Recovery manager timing knobs.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub recovery_timeout: Duration,
    pub max_recovery_attempts: u32,
    pub check_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_timeout: env_duration_secs("LOOMWORK_RECOVERY_TIMEOUT_SECS", Duration::from_secs(600)),
            max_recovery_attempts: 3,
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Cancellation / timeout manager knobs.
#[derive(Debug, Clone)]
pub struct CancellationConfig {
    pub grace_period: Duration,
    pub warn_threshold: f64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            grace_period: env_duration_secs("LOOMWORK_CANCEL_GRACE_SECS", Duration::from_secs(5)),
            warn_threshold: 0.8,
        }
    }
}

/// Cron scheduler leader-election and misfire knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub leader_ttl: Duration,
    pub leader_renew_interval: Duration,
    pub misfire_check_interval: Duration,
    pub max_catch_up: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leader_ttl: Duration::from_secs(10),
            leader_renew_interval: Duration::from_secs(5),
            misfire_check_interval: Duration::from_secs(60),
            max_catch_up: 50,
        }
    }
}

/// Top-level configuration bundle, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub checkpoint: CheckpointConfig,
    pub worker_pool: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub cancellation: CancellationConfig,
    pub scheduler: SchedulerConfig,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl CoreConfig {
    /// Load configuration, applying `.env` (if present) before reading
    /// environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            redis_url: std::env::var("LOOMWORK_REDIS_URL").ok(),
            database_url: std::env::var("LOOMWORK_DATABASE_URL").ok(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_pool_defaults_respect_min_max_invariant() {
        let cfg = WorkerPoolConfig::default();
        assert!(cfg.min_workers <= cfg.max_workers);
    }

    #[test]
    fn checkpoint_ttl_defaults_to_seven_days() {
        let cfg = CheckpointConfig::default();
        assert_eq!(cfg.ttl, Duration::from_secs(7 * 24 * 3600));
    }
}
