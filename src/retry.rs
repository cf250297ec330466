//! Retry/Circuit-Breaker subsystem (C4): polymorphic strategies re-driving
//! transient failures, a per-operation circuit breaker, and a portable
//! text-based error classifier.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorKind, ExecutionError};
use crate::event_bus::{Event, EventBus, Topic};

/// Transient-failure taxonomy the retry manager reasons about; distinct
/// from [`ErrorKind`], which is the broader crate-wide classification —
/// `classify_error` narrows that down to whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientClass {
    Transient,
    Timeout,
    RateLimit,
    Network,
    Service,
    Permanent,
    Unknown,
}

/// Classify raw error text the same way [`crate::errors::ExecutionError::classify`]
/// does, then narrow to a retry-manager-specific class.
pub fn classify_error(message: &str) -> TransientClass {
    match ExecutionError::classify(message) {
        ErrorKind::Timeout => TransientClass::Timeout,
        ErrorKind::RateLimited => TransientClass::RateLimit,
        ErrorKind::NetworkError => TransientClass::Network,
        ErrorKind::ServiceUnavailable => TransientClass::Service,
        ErrorKind::NodeFailed => TransientClass::Transient,
        ErrorKind::Unknown => TransientClass::Unknown,
        _ => TransientClass::Permanent,
    }
}

impl TransientClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, TransientClass::Permanent)
    }

    /// Strategy recommended for this class of failure.
    pub fn recommended_strategy(self) -> RetryStrategy {
        match self {
            TransientClass::RateLimit => RetryStrategy::exponential(5, Duration::from_secs(5), Duration::from_secs(60), 2.0),
            TransientClass::Timeout | TransientClass::Network => {
                RetryStrategy::exponential(3, Duration::from_secs(1), Duration::from_secs(30), 2.0)
            }
            TransientClass::Service => RetryStrategy::fixed(3, Duration::from_secs(10)),
            _ => RetryStrategy::exponential(3, Duration::from_secs(1), Duration::from_secs(30), 2.0),
        }
    }
}

/// A named, bounded-attempt delay schedule.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Exponential { max_attempts: u32, initial: Duration, max: Duration, factor: f64 },
    Linear { max_attempts: u32, increment: Duration },
    Fixed { max_attempts: u32, delay: Duration },
    RandomJitter { max_attempts: u32, min: Duration, max: Duration },
}

impl RetryStrategy {
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration, factor: f64) -> Self {
        Self::Exponential { max_attempts, initial, max, factor }
    }

    pub fn linear(max_attempts: u32, increment: Duration) -> Self {
        Self::Linear { max_attempts, increment }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    pub fn random_jitter(max_attempts: u32, min: Duration, max: Duration) -> Self {
        Self::RandomJitter { max_attempts, min, max }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Exponential { max_attempts, .. }
            | Self::Linear { max_attempts, .. }
            | Self::Fixed { max_attempts, .. }
            | Self::RandomJitter { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before attempt `n` (1-indexed).
    pub fn next_delay(&self, n: u32) -> Duration {
        match self {
            Self::Exponential { initial, max, factor, .. } => {
                let scaled = initial.as_secs_f64() * factor.powi((n.saturating_sub(1)) as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
            Self::Linear { increment, .. } => *increment * n,
            Self::Fixed { delay, .. } => *delay,
            Self::RandomJitter { min, max, .. } => {
                let span = max.saturating_sub(*min).as_secs_f64();
                let jitter = if span > 0.0 { rand::rng().random_range(0.0..span) } else { 0.0 };
                *min + Duration::from_secs_f64(jitter)
            }
        }
    }

    pub fn should_retry(&self, class: TransientClass, attempt: u32) -> bool {
        class.is_retryable() && attempt < self.max_attempts()
    }
}

/// Registry of the default strategies, keyed by name for config-driven
/// selection.
pub fn default_strategies() -> FxHashMap<&'static str, RetryStrategy> {
    let mut map = FxHashMap::default();
    map.insert("exponential", RetryStrategy::exponential(3, Duration::from_secs(1), Duration::from_secs(30), 2.0));
    map.insert("linear", RetryStrategy::linear(3, Duration::from_secs(2)));
    map.insert("fixed", RetryStrategy::fixed(3, Duration::from_secs(5)));
    map.insert("random", RetryStrategy::random_jitter(3, Duration::from_secs(1), Duration::from_secs(10)));
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerWindow {
    state: BreakerState,
    requests: u32,
    failures: u32,
    opened_at: Option<std::time::Instant>,
    window_started_at: std::time::Instant,
}

/// Per-`operation_id` circuit breaker: trips when `requests >= max_requests`
/// and `failures / requests >= failure_ratio` within the rolling `interval`.
pub struct CircuitBreaker {
    max_requests: u32,
    interval: Duration,
    open_timeout: Duration,
    failure_ratio: f64,
    windows: Mutex<FxHashMap<String, BreakerWindow>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Reject,
}

impl CircuitBreaker {
    pub fn new(max_requests: u32, interval: Duration, open_timeout: Duration, failure_ratio: f64) -> Self {
        Self {
            max_requests,
            interval,
            open_timeout,
            failure_ratio,
            windows: Mutex::new(FxHashMap::default()),
        }
    }

    fn fresh_window(&self) -> BreakerWindow {
        BreakerWindow {
            state: BreakerState::Closed,
            requests: 0,
            failures: 0,
            opened_at: None,
            window_started_at: std::time::Instant::now(),
        }
    }

    pub fn allow(&self, operation_id: &str) -> BreakerDecision {
        let mut windows = self.windows.lock();
        let window = windows.entry(operation_id.to_string()).or_insert_with(|| BreakerWindow {
            state: BreakerState::Closed,
            requests: 0,
            failures: 0,
            opened_at: None,
            window_started_at: std::time::Instant::now(),
        });

        if window.window_started_at.elapsed() > self.interval && window.state == BreakerState::Closed {
            window.requests = 0;
            window.failures = 0;
            window.window_started_at = std::time::Instant::now();
        }

        match window.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                if window.opened_at.map(|t| t.elapsed() >= self.open_timeout).unwrap_or(false) {
                    window.state = BreakerState::HalfOpen;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Reject
                }
            }
            BreakerState::HalfOpen => BreakerDecision::Allow,
        }
    }

    pub fn record(&self, operation_id: &str, success: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(operation_id.to_string()).or_insert_with(|| BreakerWindow {
            state: BreakerState::Closed,
            requests: 0,
            failures: 0,
            opened_at: None,
            window_started_at: std::time::Instant::now(),
        });

        if window.state == BreakerState::HalfOpen {
            if success {
                *window = self.fresh_window();
            } else {
                window.state = BreakerState::Open;
                window.opened_at = Some(std::time::Instant::now());
            }
            return;
        }

        window.requests += 1;
        if !success {
            window.failures += 1;
        }
        if window.requests >= self.max_requests
            && (window.failures as f64 / window.requests as f64) >= self.failure_ratio
        {
            window.state = BreakerState::Open;
            window.opened_at = Some(std::time::Instant::now());
        }
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RetryError {
    #[error("circuit open for operation {0}")]
    #[diagnostic(code(loomwork::retry::circuit_open))]
    CircuitOpen(String),

    #[error("operation failed after {attempts} attempts: {cause}")]
    #[diagnostic(code(loomwork::retry::exhausted))]
    Exhausted { attempts: u32, cause: String },

    #[error("retry cancelled")]
    #[diagnostic(code(loomwork::retry::cancelled))]
    Cancelled,
}

pub struct RetryOptions<'a> {
    pub operation_id: &'a str,
    pub strategy: RetryStrategy,
    pub error_workflow: Option<&'a str>,
    pub cancellation: Option<CancellationToken>,
}

/// Drive `op` to completion under `options`, retrying per the strategy and
/// short-circuiting through a shared [`CircuitBreaker`].
pub async fn execute_with_retry<F, Fut, T>(
    breaker: &CircuitBreaker,
    event_bus: Option<&Arc<EventBus>>,
    options: RetryOptions<'_>,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    if breaker.allow(options.operation_id) == BreakerDecision::Reject {
        return Err(RetryError::CircuitOpen(options.operation_id.to_string()));
    }

    let mut attempt = 0u32;
    let mut last_error = String::new();
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                breaker.record(options.operation_id, true);
                return Ok(value);
            }
            Err(err) => {
                breaker.record(options.operation_id, false);
                last_error = err;
                let class = classify_error(&last_error);
                let retry_again = options.strategy.should_retry(class, attempt);

                if !retry_again {
                    if let (Some(workflow), Some(bus)) = (options.error_workflow, event_bus) {
                        let event = Event::new(Topic::ErrorWorkflowTrigger.as_str(), options.operation_id, "retry")
                            .with_payload("error", serde_json::json!(last_error))
                            .with_payload("workflow", serde_json::json!(workflow));
                        let _ = bus.publish(event);
                    }
                    return Err(RetryError::Exhausted { attempts: attempt, cause: last_error });
                }

                let delay = options.strategy.next_delay(attempt);
                match &options.cancellation {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Err(RetryError::Cancelled),
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_caps_at_max() {
        let strategy = RetryStrategy::exponential(5, Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(strategy.next_delay(1), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(2), Duration::from_secs(2));
        assert_eq!(strategy.next_delay(4), Duration::from_secs(8));
        assert_eq!(strategy.next_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let strategy = RetryStrategy::linear(3, Duration::from_secs(2));
        assert_eq!(strategy.next_delay(3), Duration::from_secs(6));
    }

    #[test]
    fn classify_error_matches_known_substrings() {
        assert_eq!(classify_error("rate limit exceeded"), TransientClass::RateLimit);
        assert_eq!(classify_error("connection refused"), TransientClass::Network);
        assert!(!classify_error("invalid argument").is_retryable());
    }

    #[tokio::test]
    async fn execute_with_retry_invokes_operation_exactly_max_attempts_times() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(10), Duration::from_secs(30), 0.9);
        let calls = Arc::new(AtomicU32::new(0));
        let strategy = RetryStrategy::fixed(3, Duration::from_millis(1));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), RetryError> = execute_with_retry(
            &breaker,
            None,
            RetryOptions { operation_id: "op-1", strategy, error_workflow: None, cancellation: None },
            move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("timeout while calling downstream".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_failure_ratio_exceeded() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10), Duration::from_secs(30), 0.6);
        breaker.record("op-2", false);
        breaker.record("op-2", false);
        breaker.record("op-2", true);
        assert_eq!(breaker.allow("op-2"), BreakerDecision::Reject);
    }
}
