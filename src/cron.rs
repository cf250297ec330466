//! Cron Scheduler (C9): leader-elected materialization of active schedules
//! into a cron engine, with a misfire monitor that catches up missed fires.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::event_bus::{Event, EventBus, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfirePolicy {
    RunOnce,
    Skip,
    RunAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleExecutionStatus {
    Triggered,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub workflow_id: String,
    pub cron_expression: String,
    pub timezone: Tz,
    pub active: bool,
    pub misfire_policy: MisfirePolicy,
    pub data: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            cron_expression: cron_expression.into(),
            timezone: Tz::UTC,
            active: true,
            misfire_policy: MisfirePolicy::RunOnce,
            data: serde_json::Value::Null,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CronError {
    #[error("invalid cron expression {0}: {1}")]
    #[diagnostic(code(loomwork::cron::invalid_expression))]
    InvalidExpression(String, String),

    #[error("schedule {0} not found")]
    #[diagnostic(code(loomwork::cron::schedule_not_found))]
    ScheduleNotFound(String),

    #[error(transparent)]
    #[diagnostic(code(loomwork::cron::job_scheduler))]
    JobScheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}

/// Parse and validate a 6-field (`sec min hour dom mon dow`) cron
/// expression without registering it, for use by schedule CRUD validation.
/// Find the next occurrence after `after_utc`, evaluated in `tz` so DST
/// and calendar boundaries land on the schedule's own timezone rather than
/// UTC's, then convert the result back to UTC for storage.
fn next_occurrence_in_tz(cron: &Cron, after_utc: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let after_local = after_utc.with_timezone(&tz);
    cron.find_next_occurrence(&after_local, false).ok().map(|next| next.with_timezone(&Utc))
}

pub fn normalize_schedule(expression: &str) -> Result<Cron, CronError> {
    Cron::from_str(expression).map_err(|e| CronError::InvalidExpression(expression.to_string(), e.to_string()))
}

/// Distributed mutual exclusion so only one process materializes cron jobs
/// at a time. `try_acquire`/`renew` follow the same SETNX-with-TTL pattern
/// regardless of backend; `InMemoryLeaderLattice` always wins, for
/// single-process deployments and tests.
#[async_trait]
pub trait LeaderLattice: Send + Sync {
    async fn try_acquire(&self, ttl: Duration) -> bool;
    async fn renew(&self, ttl: Duration) -> bool;
    async fn release(&self);
    fn is_leader(&self) -> bool;
}

pub struct InMemoryLeaderLattice {
    leader: std::sync::atomic::AtomicBool,
}

impl InMemoryLeaderLattice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { leader: std::sync::atomic::AtomicBool::new(false) })
    }
}

#[async_trait]
impl LeaderLattice for InMemoryLeaderLattice {
    async fn try_acquire(&self, _ttl: Duration) -> bool {
        self.leader.store(true, std::sync::atomic::Ordering::SeqCst);
        true
    }

    async fn renew(&self, _ttl: Duration) -> bool {
        true
    }

    async fn release(&self) {
        self.leader.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_leader(&self) -> bool {
        self.leader.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(feature = "redis-leader")]
pub mod redis_leader {
    use super::{Duration, LeaderLattice};
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Redis-backed leader lease: `SETNX scheduler:leader <token> EX ttl`,
    /// renewed on a fixed interval while this process believes it holds it.
    pub struct RedisLeaderLattice {
        client: redis::Client,
        token: String,
        key: String,
        held: AtomicBool,
    }

    impl RedisLeaderLattice {
        pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
            Ok(Self {
                client: redis::Client::open(redis_url)?,
                token: uuid::Uuid::new_v4().to_string(),
                key: "scheduler:leader".to_string(),
                held: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LeaderLattice for RedisLeaderLattice {
        async fn try_acquire(&self, ttl: Duration) -> bool {
            let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else { return false };
            let acquired: bool = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.token)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut conn)
                .await
                .unwrap_or(false);
            self.held.store(acquired, Ordering::SeqCst);
            acquired
        }

        async fn renew(&self, ttl: Duration) -> bool {
            let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else { return false };
            let current: Option<String> = conn.get(&self.key).await.unwrap_or(None);
            if current.as_deref() != Some(self.token.as_str()) {
                self.held.store(false, Ordering::SeqCst);
                return false;
            }
            let _: Result<(), _> = conn.expire(&self.key, ttl.as_secs() as i64).await;
            true
        }

        async fn release(&self) {
            if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await {
                let current: Option<String> = conn.get(&self.key).await.unwrap_or(None);
                if current.as_deref() == Some(self.token.as_str()) {
                    let _: Result<(), _> = conn.del(&self.key).await;
                }
            }
            self.held.store(false, Ordering::SeqCst);
        }

        fn is_leader(&self) -> bool {
            self.held.load(Ordering::SeqCst)
        }
    }
}

/// Owns the in-memory schedule registry and the live `JobScheduler`
/// entries. Only the leader materializes entries into the cron engine;
/// every node may still accept CRUD and persist schedules.
pub struct CronScheduler {
    schedules: RwLock<FxHashMap<String, Schedule>>,
    entry_ids: RwLock<FxHashMap<String, uuid::Uuid>>,
    job_scheduler: tokio::sync::Mutex<Option<JobScheduler>>,
    leader: Arc<dyn LeaderLattice>,
    event_bus: Arc<EventBus>,
    max_catch_up: usize,
}

impl CronScheduler {
    pub async fn new(leader: Arc<dyn LeaderLattice>, event_bus: Arc<EventBus>, max_catch_up: usize) -> Result<Arc<Self>, CronError> {
        Ok(Arc::new(Self {
            schedules: RwLock::new(FxHashMap::default()),
            entry_ids: RwLock::new(FxHashMap::default()),
            job_scheduler: tokio::sync::Mutex::new(Some(JobScheduler::new().await?)),
            leader,
            event_bus,
            max_catch_up,
        }))
    }

    pub fn upsert_schedule(&self, schedule: Schedule) {
        self.schedules.write().insert(schedule.id.clone(), schedule);
    }

    pub fn remove_schedule(&self, schedule_id: &str) {
        self.schedules.write().remove(schedule_id);
    }

    /// Periodic leader-election tick: attempt to acquire or renew the
    /// lease, materializing or tearing down cron entries on transition.
    pub async fn election_tick(self: &Arc<Self>, ttl: Duration) {
        let was_leader = self.leader.is_leader();
        let now_leader = if was_leader { self.leader.renew(ttl).await } else { self.leader.try_acquire(ttl).await };

        if now_leader && !was_leader {
            self.materialize_all().await;
        } else if !now_leader && was_leader {
            self.teardown_all().await;
        }
    }

    async fn materialize_all(self: &Arc<Self>) {
        let schedules: Vec<Schedule> = self.schedules.read().values().filter(|s| s.active).cloned().collect();
        for schedule in schedules {
            let _ = self.materialize_one(&schedule).await;
        }
    }

    async fn materialize_one(self: &Arc<Self>, schedule: &Schedule) -> Result<(), CronError> {
        let scheduler = Arc::clone(self);
        let schedule_id = schedule.id.clone();
        let job = Job::new_async(schedule.cron_expression.as_str(), move |_uuid, _lock| {
            let scheduler = Arc::clone(&scheduler);
            let schedule_id = schedule_id.clone();
            Box::pin(async move {
                scheduler.fire(&schedule_id).await;
            })
        })
        .map_err(CronError::JobScheduler)?;

        let mut guard = self.job_scheduler.lock().await;
        if let Some(js) = guard.as_mut() {
            let entry_id = js.add(job).await?;
            self.entry_ids.write().insert(schedule.id.clone(), entry_id);
        }
        Ok(())
    }

    async fn teardown_all(&self) {
        let mut guard = self.job_scheduler.lock().await;
        let Some(js) = guard.as_mut() else { return };
        let entries: Vec<uuid::Uuid> = self.entry_ids.write().drain().map(|(_, id)| id).collect();
        for id in entries {
            let _ = js.remove(&id).await;
        }
    }

    /// Fire a schedule: publish `schedule.triggered`, then update
    /// `lastRunAt`/`nextRunAt` per the schedule's cron expression.
    async fn fire(&self, schedule_id: &str) {
        let Some(mut schedule) = self.schedules.read().get(schedule_id).cloned() else { return };
        let execution_id = uuid::Uuid::new_v4().to_string();

        let publish_result = self.event_bus.publish(
            Event::new(Topic::ScheduleTriggered.as_str(), schedule_id, "schedule")
                .with_payload("workflowId", serde_json::json!(schedule.workflow_id))
                .with_payload("executionId", serde_json::json!(execution_id))
                .with_payload("data", schedule.data.clone()),
        );

        let _status = if publish_result.is_ok() { ScheduleExecutionStatus::Success } else { ScheduleExecutionStatus::Failed };
        let now = Utc::now();
        schedule.last_run_at = Some(now);
        schedule.next_run_at = normalize_schedule(&schedule.cron_expression)
            .ok()
            .and_then(|cron| next_occurrence_in_tz(&cron, now, schedule.timezone));
        self.schedules.write().insert(schedule_id.to_string(), schedule);
    }

    /// Run the misfire monitor once: any active schedule whose `nextRunAt`
    /// is more than a minute in the past gets handled per its policy.
    pub async fn check_missed_runs(&self) {
        let now = Utc::now();
        let stale: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.active)
            .filter(|s| s.next_run_at.map(|t| now - t > chrono::Duration::minutes(1)).unwrap_or(false))
            .cloned()
            .collect();

        for schedule in stale {
            match schedule.misfire_policy {
                MisfirePolicy::RunOnce => self.fire(&schedule.id).await,
                MisfirePolicy::Skip => {
                    let mut updated = schedule.clone();
                    updated.next_run_at = normalize_schedule(&schedule.cron_expression)
                        .ok()
                        .and_then(|cron| next_occurrence_in_tz(&cron, now, schedule.timezone));
                    self.schedules.write().insert(schedule.id.clone(), updated);
                }
                MisfirePolicy::RunAll => {
                    let Ok(cron) = normalize_schedule(&schedule.cron_expression) else { continue };
                    let Some(mut cursor) = schedule.next_run_at else { continue };
                    let mut missed = Vec::new();
                    while cursor < now && missed.len() < self.max_catch_up {
                        missed.push(cursor);
                        cursor = match next_occurrence_in_tz(&cron, cursor, schedule.timezone) {
                            Some(next) => next,
                            None => break,
                        };
                    }
                    if missed.len() == self.max_catch_up {
                        tracing::warn!(
                            target: "loomwork::cron",
                            schedule_id = %schedule.id,
                            "misfire run_all hit max_catch_up, remaining occurrences dropped"
                        );
                    }
                    for _ in &missed {
                        self.fire(&schedule.id).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_schedule_accepts_six_field_expression() {
        assert!(normalize_schedule("0 */5 * * * *").is_ok());
    }

    #[test]
    fn normalize_schedule_rejects_garbage() {
        assert!(normalize_schedule("not a cron expression").is_err());
    }

    #[test]
    fn next_occurrence_in_tz_honors_schedule_timezone() {
        // "at 00:30" in America/New_York, evaluated from a `now` that's
        // already past 00:30 UTC on the same date but still before 00:30
        // local time (UTC-4 in August) must roll to the *next* day in NY,
        // not the same UTC date.
        let cron = normalize_schedule("0 30 0 * * *").unwrap();
        let now = DateTime::parse_from_rfc3339("2026-08-01T02:00:00Z").unwrap().with_timezone(&Utc);
        let ny: Tz = "America/New_York".parse().unwrap();

        let next = next_occurrence_in_tz(&cron, now, ny).unwrap();
        assert_eq!(next.with_timezone(&ny).format("%H:%M").to_string(), "00:30");
        assert_eq!(next.date_naive(), (now + chrono::Duration::days(1)).date_naive());
    }

    #[tokio::test]
    async fn election_tick_materializes_on_transition_to_leader() {
        let leader = InMemoryLeaderLattice::new();
        let bus = Arc::new(EventBus::default());
        let scheduler = CronScheduler::new(leader.clone(), bus, 50).await.unwrap();
        scheduler.upsert_schedule(Schedule::new("s1", "wf-1", "0 * * * * *"));
        scheduler.election_tick(Duration::from_secs(10)).await;
        assert!(leader.is_leader());
        assert_eq!(scheduler.entry_ids.read().len(), 1);
    }
}
