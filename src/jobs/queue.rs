use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;

use super::{Job, JobError, JobResult};
use crate::config::Config;
use crate::db::DbPool;

const STATE_READY: &str = "ready";
const STATE_LEASED: &str = "leased";
const STATE_DEAD: &str = "dead";

/// Fire-and-forget submission, optionally delayed.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> JobResult<i64>;
}

/// A job leased to one worker until it is acknowledged, failed, or the
/// lease runs out.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub job: Job,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub ready: i64,
    pub leased: i64,
    pub dead: i64,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retried,
    DeadLettered,
    /// Operator cancellation; the job is dropped like a success.
    Discarded,
}

/// Durable at-least-once queue in the `jobs` table. Times are unix millis.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: DbPool,
    lease_duration: Duration,
    retry_delay: Duration,
    max_attempts: u32,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

impl SqliteJobQueue {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            pool,
            lease_duration: config.lease_duration,
            retry_delay: config.retry_delay,
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Leases the next due job: a ready one whose time has come, or a leased
    /// one whose lease expired (its worker died). Jobs that already used up
    /// their attempts are dead-lettered instead of handed out.
    pub async fn claim(&self, owner: &str) -> JobResult<Option<ClaimedJob>> {
        loop {
            let now = now_millis();
            let row = sqlx::query_as::<_, (i64, String, i64)>(
                "UPDATE jobs SET state = ?, lease_owner = ?, lease_expires_at = ?,
                                 attempts = attempts + 1
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE (state = ? AND run_at <= ?)
                        OR (state = ? AND lease_expires_at <= ?)
                     ORDER BY run_at, id
                     LIMIT 1
                 )
                 RETURNING id, payload, attempts",
            )
            .bind(STATE_LEASED)
            .bind(owner)
            .bind(now + millis(self.lease_duration))
            .bind(STATE_READY)
            .bind(now)
            .bind(STATE_LEASED)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, payload, attempts)) = row else {
                return Ok(None);
            };
            let attempts = attempts.max(0) as u32;

            if attempts > self.max_attempts {
                warn!("Job {} exhausted {} attempts, dead-lettering", id, self.max_attempts);
                self.mark_dead(id, "lease expired after final attempt").await?;
                continue;
            }

            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => return Ok(Some(ClaimedJob { id, job, attempts })),
                Err(e) => {
                    warn!("Job {} has an unreadable payload: {}", id, e);
                    self.mark_dead(id, &e.to_string()).await?;
                }
            }
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Extends the lease of a job still held by `owner`. Returns false when
    /// the lease was lost (acknowledged, failed, or claimed by someone else).
    pub async fn renew(&self, id: i64, owner: &str) -> JobResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?
             WHERE id = ? AND state = ? AND lease_owner = ?",
        )
        .bind(now_millis() + millis(self.lease_duration))
        .bind(id)
        .bind(STATE_LEASED)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Acknowledges success; the job is removed.
    pub async fn ack(&self, id: i64) -> JobResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Schedules a retry after the fixed retry delay, or dead-letters the job
    /// when the error is final or its attempts are used up.
    pub async fn fail(&self, claimed: &ClaimedJob, error: &JobError) -> JobResult<FailureAction> {
        if matches!(error, JobError::Cancelled(_)) {
            self.ack(claimed.id).await?;
            return Ok(FailureAction::Discarded);
        }
        if !error.is_retryable() || claimed.attempts >= self.max_attempts {
            self.mark_dead(claimed.id, &error.to_string()).await?;
            return Ok(FailureAction::DeadLettered);
        }

        sqlx::query(
            "UPDATE jobs SET state = ?, run_at = ?, lease_owner = NULL, lease_expires_at = NULL,
                             last_error = ?
             WHERE id = ?",
        )
        .bind(STATE_READY)
        .bind(now_millis() + millis(self.retry_delay))
        .bind(error.to_string())
        .bind(claimed.id)
        .execute(&self.pool)
        .await?;
        debug!(
            "Job {} will retry (attempt {} of {})",
            claimed.id, claimed.attempts, self.max_attempts
        );
        Ok(FailureAction::Retried)
    }

    async fn mark_dead(&self, id: i64, error: &str) -> JobResult<()> {
        sqlx::query(
            "UPDATE jobs SET state = ?, lease_owner = NULL, lease_expires_at = NULL, last_error = ?
             WHERE id = ?",
        )
        .bind(STATE_DEAD)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// How long until the next pending job becomes claimable, if any is pending.
    pub async fn next_due_in(&self) -> JobResult<Option<Duration>> {
        let next = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(CASE WHEN state = ? THEN run_at ELSE lease_expires_at END)
             FROM jobs WHERE state IN (?, ?)",
        )
        .bind(STATE_READY)
        .bind(STATE_READY)
        .bind(STATE_LEASED)
        .fetch_one(&self.pool)
        .await?;

        Ok(next.map(|at| Duration::from_millis((at - now_millis()).max(0) as u64)))
    }

    pub async fn counts(&self) -> JobResult<QueueCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match state.as_str() {
                STATE_READY => counts.ready = count,
                STATE_LEASED => counts.leased = count,
                STATE_DEAD => counts.dead = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Payloads of pending (ready or leased) jobs in due order.
    pub async fn pending(&self) -> JobResult<Vec<Job>> {
        let payloads = sqlx::query_scalar::<_, String>(
            "SELECT payload FROM jobs WHERE state IN (?, ?) ORDER BY run_at, id",
        )
        .bind(STATE_READY)
        .bind(STATE_LEASED)
        .fetch_all(&self.pool)
        .await?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(JobError::from))
            .collect()
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> JobResult<i64> {
        let payload = serde_json::to_string(&job)?;
        let run_at = now_millis() + delay.map(millis).unwrap_or(0);

        let result = sqlx::query(
            "INSERT INTO jobs (kind, payload, state, attempts, run_at, created_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(job.kind())
        .bind(payload)
        .bind(STATE_READY)
        .bind(run_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Enqueued {} job {} (delay {:?})", job.kind(), id, delay);
        Ok(id)
    }
}
