//! Durable job queue on top of the same Postgres store (spec §2 "Queue
//! integration", §6.1). Three named queues, at-least-once delivery via
//! `FOR UPDATE SKIP LOCKED` claiming. Idempotency is the caller's job: a
//! handler must check the target row's terminal state before doing work,
//! the same terminal-state-guard discipline `storage` uses everywhere else.
//!
//! The teacher's `scheduler::queue::SchedulerQueue` is an in-memory
//! `BinaryHeap` and does not survive a worker restart, so it is not reused
//! directly — only its "priority queue over pending requests" shape informs
//! this rewrite; the actual claim mechanics come from `storage::claim_session_for_run`'s
//! conditional-update idiom applied to a `queue_jobs` table.

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;

pub const QUEUE_SESSION_RUN: &str = "session:run";
pub const QUEUE_CAPABILITY_EXECUTE: &str = "capability:execute";
pub const QUEUE_AGENT_ANALYZE: &str = "agent:analyze";

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    pub payload: Value,
    pub attempts: i32,
}

#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, queue_name: &str, payload: Value) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO queue_jobs (queue_name, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue_name)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim one ready job from `queue_name`, skipping rows locked by other
    /// workers rather than blocking on them.
    pub async fn claim_next(&self, queue_name: &str, worker_id: &str) -> Result<Option<QueuedJob>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, Value, i32)> = sqlx::query_as(
            "SELECT id, payload, attempts FROM queue_jobs
             WHERE queue_name = $1 AND status = 'queued' AND available_at <= now()
             ORDER BY id ASC
             FOR UPDATE SKIP LOCKED
             LIMIT 1",
        )
        .bind(queue_name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, payload, attempts)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            "UPDATE queue_jobs SET status = 'running', claimed_by = $2, attempts = attempts + 1, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(QueuedJob {
            id,
            payload,
            attempts: attempts + 1,
        }))
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET status = 'done', updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Redeliver after a transient failure — distinct from `fail`, which is
    /// for a terminal handler error (spec §7 "job-level fatal errors bubble
    /// out of the handler and let the queue mark the job failed").
    pub async fn retry_after(&self, job_id: i64, delay: std::time::Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay)?;
        sqlx::query(
            "UPDATE queue_jobs SET status = 'queued', available_at = now() + $2, updated_at = now()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(delay)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail(&self, job_id: i64) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET status = 'failed', updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
