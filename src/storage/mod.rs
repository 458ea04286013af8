//! Durable state: sessions, executions, events and worker heartbeats, all on
//! the same Postgres pool the job queue (`crate::queue`) and notify bus
//! (`crate::notify`) also use. See `SPEC_FULL.md` for why Postgres rather
//! than the teacher's SQLite: LISTEN/NOTIFY and `FOR UPDATE SKIP LOCKED` are
//! not available in SQLite.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// Default timeout for individual queries; prevents a hung query from
/// blocking the worker indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub agent_id: Uuid,
    pub capability_id: Uuid,
    pub status: String,
    pub permission_mode: String,
    pub model: Option<String>,
    pub session_ref: Option<String>,
    pub idle_timeout_sec: Option<i32>,
    pub last_active_at: DateTime<Utc>,
    pub cost_usd: f64,
    pub turns: i32,
    pub duration_ms: i64,
    pub event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub capability_id: Option<Uuid>,
    pub status: String,
    pub pid: Option<i32>,
    pub log_path: Option<String>,
    pub byte_count: i64,
    pub line_count: i64,
    pub exit_code: Option<i32>,
    pub prompt_override: Option<String>,
    pub cli_flags: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub session_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A session is terminal-exempt from being "stuck" only while `running`;
/// everything else is a fair target for the terminal-state guard pattern
/// used throughout this module (see `finalize_execution_if_running`).
impl ExecutionRow {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "cancelled" | "succeeded" | "failed" | "timed_out"
        )
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed). Used to
    /// build dedicated LISTEN connections for the notify bus.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn migrate(pool: &PgPool) -> Result<()> {
        for sql in [
            include_str!("migrations/001_sessions.sql"),
            include_str!("migrations/002_executions.sql"),
            include_str!("migrations/003_events.sql"),
            include_str!("migrations/004_queue.sql"),
            include_str!("migrations/005_project_roots.sql"),
        ] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        task_id: Option<Uuid>,
        agent_id: Uuid,
        capability_id: Uuid,
        permission_mode: &str,
        idle_timeout_sec: Option<i32>,
    ) -> Result<SessionRow> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sessions (id, task_id, agent_id, capability_id, status, permission_mode, idle_timeout_sec)
             VALUES ($1, $2, $3, $4, 'idle', $5, $6)",
        )
        .bind(id)
        .bind(task_id)
        .bind(agent_id)
        .bind(capability_id)
        .bind(permission_mode)
        .bind(idle_timeout_sec)
        .execute(&self.pool)
        .await?;
        self.get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// `idle → active` (cold or hot). Sets `last_active_at` and stamps
    /// `session_ref` if one is known (never clears it — `session_ref` is
    /// monotonic per spec §3).
    pub async fn mark_session_active(&self, id: Uuid, session_ref: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'active', last_active_at = now(), updated_at = now(),
                session_ref = COALESCE($2, session_ref)
             WHERE id = $1",
        )
        .bind(id)
        .bind(session_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persists a freshly-learned `session_ref` without touching `status` —
    /// used when the adapter's `session:init` event arrives, independent of
    /// whatever transition the session is mid-way through (spec §4.3/§4.4).
    /// Never clears it (`session_ref` is monotonic per spec §3).
    pub async fn update_session_ref(&self, id: Uuid, session_ref: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET session_ref = COALESCE(session_ref, $2), updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(session_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_session_awaiting_input(
        &self,
        id: Uuid,
        cost_usd: f64,
        turns: i32,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'awaiting_input', updated_at = now(),
                cost_usd = cost_usd + $2, turns = turns + $3, duration_ms = duration_ms + $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(cost_usd)
        .bind(turns)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Process exit: `idle` if `session_ref` is present (resumable), else
    /// `ended`.
    pub async fn mark_session_exited(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = CASE WHEN session_ref IS NOT NULL THEN 'idle' ELSE 'ended' END,
                last_active_at = now(), updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_session_ended(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'ended', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, id: Uuid, mode: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET permission_mode = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(mode)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, id: Uuid, model: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET model = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(model)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically allocate the next per-session event sequence number. A
    /// single serial source, assigned before publish+persist, is what keeps
    /// the persisted sequence gap-free (spec §5 ordering guarantee).
    pub async fn next_event_seq(&self, session_id: Uuid) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE sessions SET event_seq = event_seq + 1 WHERE id = $1 RETURNING event_seq",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // ─── Executions ─────────────────────────────────────────────────────────

    pub async fn create_execution(
        &self,
        session_id: Option<Uuid>,
        task_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        capability_id: Option<Uuid>,
        prompt_override: Option<&str>,
        cli_flags: Option<serde_json::Value>,
    ) -> Result<ExecutionRow> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO executions (id, session_id, task_id, agent_id, capability_id, status, prompt_override, cli_flags)
             VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7)",
        )
        .bind(id)
        .bind(session_id)
        .bind(task_id)
        .bind(agent_id)
        .bind(capability_id)
        .bind(prompt_override)
        .bind(cli_flags)
        .execute(&self.pool)
        .await?;
        self.get_execution(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("execution not found after insert"))
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        Ok(sqlx::query_as("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// `pid` and log path are set before the first process write (spec §3
    /// execution invariant).
    pub async fn mark_execution_running(
        &self,
        id: Uuid,
        pid: i32,
        log_path: &str,
        worker_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET status = 'running', pid = $2, log_path = $3, worker_id = $4,
                started_at = now(), updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(pid)
        .bind(log_path)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_execution_cancelling(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'cancelling', updated_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finalize from `running`. Zero rows affected means a concurrent
    /// mutator (cancel) already won the race — that is information, not an
    /// error (spec §9 "terminal-state guard instead of locks").
    pub async fn finalize_execution_if_running(
        &self,
        id: Uuid,
        status: &str,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = $2, exit_code = $3, ended_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(status)
        .bind(exit_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finalize from `cancelling` (used by the S6 race path: the finalize
    /// above lost the race, so the session process re-reads and completes
    /// the cancellation instead).
    pub async fn finalize_execution_if_cancelling(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'cancelled', ended_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'cancelling'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_execution_counts(
        &self,
        id: Uuid,
        byte_count: i64,
        line_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET byte_count = $2, line_count = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(byte_count)
        .bind(line_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stale reaper: flips `running` executions whose `updated_at` is older
    /// than `threshold` to `timed_out`. Does not touch session status or
    /// kill anything — surfacing stuck-looking executions is its only job
    /// (spec §4.3 "idle reap coupling").
    pub async fn reap_stale_executions(
        &self,
        threshold: std::time::Duration,
    ) -> Result<Vec<Uuid>> {
        with_timeout(async {
            let cutoff = Utc::now() - chrono::Duration::from_std(threshold)?;
            let rows: Vec<(Uuid,)> = sqlx::query_as(
                "UPDATE executions SET status = 'timed_out', ended_at = now(), updated_at = now()
                 WHERE status = 'running' AND updated_at < $1
                 RETURNING id",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
        .await
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    pub async fn insert_event(
        &self,
        session_id: Uuid,
        seq: i64,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<EventRow> {
        let row: EventRow = sqlx::query_as(
            "INSERT INTO events (session_id, seq, event_type, payload) VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(session_id)
        .bind(seq)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<EventRow>> {
        Ok(sqlx::query_as("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Full replay for a session, ordered by sequence. Because ephemeral
    /// deltas are never persisted, replay reproduces exactly the transcript
    /// a client would see (spec §3 Event invariant).
    pub async fn list_events(&self, session_id: Uuid) -> Result<Vec<EventRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM events WHERE session_id = $1 ORDER BY seq ASC")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Worker heartbeats ──────────────────────────────────────────────────

    pub async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        max_concurrent_jobs: i32,
        active_jobs: i32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (worker_id, last_seen_at, max_concurrent_jobs, active_jobs)
             VALUES ($1, now(), $2, $3)
             ON CONFLICT (worker_id) DO UPDATE SET
                last_seen_at = now(), max_concurrent_jobs = excluded.max_concurrent_jobs,
                active_jobs = excluded.active_jobs",
        )
        .bind(worker_id)
        .bind(max_concurrent_jobs)
        .bind(active_jobs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Startup recovery / maintenance ─────────────────────────────────────

    /// On worker boot, any session left `active`/`awaiting_input` by a
    /// crashed worker is recovered: `idle` if a `session_ref` was captured
    /// (resumable), `ended` otherwise. Grounded in the teacher's
    /// `recover_stale_sessions`.
    pub async fn recover_stale_sessions(&self) -> Result<u64> {
        with_timeout(async {
            let resumable = sqlx::query(
                "UPDATE sessions SET status = 'idle', updated_at = now()
                 WHERE status IN ('active', 'awaiting_input') AND session_ref IS NOT NULL",
            )
            .execute(&self.pool)
            .await?
            .rows_affected();

            let terminal = sqlx::query(
                "UPDATE sessions SET status = 'ended', updated_at = now()
                 WHERE status IN ('active', 'awaiting_input') AND session_ref IS NULL",
            )
            .execute(&self.pool)
            .await?
            .rows_affected();

            Ok(resumable + terminal)
        })
        .await
    }

    /// Delete `ended` sessions older than `days`. Pass `0` to skip.
    pub async fn prune_old_sessions(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        with_timeout(async {
            let cutoff = Utc::now() - chrono::Duration::days(days as i64);
            let n = sqlx::query("DELETE FROM sessions WHERE status = 'ended' AND updated_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(n)
        })
        .await
    }

    /// Database-backed project-root allowlist (spec §4.1 "falls back to a
    /// database-backed project-root list when the static allowlist
    /// misses"), consulted by `safety::validate_working_dir_with_fallback`.
    pub async fn list_project_roots(&self) -> Result<Vec<String>> {
        with_timeout(async {
            let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM project_roots")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.into_iter().map(|(path,)| path).collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution(status: &str) -> ExecutionRow {
        ExecutionRow {
            id: Uuid::new_v4(),
            session_id: None,
            task_id: None,
            agent_id: None,
            capability_id: None,
            status: status.to_string(),
            pid: None,
            log_path: None,
            byte_count: 0,
            line_count: 0,
            exit_code: None,
            prompt_override: None,
            cli_flags: None,
            started_at: None,
            ended_at: None,
            worker_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_status_classification() {
        for status in ["cancelled", "succeeded", "failed", "timed_out"] {
            assert!(sample_execution(status).is_terminal());
        }
        for status in ["queued", "running", "cancelling"] {
            assert!(!sample_execution(status).is_terminal());
        }
    }
}
