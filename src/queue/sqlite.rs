//! SQLite-backed queue backend.
//!
//! Claiming uses an `UPDATE ... WHERE task_id IN (SELECT ...) RETURNING`
//! against a visibility column, which stands in for `SELECT ... FOR UPDATE
//! SKIP LOCKED` on server databases: a claimed row carries a deadline and is
//! invisible to other workers until the deadline lapses.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::{EnqueueOutcome, QueueError, QueueResult, QueueStats, TaskQueue};
use crate::model::UrlTask;

const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS url_tasks (
    task_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    url TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    phase_id TEXT NOT NULL,
    depth INTEGER NOT NULL,
    markers TEXT NOT NULL,
    parent_url TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    snapshot_ref TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    worker_id TEXT,
    visible_at INTEGER NOT NULL DEFAULT 0,
    deadline INTEGER,
    category TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(execution_id, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_url_tasks_lease
    ON url_tasks(execution_id, phase_id, status, visible_at);

CREATE TABLE IF NOT EXISTS queue_executions (
    execution_id TEXT PRIMARY KEY,
    active_phase TEXT,
    paused INTEGER NOT NULL DEFAULT 0,
    closed INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dlq: AtomicU64,
    expired: AtomicU64,
}

pub struct SqliteTaskQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
    /// Round-robin cursor over execution ids (ordered by id text).
    rotation_cursor: Mutex<Option<String>>,
    counters: Counters,
}

impl SqliteTaskQueue {
    pub async fn open(path: &Path, visibility_timeout: Duration) -> QueueResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(QUEUE_SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            visibility_timeout,
            rotation_cursor: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> QueueResult<UrlTask> {
        let markers: String = row.try_get("markers")?;
        let markers: Vec<String> =
            serde_json::from_str(&markers).map_err(|e| QueueError::Backend(e.to_string()))?;
        let parse_uuid = |field: &str| -> QueueResult<Uuid> {
            let raw: String = row.try_get(field)?;
            Uuid::parse_str(&raw).map_err(|e| QueueError::Backend(e.to_string()))
        };
        Ok(UrlTask {
            task_id: parse_uuid("task_id")?,
            execution_id: parse_uuid("execution_id")?,
            url: row.try_get("url")?,
            url_hash: row.try_get("url_hash")?,
            phase_id: row.try_get("phase_id")?,
            depth: row.try_get::<i64, _>("depth")? as u32,
            markers,
            parent_url: row.try_get("parent_url")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            workflow_snapshot_ref: parse_uuid("snapshot_ref")?,
            created_at: chrono::DateTime::from_timestamp(row.try_get::<i64, _>("created_at")?, 0)
                .unwrap_or_else(Utc::now),
        })
    }

    /// Return timed-out claims to visibility with a bumped retry count.
    /// Expired claims of closed executions are retired, not requeued.
    async fn reap_expired(&self, now: i64) -> QueueResult<()> {
        let reclaimed = sqlx::query(
            "UPDATE url_tasks
             SET status = CASE
                     WHEN EXISTS (
                         SELECT 1 FROM queue_executions q
                         WHERE q.execution_id = url_tasks.execution_id AND q.closed = 1
                     ) THEN 'failed'
                     ELSE 'pending'
                 END,
                 worker_id = NULL, deadline = NULL,
                 retry_count = retry_count + 1
             WHERE status = 'processing' AND deadline IS NOT NULL AND deadline <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reclaimed > 0 {
            self.counters.expired.fetch_add(reclaimed, Ordering::Relaxed);
            tracing::info!(reclaimed, "reclaimed expired task leases");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: UrlTask) -> QueueResult<EnqueueOutcome> {
        let closed: Option<i64> =
            sqlx::query_scalar("SELECT closed FROM queue_executions WHERE execution_id = ?")
                .bind(task.execution_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        if closed == Some(1) {
            return Err(QueueError::Closed(task.execution_id));
        }

        let markers =
            serde_json::to_string(&task.markers).map_err(|e| QueueError::Backend(e.to_string()))?;
        let inserted = sqlx::query(
            "INSERT INTO url_tasks
                (task_id, execution_id, url, url_hash, phase_id, depth, markers,
                 parent_url, retry_count, snapshot_ref, status, visible_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
             ON CONFLICT(execution_id, url_hash) DO NOTHING",
        )
        .bind(task.task_id.to_string())
        .bind(task.execution_id.to_string())
        .bind(&task.url)
        .bind(&task.url_hash)
        .bind(&task.phase_id)
        .bind(i64::from(task.depth))
        .bind(markers)
        .bind(&task.parent_url)
        .bind(i64::from(task.retry_count))
        .bind(task.workflow_snapshot_ref.to_string())
        .bind(task.created_at.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            Ok(EnqueueOutcome::Coalesced)
        } else {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            Ok(EnqueueOutcome::Enqueued)
        }
    }

    async fn lease(&self, worker_id: &str, max: usize) -> QueueResult<Vec<UrlTask>> {
        let now = Utc::now().timestamp();
        self.reap_expired(now).await?;

        // Executions currently allowed to hand out work, in a stable order
        // for rotation.
        let rows = sqlx::query(
            "SELECT execution_id, active_phase FROM queue_executions
             WHERE paused = 0 AND closed = 0 AND active_phase IS NOT NULL
             ORDER BY execution_id",
        )
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() || max == 0 {
            return Ok(Vec::new());
        }

        let executions: Vec<(String, String)> = rows
            .iter()
            .map(|r| {
                Ok((
                    r.try_get::<String, _>("execution_id")?,
                    r.try_get::<String, _>("active_phase")?,
                ))
            })
            .collect::<Result<_, sqlx::Error>>()?;

        // Resume the rotation after the execution served last time.
        let start = {
            let cursor = self.rotation_cursor.lock();
            cursor
                .as_ref()
                .and_then(|last| executions.iter().position(|(id, _)| id > last))
                .unwrap_or(0)
        };

        let deadline = now + self.visibility_timeout.as_secs() as i64;
        let mut leased = Vec::new();
        let mut idle = 0usize;
        let mut idx = start;
        while leased.len() < max && idle < executions.len() {
            let (execution_id, phase_id) = &executions[idx % executions.len()];
            idx += 1;

            let row = sqlx::query(
                "UPDATE url_tasks
                 SET status = 'processing', worker_id = ?, deadline = ?
                 WHERE task_id IN (
                     SELECT task_id FROM url_tasks
                     WHERE execution_id = ? AND phase_id = ? AND status = 'pending'
                       AND visible_at <= ?
                     ORDER BY created_at
                     LIMIT 1
                 )
                 RETURNING *",
            )
            .bind(worker_id)
            .bind(deadline)
            .bind(execution_id)
            .bind(phase_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => {
                    idle = 0;
                    *self.rotation_cursor.lock() = Some(execution_id.clone());
                    leased.push(Self::row_to_task(&row)?);
                }
                None => idle += 1,
            }
        }
        Ok(leased)
    }

    async fn extend(&self, task_id: Uuid, duration: Duration) -> QueueResult<()> {
        let deadline = Utc::now().timestamp() + duration.as_secs() as i64;
        let updated = sqlx::query(
            "UPDATE url_tasks SET deadline = ? WHERE task_id = ? AND status = 'processing'",
        )
        .bind(deadline)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(QueueError::NotLeased(task_id));
        }
        Ok(())
    }

    async fn ack(&self, task_id: Uuid) -> QueueResult<()> {
        let updated = sqlx::query(
            "UPDATE url_tasks
             SET status = 'completed', worker_id = NULL, deadline = NULL
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(QueueError::NotLeased(task_id));
        }
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, task_id: Uuid, reason: &str, delay: Option<Duration>) -> QueueResult<()> {
        let visible_at = Utc::now().timestamp() + delay.map_or(0, |d| d.as_secs() as i64);
        // A closed execution takes no work back: retire the row instead of
        // requeueing, so the terminal-state invariant (no pending tasks)
        // holds after stop.
        let updated = sqlx::query(
            "UPDATE url_tasks
             SET status = CASE
                     WHEN EXISTS (
                         SELECT 1 FROM queue_executions q
                         WHERE q.execution_id = url_tasks.execution_id AND q.closed = 1
                     ) THEN 'failed'
                     ELSE 'pending'
                 END,
                 worker_id = NULL, deadline = NULL,
                 retry_count = retry_count + 1, visible_at = ?
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(visible_at)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(QueueError::NotLeased(task_id));
        }
        tracing::debug!(%task_id, reason, "task nacked");
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dlq(&self, task_id: Uuid, category: &str) -> QueueResult<()> {
        let updated = sqlx::query(
            "UPDATE url_tasks
             SET status = 'dlq', category = ?, worker_id = NULL, deadline = NULL
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(category)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(QueueError::NotLeased(task_id));
        }
        self.counters.dlq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_active_phase(&self, execution_id: Uuid, phase_id: &str) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO queue_executions (execution_id, active_phase)
             VALUES (?, ?)
             ON CONFLICT(execution_id) DO UPDATE SET active_phase = excluded.active_phase",
        )
        .bind(execution_id.to_string())
        .bind(phase_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_paused(&self, execution_id: Uuid, paused: bool) -> QueueResult<()> {
        sqlx::query("UPDATE queue_executions SET paused = ? WHERE execution_id = ?")
            .bind(i64::from(paused))
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self, execution_id: Uuid) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO queue_executions (execution_id, closed)
             VALUES (?, 1)
             ON CONFLICT(execution_id) DO UPDATE SET closed = 1",
        )
        .bind(execution_id.to_string())
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM url_tasks WHERE execution_id = ? AND status = 'pending'")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(
        &self,
        execution_id: Uuid,
        phase_id: Option<&str>,
    ) -> QueueResult<usize> {
        let count: i64 = match phase_id {
            Some(phase) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM url_tasks
                     WHERE execution_id = ? AND phase_id = ? AND status = 'pending'",
                )
                .bind(execution_id.to_string())
                .bind(phase)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM url_tasks
                     WHERE execution_id = ? AND status = 'pending'",
                )
                .bind(execution_id.to_string())
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count as usize)
    }

    async fn leased_count(&self, execution_id: Uuid) -> QueueResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM url_tasks
             WHERE execution_id = ? AND status = 'processing'",
        )
        .bind(execution_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn dlq_count(&self, execution_id: Uuid) -> QueueResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM url_tasks WHERE execution_id = ? AND status = 'dlq'",
        )
        .bind(execution_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            nacked: self.counters.nacked.load(Ordering::Relaxed),
            dlq: self.counters.dlq.load(Ordering::Relaxed),
            expired_redeliveries: self.counters.expired.load(Ordering::Relaxed),
        }
    }
}
