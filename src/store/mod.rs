//! Authoritative metadata store.
//!
//! SQLite with WAL mode, a single inline schema, and retrying writes.
//! Transactions cover exactly two paths: inserting an execution together with
//! its initial phase state, and advancing an execution to a terminal status.
//! Everything else is eventually consistent and reconciled by workers reading
//! back their own writes.

mod partitions;
mod schema;

pub use partitions::{drop_expired_partitions, ensure_partitions, partition_date, partition_name};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    Execution, ExecutionStats, ExecutionStatus, ExtractedItem, HealthCheckSchedule, Incident,
    LearnedAction, NodeExecution, NodeExecutionUpdate, RecoveryRule, TriggeredBy, Workflow,
    WorkflowConfig, WorkflowStatus,
};

/// Transient-failure retry budget for individual writes.
const WRITE_RETRIES: u32 = 4;

pub struct MetadataStore {
    pool: SqlitePool,
    config: StoreConfig,
    snapshot_cache: Mutex<LruCache<Uuid, (WorkflowConfig, Instant)>>,
}

impl MetadataStore {
    /// Open or create the store at `path` and apply the schema.
    pub async fn open(path: &Path, config: StoreConfig) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::internal(format!("cannot create store dir {}: {e}", parent.display()))
            })?;
        }

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

        sqlx::query(schema::SCHEMA_SQL).execute(&pool).await?;
        partitions::ensure_partitions(&pool, config.partition_ahead_days).await?;

        let snapshot_cache = Mutex::new(LruCache::new(
            NonZeroUsize::new(256).expect("nonzero cache size"),
        ));

        Ok(Self {
            pool,
            config,
            snapshot_cache,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Retry a write through transient backend errors with exponential
    /// backoff and jitter.
    async fn with_backoff<T, F, Fut>(&self, op_name: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt > WRITE_RETRIES {
                        return Err(EngineError::internal(format!(
                            "{op_name} failed after {WRITE_RETRIES} retries: {err}"
                        )));
                    }
                    let base = 50u64.saturating_mul(1 << attempt.min(6));
                    let jitter = rand::rng().random_range(0..base / 2 + 1);
                    let delay = Duration::from_millis(base + jitter);
                    tracing::warn!(op = op_name, attempt, ?delay, error = %err, "store write retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // =========================================================================
    // Workflows and snapshots
    // =========================================================================

    pub async fn create_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        let config = serde_json::to_string(&workflow.config)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        let status = status_str(workflow.status);
        self.with_backoff("create_workflow", || {
            let config = config.clone();
            async move {
                sqlx::query(
                    "INSERT INTO workflows (id, name, version, config, status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(workflow.id.to_string())
                .bind(&workflow.name)
                .bind(i64::from(workflow.version))
                .bind(config)
                .bind(status)
                .bind(workflow.created_at.timestamp())
                .bind(workflow.updated_at.timestamp())
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ? AND deleted = 0")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let config: String = row.try_get("config")?;
            Ok::<_, EngineError>(Workflow {
                id,
                name: row.try_get("name")?,
                version: row.try_get::<i64, _>("version")? as u32,
                config: serde_json::from_str(&config)
                    .map_err(|e| EngineError::internal(e.to_string()))?,
                status: parse_workflow_status(row.try_get::<String, _>("status")?.as_str()),
                created_at: ts(row.try_get("created_at")?),
                updated_at: ts(row.try_get("updated_at")?),
            })
        })
        .transpose()
    }

    /// Bump the workflow version and replace its config.
    pub async fn update_workflow_config(
        &self,
        id: Uuid,
        config: &WorkflowConfig,
    ) -> EngineResult<u32> {
        let raw =
            serde_json::to_string(config).map_err(|e| EngineError::internal(e.to_string()))?;
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE workflows SET config = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND deleted = 0",
        )
        .bind(raw)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        let version: i64 = sqlx::query_scalar("SELECT version FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(version as u32)
    }

    pub async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status_str(status))
            .bind(Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft delete; the id is never reused.
    pub async fn delete_workflow(&self, id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET deleted = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Freeze a workflow's config; the snapshot id goes into task messages.
    pub async fn create_snapshot(&self, workflow: &Workflow) -> EngineResult<Uuid> {
        let snapshot_id = Uuid::new_v4();
        let config = serde_json::to_string(&workflow.config)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_snapshots (id, workflow_id, version, config, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot_id.to_string())
        .bind(workflow.id.to_string())
        .bind(i64::from(workflow.version))
        .bind(config)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(snapshot_id)
    }

    /// Hot-path read: workers resolve the snapshot for every task. Cached
    /// with a short TTL since snapshots are immutable but cache memory is not
    /// free.
    pub async fn get_snapshot(&self, snapshot_id: Uuid) -> EngineResult<Option<WorkflowConfig>> {
        let ttl = Duration::from_secs(self.config.snapshot_cache_ttl_secs);
        {
            let mut cache = self.snapshot_cache.lock();
            if let Some((config, at)) = cache.get(&snapshot_id) {
                if at.elapsed() < ttl {
                    return Ok(Some(config.clone()));
                }
                cache.pop(&snapshot_id);
            }
        }

        let raw: Option<String> =
            sqlx::query_scalar("SELECT config FROM workflow_snapshots WHERE id = ?")
                .bind(snapshot_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let Some(raw) = raw else { return Ok(None) };
        let config: WorkflowConfig =
            serde_json::from_str(&raw).map_err(|e| EngineError::internal(e.to_string()))?;
        self.snapshot_cache
            .lock()
            .put(snapshot_id, (config.clone(), Instant::now()));
        Ok(Some(config))
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Transactional: the execution row and its snapshot become visible
    /// together.
    pub async fn create_execution(&self, execution: &Execution) -> EngineResult<()> {
        let stats = serde_json::to_string(&execution.stats)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO executions
                (id, workflow_id, snapshot_id, status, current_phase, phase_index,
                 started_at, completed_at, stats, phase_stats, triggered_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', ?)",
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.snapshot_id.to_string())
        .bind(execution_status_str(execution.status))
        .bind(&execution.current_phase)
        .bind(execution.phase_index as i64)
        .bind(execution.started_at.timestamp())
        .bind(execution.completed_at.map(|t| t.timestamp()))
        .bind(stats)
        .bind(triggered_by_str(execution.triggered_by))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: Uuid) -> EngineResult<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let snapshot_id = Uuid::parse_str(&row.try_get::<String, _>("snapshot_id")?)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        let snapshot = self.get_snapshot(snapshot_id).await?.ok_or_else(|| {
            EngineError::internal(format!("execution {id} references missing snapshot"))
        })?;

        let stats: String = row.try_get("stats")?;
        let phase_stats: String = row.try_get("phase_stats")?;
        Ok(Some(Execution {
            id,
            workflow_id: Uuid::parse_str(&row.try_get::<String, _>("workflow_id")?)
                .map_err(|e| EngineError::internal(e.to_string()))?,
            workflow_snapshot: snapshot,
            snapshot_id,
            status: parse_execution_status(row.try_get::<String, _>("status")?.as_str()),
            current_phase: row.try_get("current_phase")?,
            phase_index: row.try_get::<i64, _>("phase_index")? as usize,
            started_at: ts(row.try_get("started_at")?),
            completed_at: row
                .try_get::<Option<i64>, _>("completed_at")?
                .map(ts),
            stats: serde_json::from_str(&stats).unwrap_or_default(),
            phase_stats: serde_json::from_str(&phase_stats).unwrap_or_default(),
            triggered_by: parse_triggered_by(row.try_get::<String, _>("triggered_by")?.as_str()),
        }))
    }

    /// Non-terminal status/phase movement; plain row update.
    pub async fn update_execution_phase(
        &self,
        id: Uuid,
        phase_id: &str,
        phase_index: usize,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE executions SET current_phase = ?, phase_index = ? WHERE id = ?")
            .bind(phase_id)
            .bind(phase_index as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE executions SET status = ? WHERE id = ?")
            .bind(execution_status_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transactional terminal advance: status and completion stamp move
    /// together, exactly once.
    pub async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        stats: &ExecutionStats,
    ) -> EngineResult<()> {
        debug_assert!(status.is_terminal());
        let stats =
            serde_json::to_string(stats).map_err(|e| EngineError::internal(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE executions SET status = ?, completed_at = ?, stats = ?
             WHERE id = ? AND completed_at IS NULL",
        )
        .bind(execution_status_str(status))
        .bind(completed_at.timestamp())
        .bind(stats)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_execution_stats(
        &self,
        id: Uuid,
        stats: &ExecutionStats,
    ) -> EngineResult<()> {
        let raw =
            serde_json::to_string(stats).map_err(|e| EngineError::internal(e.to_string()))?;
        self.with_backoff("update_execution_stats", || {
            let raw = raw.clone();
            async move {
                sqlx::query("UPDATE executions SET stats = ? WHERE id = ?")
                    .bind(raw)
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Cascade delete: execution → node executions → per-partition items.
    pub async fn delete_execution(&self, id: Uuid) -> EngineResult<()> {
        let id_str = id.to_string();
        sqlx::query("DELETE FROM node_executions WHERE execution_id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;
        for table in partitions::list_partitions(&self.pool).await? {
            sqlx::query(&format!("DELETE FROM {table} WHERE execution_id = ?"))
                .bind(&id_str)
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("DELETE FROM incidents WHERE execution_id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Node executions
    // =========================================================================

    pub async fn insert_node_execution(&self, rec: &NodeExecution) -> EngineResult<()> {
        let input = serde_json::to_string(&rec.input)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.with_backoff("insert_node_execution", || {
            let input = input.clone();
            async move {
                sqlx::query(
                    "INSERT OR REPLACE INTO node_executions
                        (id, execution_id, node_id, parent_id, task_id, node_type, status,
                         started_at, completed_at, input, retry_count,
                         urls_discovered, items_extracted)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(rec.id.to_string())
                .bind(rec.execution_id.to_string())
                .bind(&rec.node_id)
                .bind(rec.parent_id.map(|p| p.to_string()))
                .bind(rec.task_id.to_string())
                .bind(&rec.node_type)
                .bind(node_status_str(rec.status))
                .bind(rec.started_at.timestamp_millis())
                .bind(rec.completed_at.map(|t| t.timestamp_millis()))
                .bind(input)
                .bind(i64::from(rec.retry_count))
                .bind(i64::from(rec.urls_discovered))
                .bind(i64::from(rec.items_extracted))
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Batched record opens from the sink; one transaction per batch.
    pub async fn insert_node_executions(&self, recs: &[NodeExecution]) -> EngineResult<()> {
        if recs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for rec in recs {
            let input = serde_json::to_string(&rec.input)
                .map_err(|e| EngineError::internal(e.to_string()))?;
            sqlx::query(
                "INSERT OR REPLACE INTO node_executions
                    (id, execution_id, node_id, parent_id, task_id, node_type, status,
                     started_at, completed_at, input, retry_count,
                     urls_discovered, items_extracted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(rec.id.to_string())
            .bind(rec.execution_id.to_string())
            .bind(&rec.node_id)
            .bind(rec.parent_id.map(|p| p.to_string()))
            .bind(rec.task_id.to_string())
            .bind(&rec.node_type)
            .bind(node_status_str(rec.status))
            .bind(rec.started_at.timestamp_millis())
            .bind(rec.completed_at.map(|t| t.timestamp_millis()))
            .bind(input)
            .bind(i64::from(rec.retry_count))
            .bind(i64::from(rec.urls_discovered))
            .bind(i64::from(rec.items_extracted))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Batched status updates from the sink. Updates to the same record are
    /// pre-coalesced by the sink; here they apply in submission order.
    pub async fn apply_node_updates(&self, updates: &[NodeExecutionUpdate]) -> EngineResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for update in updates {
            let output = update
                .output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| EngineError::internal(e.to_string()))?;
            sqlx::query(
                "UPDATE node_executions
                 SET status = ?, completed_at = ?, output = ?, error = ?,
                     retry_count = ?, duration_ms = ?, urls_discovered = ?, items_extracted = ?
                 WHERE id = ?",
            )
            .bind(node_status_str(update.status))
            .bind(update.completed_at.map(|t| t.timestamp_millis()))
            .bind(output)
            .bind(&update.error)
            .bind(i64::from(update.retry_count))
            .bind(update.duration_ms.map(|d| d as i64))
            .bind(i64::from(update.urls_discovered))
            .bind(i64::from(update.items_extracted))
            .bind(update.id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Close records a dead attempt left open. Called when a redelivered
    /// task is re-claimed, so stale `running` records never stall the
    /// all-nodes-complete transition.
    pub async fn close_abandoned_node_executions(&self, task_id: Uuid) -> EngineResult<u64> {
        let closed = sqlx::query(
            "UPDATE node_executions
             SET status = 'failed', error = 'abandoned', completed_at = ?
             WHERE task_id = ? AND status IN ('pending', 'running')",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(closed)
    }

    /// Count node-execution roots (no parent) for one `(execution, url_hash)`
    /// in terminal states. Exercised by the at-most-N-attempts invariant.
    pub async fn count_task_roots(&self, task_id: Uuid) -> EngineResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM node_executions
             WHERE task_id = ? AND parent_id IS NULL
               AND status IN ('completed', 'failed')",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    /// Whether every node execution recorded for an execution is terminal.
    pub async fn all_nodes_terminal(&self, execution_id: Uuid) -> EngineResult<bool> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM node_executions
             WHERE execution_id = ? AND status IN ('pending', 'running')",
        )
        .bind(execution_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(open == 0)
    }

    // =========================================================================
    // Extracted items
    // =========================================================================

    /// Append-only batch insert into today's partition.
    pub async fn insert_items(&self, items: &[ExtractedItem]) -> EngineResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let table = partitions::partition_name(Utc::now().date_naive());
        // Normally pre-created by the partition job; cover the gap on the
        // first write of a fresh day.
        partitions::ensure_partitions(&self.pool, 0).await?;

        let mut tx = self.pool.begin().await?;
        for item in items {
            let data = serde_json::to_string(&item.data)
                .map_err(|e| EngineError::internal(e.to_string()))?;
            sqlx::query(&format!(
                "INSERT OR IGNORE INTO {table}
                    (id, execution_id, workflow_id, task_id, url, data, extracted_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(item.id.to_string())
            .bind(item.execution_id.to_string())
            .bind(item.workflow_id.to_string())
            .bind(item.task_id.to_string())
            .bind(&item.url)
            .bind(data)
            .bind(item.extracted_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_items(&self, execution_id: Uuid) -> EngineResult<usize> {
        let mut total = 0usize;
        for table in partitions::list_partitions(&self.pool).await? {
            let count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE execution_id = ?"))
                    .bind(execution_id.to_string())
                    .fetch_one(&self.pool)
                    .await?;
            total += count as usize;
        }
        Ok(total)
    }

    // =========================================================================
    // Incidents
    // =========================================================================

    pub async fn insert_incident(&self, incident: &Incident) -> EngineResult<()> {
        let headers = serde_json::to_string(&incident.headers).unwrap_or_default();
        let cookies = serde_json::to_string(&incident.cookies).unwrap_or_default();
        let attempts = serde_json::to_string(&incident.attempts)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        let suggested = serde_json::to_string(&incident.suggested_actions)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.with_backoff("insert_incident", || {
            let headers = headers.clone();
            let cookies = cookies.clone();
            let attempts = attempts.clone();
            let suggested = suggested.clone();
            async move {
                sqlx::query(
                    "INSERT INTO incidents
                        (id, execution_id, task_id, url, domain, pattern, dom_snapshot,
                         screenshot_ref, headers, cookies, attempts, suggested_actions,
                         priority, status, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(incident.id.to_string())
                .bind(incident.execution_id.to_string())
                .bind(incident.task_id.to_string())
                .bind(&incident.url)
                .bind(&incident.domain)
                .bind(&incident.pattern)
                .bind(&incident.dom_snapshot)
                .bind(&incident.screenshot_ref)
                .bind(headers)
                .bind(cookies)
                .bind(attempts)
                .bind(suggested)
                .bind(priority_str(incident.priority))
                .bind(incident_status_str(incident.status))
                .bind(incident.created_at.timestamp())
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn count_incidents(&self, execution_id: Uuid) -> EngineResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM incidents WHERE execution_id = ?")
                .bind(execution_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    // =========================================================================
    // Recovery rules and learned actions
    // =========================================================================

    pub async fn upsert_rule(&self, rule: &RecoveryRule) -> EngineResult<()> {
        let body =
            serde_json::to_string(rule).map_err(|e| EngineError::internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO recovery_rules (id, body, origin, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body,
                 origin = excluded.origin, updated_at = excluded.updated_at",
        )
        .bind(&rule.id)
        .bind(body)
        .bind(format!("{:?}", rule.origin).to_lowercase())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_rules(&self) -> EngineResult<Vec<RecoveryRule>> {
        let rows = sqlx::query("SELECT body FROM recovery_rules")
            .fetch_all(&self.pool)
            .await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            rules.push(
                serde_json::from_str(&body).map_err(|e| EngineError::internal(e.to_string()))?,
            );
        }
        Ok(rules)
    }

    pub async fn upsert_learned_action(&self, action: &LearnedAction) -> EngineResult<()> {
        let signature = LearnedAction::signature(&action.pattern, &action.domain, &action.action);
        let body =
            serde_json::to_string(action).map_err(|e| EngineError::internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO learned_actions (signature, body, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(signature) DO UPDATE SET body = excluded.body,
                 updated_at = excluded.updated_at",
        )
        .bind(signature)
        .bind(body)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_learned_actions(&self) -> EngineResult<Vec<LearnedAction>> {
        let rows = sqlx::query("SELECT body FROM learned_actions")
            .fetch_all(&self.pool)
            .await?;
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            actions.push(
                serde_json::from_str(&body).map_err(|e| EngineError::internal(e.to_string()))?,
            );
        }
        Ok(actions)
    }

    pub async fn delete_learned_action(&self, signature: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM learned_actions WHERE signature = ?")
            .bind(signature)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Health-check schedules
    // =========================================================================

    pub async fn upsert_schedule(&self, schedule: &HealthCheckSchedule) -> EngineResult<()> {
        let notification = schedule
            .notification_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EngineError::internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO health_check_schedules (id, workflow_id, cron, notification_config, enabled)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET cron = excluded.cron,
                 notification_config = excluded.notification_config,
                 enabled = excluded.enabled",
        )
        .bind(schedule.id.to_string())
        .bind(schedule.workflow_id.to_string())
        .bind(&schedule.cron)
        .bind(notification)
        .bind(i64::from(schedule.enabled))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_schedules(&self) -> EngineResult<Vec<HealthCheckSchedule>> {
        let rows = sqlx::query("SELECT * FROM health_check_schedules WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let notification: Option<String> = row.try_get("notification_config")?;
            schedules.push(HealthCheckSchedule {
                id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                    .map_err(|e| EngineError::internal(e.to_string()))?,
                workflow_id: Uuid::parse_str(&row.try_get::<String, _>("workflow_id")?)
                    .map_err(|e| EngineError::internal(e.to_string()))?,
                cron: row.try_get("cron")?,
                notification_config: notification
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .map_err(|e| EngineError::internal(e.to_string()))?,
                enabled: row.try_get::<i64, _>("enabled")? == 1,
            });
        }
        Ok(schedules)
    }

    pub async fn insert_health_report(
        &self,
        schedule_id: Uuid,
        execution_id: Option<Uuid>,
        report: &serde_json::Value,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO health_check_reports (id, schedule_id, execution_id, report, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(schedule_id.to_string())
        .bind(execution_id.map(|e| e.to_string()))
        .bind(serde_json::to_string(report).map_err(|e| EngineError::internal(e.to_string()))?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// String mappings kept local so schema text stays the single source of truth.

fn status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "draft",
        WorkflowStatus::Active => "active",
        WorkflowStatus::Inactive => "inactive",
    }
}

fn parse_workflow_status(raw: &str) -> WorkflowStatus {
    match raw {
        "active" => WorkflowStatus::Active,
        "inactive" => WorkflowStatus::Inactive,
        _ => WorkflowStatus::Draft,
    }
}

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Paused => "paused",
        ExecutionStatus::Stopped => "stopped",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}

fn parse_execution_status(raw: &str) -> ExecutionStatus {
    match raw {
        "paused" => ExecutionStatus::Paused,
        "stopped" => ExecutionStatus::Stopped,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        _ => ExecutionStatus::Running,
    }
}

fn triggered_by_str(triggered_by: TriggeredBy) -> &'static str {
    match triggered_by {
        TriggeredBy::Api => "api",
        TriggeredBy::Schedule => "schedule",
        TriggeredBy::Manual => "manual",
    }
}

fn parse_triggered_by(raw: &str) -> TriggeredBy {
    match raw {
        "schedule" => TriggeredBy::Schedule,
        "manual" => TriggeredBy::Manual,
        _ => TriggeredBy::Api,
    }
}

fn node_status_str(status: crate::model::NodeRunStatus) -> &'static str {
    use crate::model::NodeRunStatus;
    match status {
        NodeRunStatus::Pending => "pending",
        NodeRunStatus::Running => "running",
        NodeRunStatus::Completed => "completed",
        NodeRunStatus::Failed => "failed",
        NodeRunStatus::Skipped => "skipped",
    }
}

fn priority_str(priority: crate::model::IncidentPriority) -> &'static str {
    use crate::model::IncidentPriority;
    match priority {
        IncidentPriority::Low => "low",
        IncidentPriority::Medium => "medium",
        IncidentPriority::High => "high",
    }
}

fn incident_status_str(status: crate::model::IncidentStatus) -> &'static str {
    use crate::model::IncidentStatus;
    match status {
        IncidentStatus::Open => "open",
        IncidentStatus::InProgress => "in_progress",
        IncidentStatus::Resolved => "resolved",
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}
