//! SQL schema for the metadata store.

/// Idempotent schema, applied on open (CREATE IF NOT EXISTS throughout).
/// Extracted items live in per-day partition tables created at runtime; see
/// [`super::partitions`].
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Frozen workflow configs referenced by executions and task messages.
CREATE TABLE IF NOT EXISTS workflow_snapshots (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    config TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    status TEXT NOT NULL,
    current_phase TEXT NOT NULL,
    phase_index INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    stats TEXT NOT NULL DEFAULT '{}',
    phase_stats TEXT NOT NULL DEFAULT '{}',
    triggered_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

CREATE TABLE IF NOT EXISTS node_executions (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    parent_id TEXT,
    task_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    input TEXT NOT NULL DEFAULT 'null',
    output TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER,
    urls_discovered INTEGER NOT NULL DEFAULT 0,
    items_extracted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_node_executions_execution
    ON node_executions(execution_id);
CREATE INDEX IF NOT EXISTS idx_node_executions_task
    ON node_executions(task_id);

CREATE TABLE IF NOT EXISTS incidents (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    pattern TEXT NOT NULL,
    dom_snapshot TEXT,
    screenshot_ref TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    cookies TEXT NOT NULL DEFAULT '{}',
    attempts TEXT NOT NULL DEFAULT '[]',
    suggested_actions TEXT NOT NULL DEFAULT '[]',
    priority TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_incidents_execution ON incidents(execution_id);
CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);

CREATE TABLE IF NOT EXISTS recovery_rules (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    origin TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS learned_actions (
    signature TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS health_check_schedules (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    cron TEXT NOT NULL,
    notification_config TEXT,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS health_check_reports (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    execution_id TEXT,
    report TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;
