//! Node execution records.
//!
//! Every node run opens a record; records form a tree per task rooted at the
//! first node executed, linked by explicit `parent_id` (no back-pointers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Optional node that failed, or branch not taken
    Skipped,
}

impl NodeRunStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    /// Parent record in the per-task tree; `None` only for the task root.
    pub parent_id: Option<Uuid>,
    pub task_id: Uuid,
    pub node_type: String,
    pub status: NodeRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
    pub urls_discovered: u32,
    pub items_extracted: u32,
}

impl NodeExecution {
    #[must_use]
    pub fn open(
        execution_id: Uuid,
        task_id: Uuid,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        parent_id: Option<Uuid>,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            parent_id,
            task_id,
            node_type: node_type.into(),
            status: NodeRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input,
            output: None,
            error: None,
            retry_count: 0,
            duration_ms: None,
            urls_discovered: 0,
            items_extracted: 0,
        }
    }

    /// Close the record. Duration is derived; `completed_at >= started_at`.
    pub fn close(&mut self, status: NodeRunStatus) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        let completed = if now < self.started_at { self.started_at } else { now };
        self.status = status;
        self.completed_at = Some(completed);
        self.duration_ms = Some(
            (completed - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }
}

/// Coalescable status update flowing through the batch sink. Updates to the
/// same record id collapse to the newest one, preserving causal order per
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionUpdate {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub status: NodeRunStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
    pub urls_discovered: u32,
    pub items_extracted: u32,
}

impl From<&NodeExecution> for NodeExecutionUpdate {
    fn from(rec: &NodeExecution) -> Self {
        Self {
            id: rec.id,
            execution_id: rec.execution_id,
            status: rec.status,
            completed_at: rec.completed_at,
            output: rec.output.clone(),
            error: rec.error.clone(),
            retry_count: rec.retry_count,
            duration_ms: rec.duration_ms,
            urls_discovered: rec.urls_discovered,
            items_extracted: rec.items_extracted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn close_derives_duration() {
        let mut rec = NodeExecution::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "n1",
            "navigate",
            None,
            json!({"url": "https://ex.test"}),
        );
        rec.close(NodeRunStatus::Completed);
        assert!(rec.status.is_terminal());
        let completed = rec.completed_at.unwrap();
        assert!(completed >= rec.started_at);
        assert!(rec.duration_ms.is_some());
    }
}
