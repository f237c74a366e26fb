//! Execution records: one run of a workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::workflow::WorkflowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Api,
    Schedule,
    Manual,
}

/// Running counters for one execution. Updated eventually-consistently by
/// workers; the terminal snapshot is authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_dlq: u64,
    pub urls_discovered: u64,
    pub items_extracted: u64,
    pub recovery_actions: u64,
    /// Error counts keyed by `ErrorKind::as_str()`.
    #[serde(default)]
    pub errors_by_kind: HashMap<String, u64>,
}

impl ExecutionStats {
    pub fn record_error(&mut self, kind: &str) {
        *self.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Config frozen at execution start. Tasks reference it indirectly via
    /// `workflow_snapshot_ref`; the full copy lives in the metadata store.
    pub workflow_snapshot: WorkflowConfig,
    pub snapshot_id: Uuid,
    pub status: ExecutionStatus,
    pub current_phase: String,
    /// Index of `current_phase` in the snapshot; only ever increases.
    pub phase_index: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: ExecutionStats,
    #[serde(default)]
    pub phase_stats: HashMap<String, ExecutionStats>,
    pub triggered_by: TriggeredBy,
}

impl Execution {
    /// Terminal status implies a completion timestamp.
    pub fn finish(&mut self, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_sets_completed_at() {
        let mut exec = Execution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            workflow_snapshot: WorkflowConfig {
                start_urls: vec![],
                max_depth: 0,
                rate_limit_delay: 0,
                storage: Default::default(),
                phases: vec![],
            },
            snapshot_id: Uuid::new_v4(),
            status: ExecutionStatus::Running,
            current_phase: "p1".into(),
            phase_index: 0,
            started_at: Utc::now(),
            completed_at: None,
            stats: ExecutionStats::default(),
            phase_stats: HashMap::new(),
            triggered_by: TriggeredBy::Api,
        };
        exec.finish(ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert!(exec.status.is_terminal());
    }
}
