//! Event type definitions for the execution stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeStarted,
    NodeFinished,
    Log,
    StatusChange,
}

/// One record on the per-execution event stream.
///
/// The stream is best-effort: slow subscribers lose the oldest events and the
/// metadata store remains the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    #[serde(default)]
    pub node_execution_id: Option<Uuid>,
    #[serde(default)]
    pub phase_id: Option<String>,
    pub kind: EventKind,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl ExecutionEvent {
    #[must_use]
    pub fn node_started(
        execution_id: Uuid,
        node_execution_id: Uuid,
        phase_id: &str,
        node_id: &str,
        node_type: &str,
    ) -> Self {
        Self {
            execution_id,
            node_execution_id: Some(node_execution_id),
            phase_id: Some(phase_id.to_string()),
            kind: EventKind::NodeStarted,
            payload: serde_json::json!({
                "node_id": node_id,
                "node_type": node_type,
            }),
            ts: Utc::now(),
        }
    }

    #[must_use]
    pub fn node_finished(
        execution_id: Uuid,
        node_execution_id: Uuid,
        phase_id: &str,
        node_id: &str,
        status: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            execution_id,
            node_execution_id: Some(node_execution_id),
            phase_id: Some(phase_id.to_string()),
            kind: EventKind::NodeFinished,
            payload: serde_json::json!({
                "node_id": node_id,
                "status": status,
                "duration_ms": duration_ms,
            }),
            ts: Utc::now(),
        }
    }

    #[must_use]
    pub fn log(execution_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            node_execution_id: None,
            phase_id: None,
            kind: EventKind::Log,
            payload: serde_json::json!({ "message": message.into() }),
            ts: Utc::now(),
        }
    }

    #[must_use]
    pub fn status_change(execution_id: Uuid, status: ExecutionStatus, phase_id: &str) -> Self {
        Self {
            execution_id,
            node_execution_id: None,
            phase_id: Some(phase_id.to_string()),
            kind: EventKind::StatusChange,
            payload: serde_json::json!({ "status": status }),
            ts: Utc::now(),
        }
    }
}
