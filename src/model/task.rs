//! Queued crawl tasks: one `(execution, URL)` unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canon::CanonicalUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
}

/// The task message exchanged between the orchestrator, queue and workers.
///
/// `(execution_id, url_hash)` is unique per execution; collisions on enqueue
/// are coalesced. The workflow snapshot is referenced, never embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlTask {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub phase_id: String,
    pub depth: u32,
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub parent_url: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub workflow_snapshot_ref: Uuid,
    pub created_at: DateTime<Utc>,
}

impl UrlTask {
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        canonical: &CanonicalUrl,
        phase_id: impl Into<String>,
        depth: u32,
        markers: Vec<String>,
        snapshot_ref: Uuid,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            execution_id,
            url: canonical.as_str().to_string(),
            url_hash: canonical.hash().to_string(),
            phase_id: phase_id.into(),
            depth,
            markers,
            parent_url: None,
            retry_count: 0,
            workflow_snapshot_ref: snapshot_ref,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_url: impl Into<String>) -> Self {
        self.parent_url = Some(parent_url.into());
        self
    }

    /// Recovery domain key for this task's URL.
    #[must_use]
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}
