//! Extracted items. Immutable after insert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    pub data: Value,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractedItem {
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        task_id: Uuid,
        url: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id,
            task_id,
            url: url.into(),
            data,
            extracted_at: Utc::now(),
        }
    }
}
