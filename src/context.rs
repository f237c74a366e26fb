//! Per-task execution context.
//!
//! The scratchpad a task's node tree reads and writes: string variables,
//! the extracted-data map, free-form metadata, plus handles to the current
//! task, browser lease and cancellation token. Only the interpreter driving
//! the task mutates it; `parallel` children receive forked copies that are
//! merged back when the fan-out joins.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::BrowserLease;
use crate::model::UrlTask;

/// Keys managed by the engine itself; excluded from user-facing data.
pub const RESERVED_KEYS: &[&str] = &["url", "depth", "markers"];

pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub task: UrlTask,
    pub variables: HashMap<String, String>,
    data: Map<String, Value>,
    pub metadata: HashMap<String, Value>,
    lease: Option<Arc<BrowserLease>>,
    pub cancel: CancellationToken,
    /// Parent chain for node-execution records; last entry is the enclosing
    /// record, first is the task root.
    pub(crate) parent_stack: Vec<Uuid>,
    /// Recovery attempts consumed by this task so far, shared across forks.
    attempts: Arc<AtomicU32>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        task: UrlTask,
        lease: Option<Arc<BrowserLease>>,
        cancel: CancellationToken,
    ) -> Self {
        let mut data = Map::new();
        data.insert("url".into(), Value::String(task.url.clone()));
        data.insert("depth".into(), Value::from(task.depth));
        data.insert(
            "markers".into(),
            Value::Array(task.markers.iter().cloned().map(Value::String).collect()),
        );
        Self {
            execution_id,
            workflow_id,
            task,
            variables: HashMap::new(),
            data,
            metadata: HashMap::new(),
            lease,
            cancel,
            parent_stack: Vec::new(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Claim the next 1-based recovery attempt number for this task,
    /// counting prior queue-level retries.
    pub fn next_attempt(&self) -> u32 {
        self.task.retry_count + self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attempts consumed in this run alone.
    #[must_use]
    pub fn local_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn lease(&self) -> Option<&Arc<BrowserLease>> {
        self.lease.as_ref()
    }

    pub fn set_lease(&mut self, lease: Arc<BrowserLease>) {
        self.lease = Some(lease);
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The extracted-data map minus reserved engine keys.
    #[must_use]
    pub fn data_map(&self) -> Map<String, Value> {
        self.data
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fork for a `parallel` child or a `loop` iteration: same task and
    /// lease, copied variables/data, fresh view of the parent stack.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            task: self.task.clone(),
            variables: self.variables.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
            lease: self.lease.clone(),
            cancel: self.cancel.clone(),
            parent_stack: self.parent_stack.clone(),
            attempts: Arc::clone(&self.attempts),
        }
    }

    /// Merge a fork's data back; the fork's writes win for keys it touched.
    pub fn absorb(&mut self, fork: Self) {
        for (k, v) in fork.data {
            self.data.insert(k, v);
        }
        for (k, v) in fork.variables {
            self.variables.insert(k, v);
        }
        for (k, v) in fork.metadata {
            self.metadata.insert(k, v);
        }
    }
}
