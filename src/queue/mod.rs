//! Durable task queue with at-least-once dispatch.
//!
//! Tasks are leased with a visibility deadline: a leased task that is neither
//! acked nor extended before the deadline re-becomes visible and will be
//! redelivered (with its retry count bumped). `(execution_id, url_hash)`
//! collisions on enqueue are coalesced. FIFO within an `(execution, phase)`
//! partition is a hint, not a guarantee; leasing round-robins across
//! executions so one large crawl cannot starve the others.

mod memory;
mod sqlite;

pub use memory::MemoryTaskQueue;
pub use sqlite::SqliteTaskQueue;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::model::UrlTask;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The execution's queue was closed (execution terminated).
    #[error("queue closed for execution {0}")]
    Closed(Uuid),
    /// Operation referenced a task this caller does not hold a lease on.
    #[error("task {0} is not leased")]
    NotLeased(Uuid),
    #[error("queue backend error: {0}")]
    Backend(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Outcome of an enqueue call. Duplicates are swallowed, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// `(execution_id, url_hash)` already present; coalesced and counted.
    Coalesced,
}

/// Running queue counters, primarily for operator visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dlq: u64,
    pub expired_redeliveries: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: UrlTask) -> QueueResult<EnqueueOutcome>;

    /// Lease up to `max` visible tasks for `worker_id`. Only tasks belonging
    /// to an execution's active phase are handed out; paused and closed
    /// executions yield nothing.
    async fn lease(&self, worker_id: &str, max: usize) -> QueueResult<Vec<UrlTask>>;

    /// Push a lease deadline further out.
    async fn extend(&self, task_id: Uuid, duration: Duration) -> QueueResult<()>;

    async fn ack(&self, task_id: Uuid) -> QueueResult<()>;

    /// Return a leased task to the queue, optionally delayed. Bumps the
    /// task's retry count.
    async fn nack(&self, task_id: Uuid, reason: &str, delay: Option<Duration>) -> QueueResult<()>;

    /// Move a leased task to the dead-letter queue under a category.
    async fn dlq(&self, task_id: Uuid, category: &str) -> QueueResult<()>;

    /// Register an execution and set its currently-leasable phase.
    async fn set_active_phase(&self, execution_id: Uuid, phase_id: &str) -> QueueResult<()>;

    async fn set_paused(&self, execution_id: Uuid, paused: bool) -> QueueResult<()>;

    /// Close the execution's queue; further enqueues fail with `Closed`.
    async fn close(&self, execution_id: Uuid) -> QueueResult<()>;

    /// Visible (pending) tasks for an execution, optionally one phase only.
    async fn pending_count(&self, execution_id: Uuid, phase_id: Option<&str>)
    -> QueueResult<usize>;

    /// Outstanding leases for an execution.
    async fn leased_count(&self, execution_id: Uuid) -> QueueResult<usize>;

    async fn dlq_count(&self, execution_id: Uuid) -> QueueResult<usize>;

    fn stats(&self) -> QueueStats;
}
