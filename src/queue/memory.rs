//! In-process queue backend.
//!
//! Backs tests and single-worker deployments. All state sits behind one
//! short-held lock; no await happens while it is held.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{EnqueueOutcome, QueueError, QueueResult, QueueStats, TaskQueue};
use crate::model::UrlTask;

#[derive(Debug)]
struct ExecutionQueue {
    pending: VecDeque<UrlTask>,
    /// Nacked-with-delay tasks waiting to become visible.
    delayed: Vec<(UrlTask, Instant)>,
    seen_hashes: HashSet<String>,
    active_phase: Option<String>,
    paused: bool,
    closed: bool,
    dlq: Vec<(UrlTask, String)>,
}

impl ExecutionQueue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            delayed: Vec::new(),
            seen_hashes: HashSet::new(),
            active_phase: None,
            paused: false,
            closed: false,
            dlq: Vec::new(),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let mut still_waiting = Vec::new();
        for (task, due) in self.delayed.drain(..) {
            if due <= now {
                self.pending.push_back(task);
            } else {
                still_waiting.push((task, due));
            }
        }
        self.delayed = still_waiting;
    }

    fn leasable(&self) -> bool {
        !self.paused && !self.closed && self.active_phase.is_some()
    }

    /// Pop the first pending task of the active phase, skipping tasks that
    /// belong to later phases.
    fn pop_active(&mut self) -> Option<UrlTask> {
        let phase = self.active_phase.clone()?;
        let pos = self.pending.iter().position(|t| t.phase_id == phase)?;
        self.pending.remove(pos)
    }
}

#[derive(Debug)]
struct LeaseEntry {
    task: UrlTask,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dlq: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    executions: HashMap<Uuid, ExecutionQueue>,
    leases: HashMap<Uuid, LeaseEntry>,
    /// Round-robin cursor across execution ids.
    rotation: VecDeque<Uuid>,
}

pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
    counters: Counters,
    visibility_timeout: Duration,
}

impl MemoryTaskQueue {
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                executions: HashMap::new(),
                leases: HashMap::new(),
                rotation: VecDeque::new(),
            }),
            counters: Counters::default(),
            visibility_timeout,
        }
    }

    /// Return expired leases to their pending queues with a bumped retry
    /// count. Redelivery after a missed deadline is the at-least-once path;
    /// closed executions take nothing back.
    fn reap_expired(inner: &mut Inner, counters: &Counters, now: Instant) {
        let expired: Vec<Uuid> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for task_id in expired {
            if let Some(lease) = inner.leases.remove(&task_id) {
                let mut task = lease.task;
                task.retry_count += 1;
                counters.expired.fetch_add(1, Ordering::Relaxed);
                if let Some(queue) = inner.executions.get_mut(&task.execution_id) {
                    if !queue.closed {
                        queue.pending.push_back(task);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: UrlTask) -> QueueResult<EnqueueOutcome> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let execution_id = task.execution_id;
        let queue = inner
            .executions
            .entry(execution_id)
            .or_insert_with(ExecutionQueue::new);
        if queue.closed {
            return Err(QueueError::Closed(execution_id));
        }
        if !queue.seen_hashes.insert(task.url_hash.clone()) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(EnqueueOutcome::Coalesced);
        }
        queue.pending.push_back(task);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if !inner.rotation.contains(&execution_id) {
            inner.rotation.push_back(execution_id);
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn lease(&self, _worker_id: &str, max: usize) -> QueueResult<Vec<UrlTask>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::reap_expired(&mut inner, &self.counters, now);

        for queue in inner.executions.values_mut() {
            queue.promote_due(now);
        }

        let mut leased = Vec::new();
        if max == 0 {
            return Ok(leased);
        }

        // One task per execution per round until `max` or no execution has
        // leasable work left.
        let mut starved_rounds = 0;
        while leased.len() < max && starved_rounds < inner.rotation.len().max(1) {
            let Some(execution_id) = inner.rotation.pop_front() else {
                break;
            };
            inner.rotation.push_back(execution_id);

            let task = inner
                .executions
                .get_mut(&execution_id)
                .filter(|q| q.leasable())
                .and_then(ExecutionQueue::pop_active);

            match task {
                Some(task) => {
                    starved_rounds = 0;
                    inner.leases.insert(
                        task.task_id,
                        LeaseEntry {
                            task: task.clone(),
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    leased.push(task);
                }
                None => starved_rounds += 1,
            }
        }
        Ok(leased)
    }

    async fn extend(&self, task_id: Uuid, duration: Duration) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .get_mut(&task_id)
            .ok_or(QueueError::NotLeased(task_id))?;
        lease.deadline = Instant::now() + duration;
        Ok(())
    }

    async fn ack(&self, task_id: Uuid) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        inner
            .leases
            .remove(&task_id)
            .ok_or(QueueError::NotLeased(task_id))?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, task_id: Uuid, reason: &str, delay: Option<Duration>) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .remove(&task_id)
            .ok_or(QueueError::NotLeased(task_id))?;
        let mut task = lease.task;
        task.retry_count += 1;
        tracing::debug!(%task_id, reason, retry_count = task.retry_count, "task nacked");
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        if let Some(queue) = inner.executions.get_mut(&task.execution_id) {
            // A closed execution takes no work back; the lease is simply
            // released so the terminal-state invariant holds.
            if queue.closed {
                return Ok(());
            }
            match delay {
                Some(d) => queue.delayed.push((task, Instant::now() + d)),
                None => queue.pending.push_back(task),
            }
        }
        Ok(())
    }

    async fn dlq(&self, task_id: Uuid, category: &str) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .remove(&task_id)
            .ok_or(QueueError::NotLeased(task_id))?;
        self.counters.dlq.fetch_add(1, Ordering::Relaxed);
        let execution_id = lease.task.execution_id;
        if let Some(queue) = inner.executions.get_mut(&execution_id) {
            queue.dlq.push((lease.task, category.to_string()));
        }
        Ok(())
    }

    async fn set_active_phase(&self, execution_id: Uuid, phase_id: &str) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let queue = inner
            .executions
            .entry(execution_id)
            .or_insert_with(ExecutionQueue::new);
        queue.active_phase = Some(phase_id.to_string());
        if !inner.rotation.contains(&execution_id) {
            inner.rotation.push_back(execution_id);
        }
        Ok(())
    }

    async fn set_paused(&self, execution_id: Uuid, paused: bool) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.executions.get_mut(&execution_id) {
            queue.paused = paused;
        }
        Ok(())
    }

    async fn close(&self, execution_id: Uuid) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.executions.get_mut(&execution_id) {
            queue.closed = true;
            queue.pending.clear();
            queue.delayed.clear();
        }
        inner.rotation.retain(|id| *id != execution_id);
        Ok(())
    }

    async fn pending_count(
        &self,
        execution_id: Uuid,
        phase_id: Option<&str>,
    ) -> QueueResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.executions.get(&execution_id).map_or(0, |q| {
            let pending = q
                .pending
                .iter()
                .filter(|t| phase_id.is_none_or(|p| t.phase_id == p))
                .count();
            let delayed = q
                .delayed
                .iter()
                .filter(|(t, _)| phase_id.is_none_or(|p| t.phase_id == p))
                .count();
            pending + delayed
        }))
    }

    async fn leased_count(&self, execution_id: Uuid) -> QueueResult<usize> {
        let inner = self.inner.lock();
        Ok(inner
            .leases
            .values()
            .filter(|l| l.task.execution_id == execution_id)
            .count())
    }

    async fn dlq_count(&self, execution_id: Uuid) -> QueueResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.executions.get(&execution_id).map_or(0, |q| q.dlq.len()))
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
