//! Worker loop: the long-lived task consumer.
//!
//! Keeps `W` tasks in flight: lease → dedup claim → browser lease → node
//! tree → enqueue discovered URLs → persist items → ack. A panic inside a
//! task is caught at the join boundary and turns into a nack; the loop
//! itself never dies from one task.

mod runtime;

pub use runtime::{QueueBackend, WorkerRuntime};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserPool, BrowserProfile};
use crate::canon::CanonicalUrl;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::dedup::{DedupCache, UrlState};
use crate::error::{EngineError, EngineResult};
use crate::model::{ExtractedItem, UrlTask};
use crate::nodes::{Interpreter, TaskDisposition};
use crate::phase::PhaseOrchestrator;
use crate::queue::TaskQueue;
use crate::recovery::{RecoveryDirective, RecoveryEngine, failure_context};
use crate::sink::{SinkHandle, SinkRecord};

/// Everything a spawned task needs, cloned per task.
#[derive(Clone)]
struct TaskEnv {
    config: Arc<EngineConfig>,
    queue: Arc<dyn TaskQueue>,
    dedup: Arc<dyn DedupCache>,
    pool: Option<Arc<BrowserPool>>,
    interpreter: Arc<Interpreter>,
    orchestrator: Arc<PhaseOrchestrator>,
    recovery: Arc<RecoveryEngine>,
    sink: SinkHandle,
    store: Arc<crate::store::MetadataStore>,
}

pub struct Worker {
    id: String,
    env: TaskEnv,
    shutdown: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        config: Arc<EngineConfig>,
        queue: Arc<dyn TaskQueue>,
        dedup: Arc<dyn DedupCache>,
        store: Arc<crate::store::MetadataStore>,
        pool: Option<Arc<BrowserPool>>,
        interpreter: Arc<Interpreter>,
        orchestrator: Arc<PhaseOrchestrator>,
        recovery: Arc<RecoveryEngine>,
        sink: SinkHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            env: TaskEnv {
                config,
                queue,
                dedup,
                pool,
                interpreter,
                orchestrator,
                recovery,
                sink,
                store,
            },
            shutdown,
        }
    }

    /// Run until shutdown; drains in-flight tasks before returning.
    pub async fn run(&self) {
        info!(worker = self.id, "worker loop started");
        let max_in_flight = self.env.config.worker.max_in_flight;
        let mut active: FuturesUnordered<_> = FuturesUnordered::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Top up to W tasks in flight.
            let room = max_in_flight.saturating_sub(active.len());
            if room > 0 {
                match self.env.queue.lease(&self.id, room).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let env = self.env.clone();
                            let shutdown = self.shutdown.clone();
                            let task_id = task.task_id;
                            let execution_id = task.execution_id;
                            let handle = tokio::spawn(async move {
                                process_task(env, task, shutdown).await;
                            });
                            active.push(async move { (task_id, execution_id, handle.await) });
                        }
                    }
                    Err(e) => warn!(worker = self.id, "lease failed: {e}"),
                }
            }

            if active.is_empty() {
                // Idle: poll again shortly, or leave on shutdown.
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = active.next() => {
                    if let Some((task_id, execution_id, result)) = joined {
                        if let Err(join_error) = result {
                            // Task panicked: isolate it, never crash the loop.
                            error!(%task_id, "task panicked: {join_error}");
                            let _ = self
                                .env
                                .queue
                                .nack(task_id, "internal_error", Some(Duration::from_secs(5)))
                                .await;
                            let _ = self
                                .env
                                .orchestrator
                                .record_task_stats(execution_id, |stats| {
                                    stats.tasks_failed += 1;
                                    stats.record_error("internal");
                                })
                                .await;
                        }
                    }
                }
            }
        }

        // Graceful drain: let in-flight tasks finish, bounded by T.
        let drain = Duration::from_secs(self.env.config.worker.drain_timeout_secs);
        info!(worker = self.id, in_flight = active.len(), "draining worker");
        let drain_all = async {
            while active.next().await.is_some() {}
        };
        if tokio::time::timeout(drain, drain_all).await.is_err() {
            warn!(worker = self.id, "drain timeout; abandoning remaining tasks");
        }
        self.env.sink.flush().await;
        info!(worker = self.id, "worker loop stopped");
    }
}

/// Process one leased task end to end.
async fn process_task(env: TaskEnv, task: UrlTask, shutdown: CancellationToken) {
    let execution_id = task.execution_id;
    let task_id = task.task_id;

    // Token tree: global shutdown → execution stop → this task.
    let control = env.orchestrator.control(execution_id);
    let cancel = control.cancel.child_token();
    let shutdown_guard = shutdown.clone();
    let cancel_on_shutdown = cancel.clone();
    let guard = tokio::spawn(async move {
        shutdown_guard.cancelled().await;
        cancel_on_shutdown.cancel();
    });

    let deadline = Duration::from_secs(env.config.worker.task_deadline_secs);
    let result = tokio::time::timeout(deadline, run_task(&env, &task, cancel.clone())).await;
    guard.abort();

    match result {
        Ok(()) => {}
        Err(_elapsed) => {
            // Hard task ceiling: release the claim so a retry can re-claim.
            warn!(%task_id, "task exceeded hard deadline");
            cancel.cancel();
            let _ = env.dedup.release(execution_id, &task.url_hash).await;
            let _ = env
                .queue
                .nack(task_id, "task_deadline", Some(Duration::from_secs(30)))
                .await;
            let _ = env
                .orchestrator
                .record_task_stats(execution_id, |stats| {
                    stats.tasks_failed += 1;
                    stats.record_error("timeout");
                })
                .await;
            let _ = env.orchestrator.on_task_finished(execution_id).await;
        }
    }
}

async fn run_task(env: &TaskEnv, task: &UrlTask, cancel: CancellationToken) {
    let execution_id = task.execution_id;
    let task_id = task.task_id;
    let domain = task.domain();

    // Domain currently skipped: hand the task back for later.
    if let Some(remaining) = env.recovery.domain_blocked(&domain) {
        debug!(%task_id, domain, "domain blocked, deferring task");
        let _ = env.queue.nack(task_id, "domain_blocked", Some(remaining)).await;
        return;
    }

    // Claim the URL. Losing the claim means a twin attempt is running or
    // already finished; ack and drop.
    match env.dedup.try_claim(execution_id, &task.url_hash).await {
        Ok(true) => {}
        Ok(false) => {
            let state = env.dedup.state(execution_id, &task.url_hash).await.ok().flatten();
            debug!(%task_id, ?state, "dedup claim lost, dropping task");
            let _ = env.queue.ack(task_id).await;
            let _ = env.orchestrator.on_task_finished(execution_id).await;
            return;
        }
        Err(e) => {
            warn!(%task_id, "dedup claim errored: {e}");
            let _ = env.queue.nack(task_id, "dedup_error", Some(Duration::from_secs(5))).await;
            return;
        }
    }

    match execute_claimed(env, task, cancel).await {
        Ok(()) => {}
        Err(error) if error.is_cancelled() => {
            // Cancelled: drop in-flight work silently; no retry from here.
            // Accounting writes already in the sink are allowed to finish.
            debug!(%task_id, "task cancelled");
            let _ = env.dedup.release(execution_id, &task.url_hash).await;
            let _ = env.queue.nack(task_id, "cancelled", None).await;
        }
        Err(error) => {
            handle_task_failure(env, task, &error).await;
        }
    }
}

/// The claimed path: resolve snapshot/phase, browse, interpret, persist.
async fn execute_claimed(
    env: &TaskEnv,
    task: &UrlTask,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let execution_id = task.execution_id;
    let task_id = task.task_id;
    let domain = task.domain();

    let snapshot = env
        .store
        .get_snapshot(task.workflow_snapshot_ref)
        .await?
        .ok_or_else(|| {
            EngineError::internal(format!(
                "task {task_id} references missing snapshot {}",
                task.workflow_snapshot_ref
            ))
        })?;
    let Some(phase) = snapshot.phase(&task.phase_id) else {
        // Phase disappeared from the snapshot: config bug, not retryable.
        env.queue
            .dlq(task_id, "unknown_phase")
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        return Ok(());
    };

    let workflow_id = env
        .store
        .get_execution(execution_id)
        .await?
        .map(|e| e.workflow_id)
        .unwrap_or_default();

    // A redelivered task may have records a dead attempt left open.
    if task.retry_count > 0 {
        let closed = env.store.close_abandoned_node_executions(task_id).await?;
        if closed > 0 {
            debug!(%task_id, closed, "closed abandoned node executions from a prior attempt");
        }
    }

    // Politeness delay before touching the domain.
    if snapshot.rate_limit_delay > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(snapshot.rate_limit_delay)) => {}
            _ = cancel.cancelled() => return Err(EngineError::cancelled()),
        }
    }

    // Acquire a browser context and navigate.
    let lease = match &env.pool {
        Some(pool) => {
            let profile = BrowserProfile::default();
            match pool.acquire(&profile, &cancel).await {
                Ok(lease) => Some(Arc::new(lease)),
                Err(crate::browser::PoolError::Timeout) => {
                    // Contention: release the claim, requeue.
                    env.dedup.release(execution_id, &task.url_hash).await?;
                    env.queue
                        .nack(task_id, "contention", Some(Duration::from_secs(5)))
                        .await
                        .map_err(|e| EngineError::internal(e.to_string()))?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => None,
    };

    if let Some(lease) = &lease {
        let nav_timeout = Duration::from_millis(env.config.worker.navigation_timeout_ms);
        if let Err(error) = lease.navigate(&task.url, nav_timeout).await {
            // A context that failed navigation is not trusted again.
            lease.mark_discard();
            return Err(error);
        }
    }

    let mut ctx = ExecutionContext::new(
        execution_id,
        workflow_id,
        task.clone(),
        lease.clone(),
        cancel.clone(),
    );

    let outcome = env.interpreter.run_phase(&mut ctx, phase).await?;
    let discovered_count = outcome.discovered.len() as u64;
    let item_count = outcome.items.len() as u64;

    match outcome.disposition() {
        TaskDisposition::Completed => {
            // Discovered URLs fan out at depth+1, routed to the phase whose
            // filter matches their markers. max_depth=0 suppresses discovery.
            let next_depth = task.depth + 1;
            if next_depth <= snapshot.max_depth {
                for discovered in outcome.discovered {
                    let Ok(canonical) = CanonicalUrl::parse(&discovered.url) else {
                        continue;
                    };
                    // Already finished in this execution: skip the enqueue.
                    if matches!(
                        env.dedup.state(execution_id, canonical.hash()).await,
                        Ok(Some(UrlState::Completed))
                    ) {
                        continue;
                    }
                    let markers: Vec<String> = discovered.marker.clone().into_iter().collect();
                    let phase_id = snapshot
                        .assign_phase(&markers, next_depth, &task.phase_id)
                        .to_string();
                    let new_task = UrlTask::new(
                        execution_id,
                        &canonical,
                        phase_id,
                        next_depth,
                        markers,
                        task.workflow_snapshot_ref,
                    )
                    .with_parent(&task.url);
                    if let Err(e) = env.queue.enqueue(new_task).await {
                        warn!("enqueue of discovered URL failed: {e}");
                    }
                }
            }

            for data in outcome.items {
                let item = ExtractedItem::new(execution_id, workflow_id, task_id, &task.url, data);
                env.sink.submit(SinkRecord::Item(item)).await;
            }

            env.dedup.mark_completed(execution_id, &task.url_hash).await?;
            env.queue
                .ack(task_id)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            // Lease drop returns the context to the pool (or retires it at
            // the rotation threshold).
            env.recovery.record_success(&domain).await;
            env.recovery.forget_task(task_id);

            // The transition check reads node records back from the store;
            // they must land before on_task_finished evaluates it.
            env.sink.flush().await;

            env.orchestrator
                .record_task_stats(execution_id, |stats| {
                    stats.tasks_completed += 1;
                    stats.urls_discovered += discovered_count;
                    stats.items_extracted += item_count;
                })
                .await?;
            env.orchestrator.on_task_finished(execution_id).await?;
        }
        TaskDisposition::Deferred { delay } => {
            env.dedup.release(execution_id, &task.url_hash).await?;
            env.queue
                .nack(task_id, "deferred", Some(delay))
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
        }
        TaskDisposition::Dlq { category } => {
            if let Some(lease) = &lease {
                lease.mark_discard();
            }
            env.dedup.mark_failed(execution_id, &task.url_hash).await?;
            env.queue
                .dlq(task_id, &category)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            env.recovery.forget_task(task_id);
            env.sink.flush().await;
            env.orchestrator
                .record_task_stats(execution_id, |stats| {
                    stats.tasks_dlq += 1;
                    stats.tasks_failed += 1;
                    stats.record_error(&category);
                })
                .await?;
            env.orchestrator.on_task_finished(execution_id).await?;
        }
        TaskDisposition::Failed { kind, message } => {
            if let Some(lease) = &lease {
                lease.mark_discard();
            }
            return Err(EngineError::new(kind, message));
        }
    }
    Ok(())
}

/// Task-level failure (navigation, infrastructure): route through the
/// recovery engine, then translate the directive to a queue disposition.
async fn handle_task_failure(env: &TaskEnv, task: &UrlTask, error: &EngineError) {
    let execution_id = task.execution_id;
    let task_id = task.task_id;
    let attempt = task.retry_count + 1;

    let fctx = failure_context(execution_id, task, "<task>", error, attempt);
    let directive = env.recovery.handle_failure(&fctx).await;
    debug!(%task_id, kind = error.kind.as_str(), ?directive, "task-level failure");

    let _ = env
        .orchestrator
        .record_task_stats(execution_id, |stats| {
            stats.record_error(error.kind.as_str());
            stats.recovery_actions += 1;
        })
        .await;

    match directive {
        RecoveryDirective::Retry(retry) => {
            let _ = env.dedup.release(execution_id, &task.url_hash).await;
            let _ = env
                .queue
                .nack(task_id, error.kind.as_str(), Some(retry.delay))
                .await;
        }
        RecoveryDirective::Defer { delay } => {
            let _ = env.dedup.release(execution_id, &task.url_hash).await;
            let _ = env.queue.nack(task_id, "domain_blocked", Some(delay)).await;
        }
        RecoveryDirective::Dlq { category } => {
            let _ = env
                .recovery
                .build_incident(&fctx, None, None, serde_json::json!({}), serde_json::json!({}))
                .await;
            let _ = env.dedup.mark_failed(execution_id, &task.url_hash).await;
            let _ = env.queue.dlq(task_id, &category).await;
            env.recovery.forget_task(task_id);
            let _ = env
                .orchestrator
                .record_task_stats(execution_id, |stats| {
                    stats.tasks_dlq += 1;
                    stats.tasks_failed += 1;
                })
                .await;
            let _ = env.orchestrator.on_task_finished(execution_id).await;
        }
        RecoveryDirective::Exhausted => {
            let _ = env
                .recovery
                .build_incident(&fctx, None, None, serde_json::json!({}), serde_json::json!({}))
                .await;
            let _ = env.dedup.mark_failed(execution_id, &task.url_hash).await;
            let _ = env
                .queue
                .dlq(task_id, error.kind.as_str())
                .await;
            env.recovery.forget_task(task_id);
            let _ = env
                .orchestrator
                .record_task_stats(execution_id, |stats| {
                    stats.tasks_dlq += 1;
                    stats.tasks_failed += 1;
                })
                .await;
            let _ = env.orchestrator.on_task_finished(execution_id).await;
        }
    }
}

/// Worker identity: `{hostname}-{pid}` unless overridden.
#[must_use]
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}
