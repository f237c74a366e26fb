//! Per-execution phase state machine.
//!
//! Owns execution lifecycle: intake validation, workflow snapshotting, start
//! URL seeding, transition evaluation after every task completion, and the
//! pause/resume/stop controls. Transition strictness: both `queue_empty` and
//! `all_nodes_complete` require the phase queue drained AND no outstanding
//! leases; `all_nodes_complete` additionally requires every node-execution
//! record of the execution to be terminal.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::canon::CanonicalUrl;
use crate::dedup::DedupCache;
use crate::error::{EngineError, EngineResult};
use crate::events::{ExecutionEvent, ExecutionEventBus};
use crate::model::{
    Execution, ExecutionStats, ExecutionStatus, TransitionCondition, TriggeredBy, UrlTask,
    Workflow,
};
use crate::nodes::NodeRegistry;
use crate::queue::TaskQueue;
use crate::sink::ItemRouter;
use crate::store::MetadataStore;

/// How long `finish` waits for outstanding leases to release before
/// stamping the terminal status anyway.
const FINISH_DRAIN: std::time::Duration = std::time::Duration::from_secs(30);

/// Live per-execution control state shared with workers.
pub struct ExecutionControl {
    pub cancel: CancellationToken,
}

pub struct PhaseOrchestrator {
    store: Arc<MetadataStore>,
    queue: Arc<dyn TaskQueue>,
    dedup: Arc<dyn DedupCache>,
    events: Arc<ExecutionEventBus>,
    registry: Arc<NodeRegistry>,
    router: Arc<ItemRouter>,
    controls: DashMap<Uuid, Arc<ExecutionControl>>,
    /// Serializes stat read-modify-writes and transition evaluation per
    /// execution; concurrent task completions must not race each other.
    execution_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    root_cancel: CancellationToken,
}

impl PhaseOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<MetadataStore>,
        queue: Arc<dyn TaskQueue>,
        dedup: Arc<dyn DedupCache>,
        events: Arc<ExecutionEventBus>,
        registry: Arc<NodeRegistry>,
        router: Arc<ItemRouter>,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            dedup,
            events,
            registry,
            router,
            controls: DashMap::new(),
            execution_locks: DashMap::new(),
            root_cancel,
        }
    }

    fn lock_for(&self, execution_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.execution_locks
            .entry(execution_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Cancellation token for one execution; workers derive per-task tokens
    /// from it.
    #[must_use]
    pub fn control(&self, execution_id: Uuid) -> Arc<ExecutionControl> {
        self.controls
            .entry(execution_id)
            .or_insert_with(|| {
                Arc::new(ExecutionControl {
                    cancel: self.root_cancel.child_token(),
                })
            })
            .clone()
    }

    /// Create an execution from a workflow: snapshot the config, validate
    /// the node catalog, seed start URLs into phase 0.
    ///
    /// Validation errors fail the execution immediately; zero tasks are
    /// enqueued.
    pub async fn create_execution(
        &self,
        workflow: &Workflow,
        triggered_by: TriggeredBy,
    ) -> EngineResult<Execution> {
        let snapshot_id = self.store.create_snapshot(workflow).await?;
        let config = workflow.config.clone();
        let first_phase = config
            .phases
            .first()
            .map(|p| p.id.clone())
            .unwrap_or_default();

        let mut execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_snapshot: config.clone(),
            snapshot_id,
            status: ExecutionStatus::Running,
            current_phase: first_phase.clone(),
            phase_index: 0,
            started_at: Utc::now(),
            completed_at: None,
            stats: ExecutionStats::default(),
            phase_stats: HashMap::new(),
            triggered_by,
        };

        // Intake validation: structure plus node catalog against the
        // registry. A failed intake becomes a terminal Failed execution
        // with nothing enqueued.
        let validation = config.validate().and_then(|()| {
            config
                .phases
                .iter()
                .try_for_each(|phase| self.registry.validate_phase(phase))
        });
        if let Err(error) = validation {
            warn!(workflow = %workflow.id, "workflow validation failed: {error}");
            execution.finish(ExecutionStatus::Failed);
            execution.stats.record_error(error.kind.as_str());
            self.store.create_execution(&execution).await?;
            self.store
                .finish_execution(
                    execution.id,
                    ExecutionStatus::Failed,
                    execution.completed_at.unwrap_or_else(Utc::now),
                    &execution.stats,
                )
                .await?;
            return Ok(execution);
        }

        self.store.create_execution(&execution).await?;
        self.router.register(execution.id, config.storage.clone());
        self.queue
            .set_active_phase(execution.id, &first_phase)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;

        let mut seeded = 0usize;
        for raw in &config.start_urls {
            match CanonicalUrl::parse(raw) {
                Ok(canonical) => {
                    let task =
                        UrlTask::new(execution.id, &canonical, &first_phase, 0, vec![], snapshot_id);
                    if let Err(e) = self.queue.enqueue(task).await {
                        warn!("failed to enqueue start URL {raw}: {e}");
                    } else {
                        seeded += 1;
                    }
                }
                Err(e) => warn!("skipping invalid start URL {raw}: {e}"),
            }
        }
        info!(execution = %execution.id, seeded, "execution created");
        self.events.publish(ExecutionEvent::status_change(
            execution.id,
            ExecutionStatus::Running,
            &first_phase,
        ));

        // A workflow with zero (valid) start URLs finishes immediately.
        self.evaluate_transition(execution.id).await?;
        self.store
            .get_execution(execution.id)
            .await?
            .ok_or_else(|| EngineError::internal("execution vanished after create"))
    }

    /// Called by workers after every task completion.
    pub async fn on_task_finished(&self, execution_id: Uuid) -> EngineResult<()> {
        self.evaluate_transition(execution_id).await
    }

    /// Evaluate the active phase's transition; advance (possibly cascading
    /// through empty phases) or finish the execution.
    async fn evaluate_transition(&self, execution_id: Uuid) -> EngineResult<()> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;
        loop {
            let Some(execution) = self.store.get_execution(execution_id).await? else {
                return Ok(());
            };
            if execution.status != ExecutionStatus::Running {
                return Ok(());
            }
            let config = &execution.workflow_snapshot;
            let Some(phase) = config.phase(&execution.current_phase) else {
                return Ok(());
            };

            let pending = self
                .queue
                .pending_count(execution_id, Some(&phase.id))
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            let leased = self
                .queue
                .leased_count(execution_id)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            let drained = pending == 0 && leased == 0;

            let fire = match phase.transition.condition {
                TransitionCondition::QueueEmpty => drained,
                TransitionCondition::AllNodesComplete => {
                    drained && self.store.all_nodes_terminal(execution_id).await?
                }
                // No custom hook registered: strict drain check.
                TransitionCondition::Custom => drained,
            };
            if !fire {
                return Ok(());
            }

            match &phase.transition.next_phase {
                Some(next) => {
                    let next_index = config.phase_index(next).ok_or_else(|| {
                        EngineError::internal(format!("transition to unknown phase {next}"))
                    })?;
                    debug_assert!(next_index > execution.phase_index);
                    info!(
                        execution = %execution_id,
                        from = phase.id,
                        to = next.as_str(),
                        "phase transition"
                    );
                    self.store
                        .update_execution_phase(execution_id, next, next_index)
                        .await?;
                    // Queued URLs whose markers matched the next phase's
                    // filter were labeled for it at enqueue time; activating
                    // the phase makes them leasable.
                    self.queue
                        .set_active_phase(execution_id, next)
                        .await
                        .map_err(|e| EngineError::internal(e.to_string()))?;
                    self.events.publish(ExecutionEvent::status_change(
                        execution_id,
                        ExecutionStatus::Running,
                        next,
                    ));
                    // Loop: the next phase may already be satisfied (empty).
                }
                None => {
                    return self.finish(execution, ExecutionStatus::Completed).await;
                }
            }
        }
    }

    pub async fn pause(&self, execution_id: Uuid) -> EngineResult<()> {
        info!(execution = %execution_id, "pausing execution");
        self.queue
            .set_paused(execution_id, true)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Paused)
            .await?;
        if let Some(execution) = self.store.get_execution(execution_id).await? {
            self.events.publish(ExecutionEvent::status_change(
                execution_id,
                ExecutionStatus::Paused,
                &execution.current_phase,
            ));
        }
        Ok(())
    }

    pub async fn resume(&self, execution_id: Uuid) -> EngineResult<()> {
        info!(execution = %execution_id, "resuming execution");
        self.queue
            .set_paused(execution_id, false)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Running)
            .await?;
        if let Some(execution) = self.store.get_execution(execution_id).await? {
            self.events.publish(ExecutionEvent::status_change(
                execution_id,
                ExecutionStatus::Running,
                &execution.current_phase,
            ));
        }
        // The queue may have drained while paused.
        self.evaluate_transition(execution_id).await
    }

    /// Stop: cancel outstanding work, close the queue, reach terminal state.
    /// Dedup cache entries are left to their TTLs.
    pub async fn stop(&self, execution_id: Uuid) -> EngineResult<()> {
        info!(execution = %execution_id, "stopping execution");
        if let Some(control) = self.controls.get(&execution_id) {
            control.cancel.cancel();
        }
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        if execution.status.is_terminal() {
            return Ok(());
        }
        self.finish(execution, ExecutionStatus::Stopped).await
    }

    async fn finish(&self, execution: Execution, status: ExecutionStatus) -> EngineResult<()> {
        let execution_id = execution.id;
        self.queue
            .close(execution_id)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;

        // Terminal status implies no outstanding leases. Cancellation has
        // already been signalled on the stop path; wait for in-flight tasks
        // to release their leases, bounded like the worker's own drain.
        let drain_deadline = tokio::time::Instant::now() + FINISH_DRAIN;
        loop {
            let leased = self
                .queue
                .leased_count(execution_id)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            if leased == 0 {
                break;
            }
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(
                    execution = %execution_id,
                    leased,
                    "finish drain timed out with leases outstanding"
                );
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        self.store
            .finish_execution(execution_id, status, Utc::now(), &execution.stats)
            .await?;
        self.router.forget(execution_id);
        self.events.publish(ExecutionEvent::status_change(
            execution_id,
            status,
            &execution.current_phase,
        ));
        info!(execution = %execution_id, ?status, "execution finished");
        // Subscribers drain buffered events, then observe the stream close.
        self.events.remove(execution_id);
        self.controls.remove(&execution_id);
        self.execution_locks.remove(&execution_id);
        let _ = self.dedup.clear_execution(execution_id).await;
        Ok(())
    }

    /// Fold a completed task's deltas into the execution stats.
    pub async fn record_task_stats(
        &self,
        execution_id: Uuid,
        apply: impl FnOnce(&mut ExecutionStats),
    ) -> EngineResult<()> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;
        if let Some(mut execution) = self.store.get_execution(execution_id).await? {
            apply(&mut execution.stats);
            self.store
                .update_execution_stats(execution_id, &execution.stats)
                .await?;
        }
        Ok(())
    }
}
