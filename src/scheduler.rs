//! Cron-driven health-check scheduler.
//!
//! Fires registered schedules, creating executions with
//! `triggered_by=schedule`, and writes a health-check report when the
//! execution reaches a terminal state. Expressions use the `cron` crate's
//! seven-field form (seconds first). Misses while the worker was down are
//! not backfilled: each pass only looks at occurrences since the previous
//! pass.

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{ExecutionStatus, HealthCheckSchedule, TriggeredBy, WorkflowStatus};
use crate::nodes::NodeRegistry;
use crate::phase::PhaseOrchestrator;
use crate::store::MetadataStore;

const TICK: Duration = Duration::from_secs(30);
/// How long the report watcher waits for an execution to finish.
const REPORT_WAIT: Duration = Duration::from_secs(15 * 60);

pub struct Scheduler {
    store: Arc<MetadataStore>,
    orchestrator: Arc<PhaseOrchestrator>,
    registry: Arc<NodeRegistry>,
    /// Last evaluation instant per schedule; occurrences before it are
    /// considered missed and are skipped.
    last_checked: DashMap<Uuid, DateTime<Utc>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: Arc<MetadataStore>,
        orchestrator: Arc<PhaseOrchestrator>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            registry,
            last_checked: DashMap::new(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                warn!("scheduler tick failed: {e}");
            }
        }
        info!("scheduler stopped");
    }

    /// One evaluation pass; public for tests.
    pub async fn tick(&self, now: DateTime<Utc>) -> crate::error::EngineResult<()> {
        let schedules = self.store.list_schedules().await?;
        for schedule in schedules {
            let since = self
                .last_checked
                .insert(schedule.id, now)
                .unwrap_or(now - chrono::Duration::seconds(TICK.as_secs() as i64));
            if self.is_due(&schedule, since, now) {
                self.fire(&schedule).await;
            }
        }
        Ok(())
    }

    fn is_due(&self, schedule: &HealthCheckSchedule, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let parsed = match Schedule::from_str(&schedule.cron) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(schedule = %schedule.id, cron = schedule.cron, "invalid cron: {e}");
                return false;
            }
        };
        // Only the window since the last pass counts; earlier occurrences
        // are misses and stay missed.
        parsed
            .after(&since)
            .next()
            .is_some_and(|occurrence| occurrence <= now)
    }

    async fn fire(&self, schedule: &HealthCheckSchedule) {
        let workflow = match self.store.get_workflow(schedule.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                warn!(schedule = %schedule.id, "schedule references missing workflow");
                return;
            }
            Err(e) => {
                warn!("schedule workflow fetch failed: {e}");
                return;
            }
        };
        if workflow.status != WorkflowStatus::Active {
            debug!(workflow = %workflow.id, "skipping schedule for non-active workflow");
            return;
        }

        // Offline validation first: a broken node catalog is itself the
        // health finding.
        let validation: Result<(), String> = workflow
            .config
            .phases
            .iter()
            .try_for_each(|phase| {
                self.registry
                    .validate_phase(phase)
                    .map_err(|e| e.message)
            });

        info!(schedule = %schedule.id, workflow = %workflow.id, "health check fired");
        let execution = match self
            .orchestrator
            .create_execution(&workflow, TriggeredBy::Schedule)
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                warn!("health-check execution failed to start: {e}");
                let report = json!({
                    "workflow_id": workflow.id,
                    "validation": validation.err(),
                    "error": e.to_string(),
                });
                let _ = self
                    .store
                    .insert_health_report(schedule.id, None, &report)
                    .await;
                return;
            }
        };

        // Watch for the terminal state and write the report.
        let store = Arc::clone(&self.store);
        let schedule_id = schedule.id;
        let execution_id = execution.id;
        let workflow_id = workflow.id;
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + REPORT_WAIT;
            let final_execution = loop {
                match store.get_execution(execution_id).await {
                    Ok(Some(execution)) if execution.status.is_terminal() => {
                        break Some(execution);
                    }
                    Ok(_) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    _ => break None,
                }
            };

            let report = match &final_execution {
                Some(execution) => json!({
                    "workflow_id": workflow_id,
                    "execution_id": execution_id,
                    "status": execution.status,
                    "validation": validation.err(),
                    "stats": execution.stats,
                    "healthy": execution.status == ExecutionStatus::Completed,
                }),
                None => json!({
                    "workflow_id": workflow_id,
                    "execution_id": execution_id,
                    "validation": validation.err(),
                    "healthy": false,
                    "error": "health-check execution did not finish in time",
                }),
            };
            if let Err(e) = store
                .insert_health_report(schedule_id, Some(execution_id), &report)
                .await
            {
                warn!("health report write failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_due_window() {
        // Every minute at second 0.
        let schedule = HealthCheckSchedule {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            cron: "0 * * * * *".to_string(),
            notification_config: None,
            enabled: true,
        };
        let parsed = Schedule::from_str(&schedule.cron).unwrap();
        let since = Utc::now() - chrono::Duration::seconds(90);
        let next = parsed.after(&since).next().unwrap();
        assert!(next <= Utc::now());
    }
}
