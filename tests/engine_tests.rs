//! End-to-end engine scenarios over the memory queue and mock executors:
//! the full lease → claim → interpret → enqueue → persist → ack loop.

mod common;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use common::{mock_registry, node, phase, two_phase_workflow, workflow_with_phases};
use crawlflow::config::EngineConfig;
use crawlflow::model::{ExecutionStatus, PhaseType, TransitionCondition, TriggeredBy, UrlFilter};
use crawlflow::worker::{QueueBackend, WorkerRuntime};
use serde_json::json;

async fn runtime() -> (tempfile::TempDir, WorkerRuntime) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.store.database_path = Some(dir.path().join("meta.sqlite"));
    config.worker.max_in_flight = 4;
    config.sink.flush_interval_ms = 50;
    let runtime = WorkerRuntime::build(config, QueueBackend::Memory, mock_registry(), false)
        .await
        .unwrap();
    (dir, runtime)
}

async fn await_terminal(
    runtime: &WorkerRuntime,
    execution_id: Uuid,
    within: Duration,
) -> ExecutionStatus {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let execution = runtime
            .store
            .get_execution(execution_id)
            .await
            .unwrap()
            .expect("execution exists");
        if execution.status.is_terminal() {
            return execution.status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution did not finish in time (status {:?})",
            execution.status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Happy path: one discovery phase finding three product links, one
/// extraction phase storing one item per product. 1 + 3 tasks complete.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_phase_crawl_completes() {
    let (_dir, runtime) = runtime().await;
    let worker = runtime.worker();
    let worker_task = tokio::spawn(async move { worker.run().await });

    let workflow = two_phase_workflow(2);
    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();

    let status = await_terminal(&runtime, execution.id, Duration::from_secs(15)).await;
    assert_eq!(status, ExecutionStatus::Completed);

    let finished = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.stats.tasks_completed, 4);
    assert_eq!(finished.stats.items_extracted, 3);
    assert_eq!(finished.stats.urls_discovered, 3);
    assert!(finished.completed_at.is_some());
    // Terminal: nothing leased, nothing pending.
    assert_eq!(runtime.queue.leased_count(execution.id).await.unwrap(), 0);
    assert_eq!(
        runtime.queue.pending_count(execution.id, None).await.unwrap(),
        0
    );
    // Phase index only increased.
    assert_eq!(finished.phase_index, 1);

    assert_eq!(runtime.store.count_items(execution.id).await.unwrap(), 3);

    runtime.shutdown.cancel();
    let _ = worker_task.await;
}

/// max_depth = 0 suppresses all discovery: the start URL completes and the
/// execution ends with no fan-out.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_depth_zero_suppresses_discovery() {
    let (_dir, runtime) = runtime().await;
    let worker = runtime.worker();
    let worker_task = tokio::spawn(async move { worker.run().await });

    let workflow = two_phase_workflow(0);
    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();

    let status = await_terminal(&runtime, execution.id, Duration::from_secs(15)).await;
    assert_eq!(status, ExecutionStatus::Completed);

    let finished = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.stats.tasks_completed, 1);
    assert_eq!(runtime.store.count_items(execution.id).await.unwrap(), 0);

    runtime.shutdown.cancel();
    let _ = worker_task.await;
}

/// A workflow whose only phase transitions on queue_empty and has zero
/// start URLs finishes immediately at creation.
#[tokio::test]
async fn zero_start_urls_completes_immediately() {
    let (_dir, runtime) = runtime().await;

    let mut workflow = workflow_with_phases(
        vec![phase(
            "p1",
            PhaseType::Processing,
            None,
            vec![node("n", "mock_extract", json!({"data": {"x": 1}}))],
            TransitionCondition::QueueEmpty,
            None,
        )],
        1,
    );
    workflow.config.start_urls.clear();

    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    runtime.shutdown.cancel();
}

/// A workflow with an unknown node type fails at intake: terminal Failed,
/// nothing enqueued.
#[tokio::test]
async fn validation_failure_fails_execution_without_tasks() {
    let (_dir, runtime) = runtime().await;

    let workflow = workflow_with_phases(
        vec![phase(
            "p1",
            PhaseType::Processing,
            None,
            vec![node("n", "does_not_exist", json!({}))],
            TransitionCondition::QueueEmpty,
            None,
        )],
        1,
    );

    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.completed_at.is_some());
    assert_eq!(
        runtime.queue.pending_count(execution.id, None).await.unwrap(),
        0
    );
    runtime.shutdown.cancel();
}

/// Pause stops lease issuance; resume drains the queue to completion.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_and_resume() {
    let (_dir, runtime) = runtime().await;

    let workflow = two_phase_workflow(2);
    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();

    // Paused before any worker exists: nothing will lease.
    runtime.orchestrator.pause(execution.id).await.unwrap();

    let worker = runtime.worker();
    let worker_task = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(Duration::from_millis(600)).await;

    let paused = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(runtime.queue.leased_count(execution.id).await.unwrap(), 0);
    assert!(
        runtime.queue.pending_count(execution.id, None).await.unwrap() > 0,
        "start URL still queued while paused"
    );

    runtime.orchestrator.resume(execution.id).await.unwrap();
    let status = await_terminal(&runtime, execution.id, Duration::from_secs(15)).await;
    assert_eq!(status, ExecutionStatus::Completed);

    runtime.shutdown.cancel();
    let _ = worker_task.await;
}

/// Stop reaches a terminal state, closes the queue and leaves no leases.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_terminates_execution() {
    let (_dir, runtime) = runtime().await;

    let workflow = two_phase_workflow(2);
    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();

    runtime.orchestrator.stop(execution.id).await.unwrap();

    let stopped = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    assert!(stopped.completed_at.is_some());
    assert_eq!(
        runtime.queue.pending_count(execution.id, None).await.unwrap(),
        0
    );
    assert_eq!(runtime.queue.leased_count(execution.id).await.unwrap(), 0);

    // Closed queue: late enqueues are rejected.
    let canonical = crawlflow::canon::CanonicalUrl::parse("https://ex.test/late").unwrap();
    let late = crawlflow::model::UrlTask::new(
        execution.id,
        &canonical,
        "p1",
        0,
        vec![],
        execution.snapshot_id,
    );
    assert!(runtime.queue.enqueue(late).await.is_err());
    runtime.shutdown.cancel();
}

/// Stop while a task is leased and mid-node: cancellation reaches the
/// running node, the lease is released, and only then does the execution
/// reach its terminal state. Terminal implies zero leased and zero pending.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_mid_flight_drains_leases() {
    let (_dir, runtime) = runtime().await;
    let worker = runtime.worker();
    let worker_task = tokio::spawn(async move { worker.run().await });

    // A single node that would run for 30s unless cancelled.
    let workflow = workflow_with_phases(
        vec![phase(
            "p1",
            PhaseType::Processing,
            None,
            vec![node("n", "mock_slow", json!({"ms": 30_000}))],
            TransitionCondition::QueueEmpty,
            None,
        )],
        1,
    );
    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();

    // Wait until the worker actually holds the lease and sits in the node.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if runtime.queue.leased_count(execution.id).await.unwrap() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task was never leased"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    runtime.orchestrator.stop(execution.id).await.unwrap();

    let stopped = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    assert!(stopped.completed_at.is_some());
    assert_eq!(runtime.queue.leased_count(execution.id).await.unwrap(), 0);
    assert_eq!(
        runtime.queue.pending_count(execution.id, None).await.unwrap(),
        0
    );

    runtime.shutdown.cancel();
    let _ = worker_task.await;
}

/// At most one node-execution root opens per claimed URL even when the
/// same URL is enqueued from two phases' worth of discovery.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_discovery_yields_single_processing() {
    let (_dir, runtime) = runtime().await;
    let worker = runtime.worker();
    let worker_task = tokio::spawn(async move { worker.run().await });

    // Discovery emits the same product URL three times.
    let discovery = phase(
        "p1",
        PhaseType::Discovery,
        Some(UrlFilter::Depth(0)),
        vec![node(
            "n1",
            "mock_links",
            json!({"links": [
                {"url": "https://ex.test/item/1", "marker": "product"},
                {"url": "https://ex.test/item/1?utm_source=x", "marker": "product"},
                {"url": "https://EX.test/item/1#top", "marker": "product"},
            ]}),
        )],
        TransitionCondition::AllNodesComplete,
        Some("p2"),
    );
    let extraction = phase(
        "p2",
        PhaseType::Extraction,
        Some(UrlFilter::Markers(vec!["product".to_string()])),
        vec![node("n1", "mock_extract", json!({"data": {"title": "one"}}))],
        TransitionCondition::QueueEmpty,
        None,
    );
    let workflow = workflow_with_phases(vec![discovery, extraction], 2);

    let execution = runtime
        .orchestrator
        .create_execution(&workflow, TriggeredBy::Api)
        .await
        .unwrap();
    let status = await_terminal(&runtime, execution.id, Duration::from_secs(15)).await;
    assert_eq!(status, ExecutionStatus::Completed);

    // 1 list page + 1 deduped product page.
    let finished = runtime
        .store
        .get_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.stats.tasks_completed, 2);
    assert_eq!(runtime.store.count_items(execution.id).await.unwrap(), 1);

    runtime.shutdown.cancel();
    let _ = worker_task.await;
}
