//! Memory queue backend behavior: coalescing, visibility, fairness.

use std::time::Duration;
use uuid::Uuid;

use crawlflow::canon::CanonicalUrl;
use crawlflow::model::UrlTask;
use crawlflow::queue::{EnqueueOutcome, MemoryTaskQueue, QueueError, TaskQueue};

fn task(execution_id: Uuid, url: &str, phase: &str) -> UrlTask {
    let canonical = CanonicalUrl::parse(url).unwrap();
    UrlTask::new(execution_id, &canonical, phase, 0, vec![], Uuid::new_v4())
}

async fn ready_queue(visibility: Duration) -> (MemoryTaskQueue, Uuid) {
    let queue = MemoryTaskQueue::new(visibility);
    let execution = Uuid::new_v4();
    queue.set_active_phase(execution, "p1").await.unwrap();
    (queue, execution)
}

#[tokio::test]
async fn enqueue_coalesces_duplicate_hashes() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;

    let first = task(execution, "https://ex.test/a", "p1");
    assert_eq!(
        queue.enqueue(first).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
    // Same resource, differently written: canonicalization collapses it.
    let twin = task(execution, "https://EX.test/a#frag", "p1");
    assert_eq!(
        queue.enqueue(twin).await.unwrap(),
        EnqueueOutcome::Coalesced
    );

    assert_eq!(queue.pending_count(execution, None).await.unwrap(), 1);
    assert_eq!(queue.stats().coalesced, 1);
}

#[tokio::test]
async fn lease_ack_lifecycle() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    let leased = queue.lease("w1", 8).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(queue.pending_count(execution, None).await.unwrap(), 0);
    assert_eq!(queue.leased_count(execution).await.unwrap(), 1);

    queue.ack(leased[0].task_id).await.unwrap();
    assert_eq!(queue.leased_count(execution).await.unwrap(), 0);

    // Double ack is a caller bug, reported as NotLeased.
    assert!(matches!(
        queue.ack(leased[0].task_id).await,
        Err(QueueError::NotLeased(_))
    ));
}

#[tokio::test]
async fn expired_lease_is_redelivered_with_bumped_retry() {
    let (queue, execution) = ready_queue(Duration::from_millis(50)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    let first = queue.lease("w1", 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].retry_count, 0);

    // Simulated worker crash: no ack, deadline lapses.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = queue.lease("w2", 1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].task_id, first[0].task_id);
    assert_eq!(second[0].retry_count, 1);
    assert_eq!(queue.stats().expired_redeliveries, 1);
}

#[tokio::test]
async fn extend_keeps_lease_alive() {
    let (queue, execution) = ready_queue(Duration::from_millis(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    let leased = queue.lease("w1", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    queue
        .extend(leased[0].task_id, Duration::from_secs(60))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Original deadline passed, but the extension holds the lease.
    assert!(queue.lease("w2", 1).await.unwrap().is_empty());
    assert_eq!(queue.leased_count(execution).await.unwrap(), 1);
}

#[tokio::test]
async fn nack_with_delay_hides_task_until_due() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    let leased = queue.lease("w1", 1).await.unwrap();
    queue
        .nack(
            leased[0].task_id,
            "rate_limited",
            Some(Duration::from_millis(80)),
        )
        .await
        .unwrap();

    assert!(queue.lease("w1", 1).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let redelivered = queue.lease("w1", 1).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].retry_count, 1);
}

#[tokio::test]
async fn dlq_retires_the_task() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    let leased = queue.lease("w1", 1).await.unwrap();
    queue.dlq(leased[0].task_id, "captcha").await.unwrap();

    assert_eq!(queue.dlq_count(execution).await.unwrap(), 1);
    assert_eq!(queue.pending_count(execution, None).await.unwrap(), 0);
    assert_eq!(queue.leased_count(execution).await.unwrap(), 0);
    assert!(queue.lease("w1", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn round_robin_across_executions() {
    let queue = MemoryTaskQueue::new(Duration::from_secs(60));
    let big = Uuid::new_v4();
    let small = Uuid::new_v4();
    queue.set_active_phase(big, "p1").await.unwrap();
    queue.set_active_phase(small, "p1").await.unwrap();

    for i in 0..10 {
        queue
            .enqueue(task(big, &format!("https://big.test/{i}"), "p1"))
            .await
            .unwrap();
    }
    queue
        .enqueue(task(small, "https://small.test/only", "p1"))
        .await
        .unwrap();

    // A batch of 4 must include the small execution's task: one large
    // execution cannot starve the others.
    let leased = queue.lease("w1", 4).await.unwrap();
    assert_eq!(leased.len(), 4);
    assert!(leased.iter().any(|t| t.execution_id == small));
}

#[tokio::test]
async fn paused_execution_leases_nothing() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();

    queue.set_paused(execution, true).await.unwrap();
    assert!(queue.lease("w1", 8).await.unwrap().is_empty());

    queue.set_paused(execution, false).await.unwrap();
    assert_eq!(queue.lease("w1", 8).await.unwrap().len(), 1);
}

#[tokio::test]
async fn inactive_phase_tasks_are_not_leasable() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();
    queue
        .enqueue(task(execution, "https://ex.test/b", "p2"))
        .await
        .unwrap();

    // Only p1 is active: the p2 task stays queued.
    let leased = queue.lease("w1", 8).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].phase_id, "p1");

    queue.set_active_phase(execution, "p2").await.unwrap();
    let leased = queue.lease("w1", 8).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].phase_id, "p2");
}

#[tokio::test]
async fn closed_queue_rejects_enqueue() {
    let (queue, execution) = ready_queue(Duration::from_secs(60)).await;
    queue
        .enqueue(task(execution, "https://ex.test/a", "p1"))
        .await
        .unwrap();
    queue.close(execution).await.unwrap();

    assert!(matches!(
        queue.enqueue(task(execution, "https://ex.test/b", "p1")).await,
        Err(QueueError::Closed(_))
    ));
    assert_eq!(queue.pending_count(execution, None).await.unwrap(), 0);
}
