//! Execution event stream: per-execution fan-out, lossiness, closure.

use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crawlflow::events::{EventKind, ExecutionEvent, ExecutionEventBus, StreamError};
use crawlflow::model::ExecutionStatus;

#[tokio::test]
async fn publish_without_subscribers_is_best_effort() {
    let bus = ExecutionEventBus::new(16);
    let execution = Uuid::new_v4();

    // No subscribers: not an error, just counted as dropped.
    let delivered = bus.publish(ExecutionEvent::log(execution, "hello"));
    assert_eq!(delivered, 0);

    let snapshot = bus.metrics().snapshot();
    assert_eq!(snapshot.events_published, 1);
    assert_eq!(snapshot.events_dropped, 1);
}

#[tokio::test]
async fn subscribers_only_see_their_execution() {
    let bus = ExecutionEventBus::new(16);
    let exec_a = Uuid::new_v4();
    let exec_b = Uuid::new_v4();

    let mut sub_a = bus.subscribe(exec_a);
    let mut sub_b = bus.subscribe(exec_b);

    bus.publish(ExecutionEvent::log(exec_a, "for a"));
    bus.publish(ExecutionEvent::log(exec_b, "for b"));

    let event_a = timeout(Duration::from_millis(100), sub_a.recv())
        .await
        .expect("timeout")
        .expect("recv");
    assert_eq!(event_a.execution_id, exec_a);

    let event_b = timeout(Duration::from_millis(100), sub_b.recv())
        .await
        .expect("timeout")
        .expect("recv");
    assert_eq!(event_b.execution_id, exec_b);
}

#[tokio::test]
async fn node_lifecycle_events_carry_payload() {
    let bus = ExecutionEventBus::new(16);
    let execution = Uuid::new_v4();
    let node_execution = Uuid::new_v4();
    let mut sub = bus.subscribe(execution);

    bus.publish(ExecutionEvent::node_started(
        execution,
        node_execution,
        "p1",
        "n1",
        "navigate",
    ));
    bus.publish(ExecutionEvent::node_finished(
        execution,
        node_execution,
        "p1",
        "n1",
        "completed",
        42,
    ));

    let started = sub.recv().await.unwrap();
    assert_eq!(started.kind, EventKind::NodeStarted);
    assert_eq!(started.node_execution_id, Some(node_execution));
    assert_eq!(started.phase_id.as_deref(), Some("p1"));

    let finished = sub.recv().await.unwrap();
    assert_eq!(finished.kind, EventKind::NodeFinished);
    assert_eq!(finished.payload["status"], "completed");
    assert_eq!(finished.payload["duration_ms"], 42);
}

#[tokio::test]
async fn slow_subscriber_loses_oldest_events() {
    let bus = ExecutionEventBus::new(4);
    let execution = Uuid::new_v4();
    let mut sub = bus.subscribe(execution);

    // Overflow the subscriber's queue without draining it.
    for i in 0..20 {
        bus.publish(ExecutionEvent::log(execution, format!("event {i}")));
    }

    // First recv reports the gap, then delivery resumes from the oldest
    // retained event.
    match sub.recv().await {
        Err(StreamError::Lagged(lost)) => assert!(lost > 0),
        other => panic!("expected lag, got {other:?}"),
    }
    let next = sub.recv().await.unwrap();
    assert_eq!(next.kind, EventKind::Log);
    assert!(bus.metrics().snapshot().subscriber_lag_drops > 0);
}

#[tokio::test]
async fn removed_stream_closes_after_drain() {
    let bus = ExecutionEventBus::new(16);
    let execution = Uuid::new_v4();
    let mut sub = bus.subscribe(execution);

    bus.publish(ExecutionEvent::status_change(
        execution,
        ExecutionStatus::Completed,
        "p2",
    ));
    bus.remove(execution);

    // Buffered events drain first, then the stream reports closure.
    let last = sub.recv().await.unwrap();
    assert_eq!(last.kind, EventKind::StatusChange);
    assert!(matches!(sub.recv().await, Err(StreamError::Closed)));
}
