//! Interpreter behavior with mock executors (no browser).

mod common;

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{AlwaysFailNode, FlakyNode, mock_registry, node, phase};
use crawlflow::canon::CanonicalUrl;
use crawlflow::config::EngineConfig;
use crawlflow::context::ExecutionContext;
use crawlflow::error::ErrorKind;
use crawlflow::events::ExecutionEventBus;
use crawlflow::model::{PhaseType, TransitionCondition, UrlTask};
use crawlflow::nodes::{Interpreter, NodeRegistry, TaskDisposition};
use crawlflow::proxy::ProxyPool;
use crawlflow::recovery::RecoveryEngine;
use crawlflow::sink::{BatchSink, ItemRouter};
use crawlflow::store::MetadataStore;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MetadataStore>,
    interpreter: Interpreter,
    events: Arc<ExecutionEventBus>,
    sink: BatchSink,
}

async fn harness(registry: NodeRegistry) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        MetadataStore::open(&dir.path().join("meta.sqlite"), Default::default())
            .await
            .unwrap(),
    );
    let config = EngineConfig::default();
    let events = Arc::new(ExecutionEventBus::new(256));
    let router = Arc::new(ItemRouter::new());
    let sink = BatchSink::spawn(config.sink.clone(), store.clone(), router);
    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let recovery = Arc::new(RecoveryEngine::new(
        config.clone(),
        proxies.clone(),
        Some(store.clone()),
    ));
    let interpreter = Interpreter::new(
        Arc::new(registry),
        events.clone(),
        sink.handle(),
        recovery,
        None,
        proxies,
        config.worker.clone(),
    );
    Harness {
        _dir: dir,
        store,
        interpreter,
        events,
        sink,
    }
}

fn ctx_for(url: &str) -> ExecutionContext {
    let canonical = CanonicalUrl::parse(url).unwrap();
    let task = UrlTask::new(Uuid::new_v4(), &canonical, "p1", 0, vec![], Uuid::new_v4());
    ExecutionContext::new(
        task.execution_id,
        Uuid::new_v4(),
        task,
        None,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn discovery_and_extraction_flow_through_outcome() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/list");

    let test_phase = phase(
        "p1",
        PhaseType::Discovery,
        None,
        vec![
            node(
                "links",
                "mock_links",
                json!({"links": [
                    {"url": "https://ex.test/a", "marker": "product"},
                    {"url": "https://ex.test/b", "marker": "product"},
                ]}),
            ),
            node("extract", "mock_extract", json!({"data": {"title": "T"}})),
        ],
        TransitionCondition::QueueEmpty,
        None,
    );

    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    assert_eq!(outcome.disposition(), TaskDisposition::Completed);
    assert_eq!(outcome.discovered.len(), 2);
    assert_eq!(outcome.discovered[0].marker.as_deref(), Some("product"));
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.nodes_completed, 2);
    assert_eq!(ctx.get("title"), Some(&json!("T")));
    h.sink.shutdown().await;
}

#[tokio::test]
async fn node_records_form_a_task_rooted_tree() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/list");
    let execution_id = ctx.execution_id;

    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![
            node("first", "mock_extract", json!({"data": {"a": 1}})),
            node("second", "mock_extract", json!({"data": {"b": 2}})),
        ],
        TransitionCondition::QueueEmpty,
        None,
    );
    h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    h.sink.shutdown().await;

    // Two records; the first is the root, the second hangs off it, and all
    // are terminal.
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT node_id, parent_id, status FROM node_executions WHERE execution_id = ?",
    )
    .bind(execution_id.to_string())
    .fetch_all(h.store.pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    let roots: Vec<_> = rows
        .iter()
        .filter(|r| r.get::<Option<String>, _>("parent_id").is_none())
        .collect();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].get::<String, _>("node_id"), "first");
    assert!(
        rows.iter()
            .all(|r| r.get::<String, _>("status") == "completed")
    );
    assert!(h.store.all_nodes_terminal(execution_id).await.unwrap());
}

#[tokio::test]
async fn optional_node_failure_demotes_to_skipped() {
    let mut registry = mock_registry();
    registry.register(Arc::new(AlwaysFailNode {
        kind: ErrorKind::LayoutChanged,
    }));
    let h = harness(registry).await;
    let mut ctx = ctx_for("https://ex.test/x");

    let mut failing = node("broken", "mock_fail", json!({}));
    failing.optional = true;
    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![failing, node("after", "mock_extract", json!({"data": {"ok": true}}))],
        TransitionCondition::QueueEmpty,
        None,
    );

    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    // The failure does not affect the sibling.
    assert_eq!(outcome.disposition(), TaskDisposition::Completed);
    assert_eq!(outcome.nodes_skipped, 1);
    assert_eq!(outcome.nodes_completed, 1);
    h.sink.shutdown().await;
}

#[tokio::test]
async fn captcha_failure_dead_letters_the_task() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://cap.test/x");
    let execution_id = ctx.execution_id;

    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![node("blocked", "mock_fail", json!({}))],
        TransitionCondition::QueueEmpty,
        None,
    );

    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    assert_eq!(
        outcome.disposition(),
        TaskDisposition::Dlq {
            category: "captcha".to_string()
        }
    );
    // The builtin captcha rule fires on the first attempt; an incident is
    // recorded with the DLQ.
    assert_eq!(h.store.count_incidents(execution_id).await.unwrap(), 1);
    h.sink.shutdown().await;
}

#[tokio::test]
async fn flaky_node_recovers_within_budget() {
    let mut registry = mock_registry();
    // Fails twice with connection errors, then succeeds. The builtin
    // connection_error rule and default backoff keep it retrying.
    registry.register(Arc::new(FlakyNode::new(ErrorKind::ConnectionError, 2)));
    let h = harness(registry).await;
    let mut ctx = ctx_for("https://flaky.test/x");

    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![node("flaky", "mock_flaky", json!({}))],
        TransitionCondition::QueueEmpty,
        None,
    );

    let started = std::time::Instant::now();
    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    assert_eq!(outcome.disposition(), TaskDisposition::Completed);
    assert_eq!(ctx.local_attempts(), 2);
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
    h.sink.shutdown().await;
}

#[tokio::test]
async fn conditional_takes_context_branch() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/x");
    ctx.set("category", json!("tools"));

    let conditional = node(
        "branch",
        "conditional",
        json!({
            "predicate": {"type": "context_value_equals", "key": "category", "value": "tools"},
            "then": [{"id": "hit", "type": "mock_extract", "params": {"data": {"branch": "then"}}}],
            "else": [{"id": "miss", "type": "mock_extract", "params": {"data": {"branch": "else"}}}]
        }),
    );
    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![conditional],
        TransitionCondition::QueueEmpty,
        None,
    );

    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    assert_eq!(outcome.disposition(), TaskDisposition::Completed);
    assert_eq!(ctx.get("branch"), Some(&json!("then")));
    // Only the taken branch ran.
    assert_eq!(outcome.items.len(), 1);
    h.sink.shutdown().await;
}

#[tokio::test]
async fn sequence_runs_children_in_order() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/x");

    let mut sequence = node("seq", "sequence", json!({}));
    sequence.children = vec![
        node("one", "mock_extract", json!({"data": {"step": "one"}})),
        node("two", "mock_extract", json!({"data": {"step": "two"}})),
    ];
    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![sequence],
        TransitionCondition::QueueEmpty,
        None,
    );

    let outcome = h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();
    assert_eq!(outcome.disposition(), TaskDisposition::Completed);
    // The later child's write wins.
    assert_eq!(ctx.get("step"), Some(&json!("two")));
    assert_eq!(outcome.items.len(), 2);
    h.sink.shutdown().await;
}

#[tokio::test]
async fn cancellation_aborts_node_work() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/x");
    ctx.cancel.cancel();

    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![node("n", "mock_extract", json!({"data": {"x": 1}}))],
        TransitionCondition::QueueEmpty,
        None,
    );

    let error = h
        .interpreter
        .run_phase(&mut ctx, &test_phase)
        .await
        .unwrap_err();
    assert!(error.is_cancelled());
    h.sink.shutdown().await;
}

#[tokio::test]
async fn node_events_are_published() {
    let h = harness(mock_registry()).await;
    let mut ctx = ctx_for("https://ex.test/x");
    let mut sub = h.events.subscribe(ctx.execution_id);

    let test_phase = phase(
        "p1",
        PhaseType::Processing,
        None,
        vec![node("n", "mock_extract", json!({"data": {"x": 1}}))],
        TransitionCondition::QueueEmpty,
        None,
    );
    h.interpreter.run_phase(&mut ctx, &test_phase).await.unwrap();

    let started = sub.recv().await.unwrap();
    assert_eq!(started.kind, crawlflow::events::EventKind::NodeStarted);
    let finished = sub.recv().await.unwrap();
    assert_eq!(finished.kind, crawlflow::events::EventKind::NodeFinished);
    assert_eq!(finished.payload["status"], "completed");
    h.sink.shutdown().await;
}
