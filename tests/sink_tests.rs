//! Batch sink: round-trip, coalescing, delivery targets, spill recovery.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crawlflow::config::SinkConfig;
use crawlflow::model::{
    ExtractedItem, NodeExecution, NodeExecutionUpdate, NodeRunStatus, StorageTarget,
};
use crawlflow::sink::{BatchSink, ItemRouter, SinkRecord};
use crawlflow::store::MetadataStore;

async fn store_in(dir: &tempfile::TempDir) -> Arc<MetadataStore> {
    Arc::new(
        MetadataStore::open(&dir.path().join("meta.sqlite"), Default::default())
            .await
            .unwrap(),
    )
}

fn item(execution_id: Uuid, url: &str) -> ExtractedItem {
    ExtractedItem::new(
        execution_id,
        Uuid::new_v4(),
        Uuid::new_v4(),
        url,
        json!({"title": "Widget"}),
    )
}

fn sink_config(dir: &tempfile::TempDir) -> SinkConfig {
    SinkConfig {
        batch_size: 4,
        flush_interval_ms: 50,
        buffer_capacity: 64,
        spill_dir: Some(dir.path().join("spill")),
        max_write_retries: 1,
    }
}

#[tokio::test]
async fn items_round_trip_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let router = Arc::new(ItemRouter::new());
    let sink = BatchSink::spawn(sink_config(&dir), store.clone(), router);

    let execution_id = Uuid::new_v4();
    let handle = sink.handle();
    for i in 0..10 {
        handle
            .submit(SinkRecord::Item(item(
                execution_id,
                &format!("https://ex.test/{i}"),
            )))
            .await;
    }
    sink.shutdown().await;

    assert_eq!(store.count_items(execution_id).await.unwrap(), 10);
}

#[tokio::test]
async fn node_updates_coalesce_to_newest() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let router = Arc::new(ItemRouter::new());
    let sink = BatchSink::spawn(
        SinkConfig {
            // Large batch so nothing flushes until shutdown; the running →
            // completed updates for one record must collapse.
            batch_size: 1000,
            flush_interval_ms: 10_000,
            ..sink_config(&dir)
        },
        store.clone(),
        router,
    );
    let handle = sink.handle();

    let mut record = NodeExecution::open(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "n1",
        "mock_extract",
        None,
        json!({}),
    );
    handle.submit(SinkRecord::NodeOpen(record.clone())).await;
    // Intermediate retry update, then the terminal one.
    record.retry_count = 1;
    handle
        .submit(SinkRecord::NodeUpdate(NodeExecutionUpdate::from(&record)))
        .await;
    record.close(NodeRunStatus::Completed);
    handle
        .submit(SinkRecord::NodeUpdate(NodeExecutionUpdate::from(&record)))
        .await;
    sink.shutdown().await;

    use sqlx::Row;
    let row = sqlx::query("SELECT status, retry_count FROM node_executions WHERE id = ?")
        .bind(record.id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "completed");
    assert_eq!(row.get::<i64, _>("retry_count"), 1);
}

#[tokio::test]
async fn file_target_appends_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let out_dir = dir.path().join("out");
    let router = Arc::new(ItemRouter::new());
    let execution_id = Uuid::new_v4();
    router.register(
        execution_id,
        StorageTarget::File {
            dir: out_dir.to_string_lossy().to_string(),
        },
    );

    let sink = BatchSink::spawn(sink_config(&dir), store.clone(), router);
    let handle = sink.handle();
    for i in 0..3 {
        handle
            .submit(SinkRecord::Item(item(
                execution_id,
                &format!("https://ex.test/{i}"),
            )))
            .await;
    }
    sink.shutdown().await;

    let content =
        std::fs::read_to_string(out_dir.join(format!("{execution_id}.jsonl"))).unwrap();
    assert_eq!(content.lines().count(), 3);
    // File delivery bypasses the database partitions.
    assert_eq!(store.count_items(execution_id).await.unwrap(), 0);
}

#[tokio::test]
async fn webhook_target_posts_batches() {
    let mut server = mockito::Server::new_async().await;
    let hook = server
        .mock("POST", "/ingest")
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let router = Arc::new(ItemRouter::new());
    let execution_id = Uuid::new_v4();
    router.register(
        execution_id,
        StorageTarget::Webhook {
            endpoint: format!("{}/ingest", server.url()),
        },
    );

    let sink = BatchSink::spawn(sink_config(&dir), store.clone(), router);
    let handle = sink.handle();
    for i in 0..5 {
        handle
            .submit(SinkRecord::Item(item(
                execution_id,
                &format!("https://ex.test/{i}"),
            )))
            .await;
    }
    sink.shutdown().await;
    hook.assert_async().await;
}

/// Spill files from a previous (crashed) run are re-submitted on startup
/// and land exactly once.
#[tokio::test]
async fn spill_recovery_preserves_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let spill_dir = dir.path().join("spill");
    std::fs::create_dir_all(&spill_dir).unwrap();

    let execution_id = Uuid::new_v4();
    let spilled = [
        item(execution_id, "https://ex.test/spilled/1"),
        item(execution_id, "https://ex.test/spilled/2"),
    ];
    let lines: Vec<String> = spilled
        .iter()
        .map(|i| serde_json::to_string(&SinkRecord::Item(i.clone())).unwrap())
        .collect();
    std::fs::write(spill_dir.join("spill_prev.jsonl"), lines.join("\n")).unwrap();

    let router = Arc::new(ItemRouter::new());
    let sink = BatchSink::spawn(sink_config(&dir), store.clone(), router);
    // Give the writer a moment to run recovery, then drain.
    tokio::time::sleep(Duration::from_millis(200)).await;
    sink.shutdown().await;

    assert_eq!(store.count_items(execution_id).await.unwrap(), 2);
    // Recovered files are removed; nothing replays on the next start.
    assert_eq!(
        std::fs::read_dir(&spill_dir).unwrap().count(),
        0,
        "spill dir should be empty after recovery"
    );
}

#[tokio::test]
async fn interval_flush_without_pressure() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir).await;
    let router = Arc::new(ItemRouter::new());
    let sink = BatchSink::spawn(
        SinkConfig {
            batch_size: 1000, // never reached
            flush_interval_ms: 50,
            ..sink_config(&dir)
        },
        store.clone(),
        router,
    );

    let execution_id = Uuid::new_v4();
    sink.handle()
        .submit(SinkRecord::Item(item(execution_id, "https://ex.test/1")))
        .await;

    // The interval, not the batch size, drives this flush.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.count_items(execution_id).await.unwrap(), 1);
    sink.shutdown().await;
}
