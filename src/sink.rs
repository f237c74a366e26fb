//! Batch sink for extracted items and node-status updates.
//!
//! Absorbs write pressure in front of the metadata store: individual
//! submissions are buffered and flushed by size or interval, whichever comes
//! first. The buffer is bounded and callers block when it fills; records
//! are never dropped. A batch that exhausts its write retries is spilled to
//! durable local scratch as JSON lines and re-submitted on the next startup.
//!
//! Updates to the same node-execution record are coalesced to the newest
//! payload while keeping their first submission position, which preserves
//! per-execution causal order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dashmap::DashMap;
use rand::Rng;

use crate::config::SinkConfig;
use crate::error::EngineResult;
use crate::model::{ExtractedItem, NodeExecution, NodeExecutionUpdate, StorageTarget};
use crate::store::MetadataStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkRecord {
    Item(ExtractedItem),
    NodeOpen(NodeExecution),
    NodeUpdate(NodeExecutionUpdate),
}

enum Command {
    Record(SinkRecord),
    Flush(oneshot::Sender<()>),
}

/// Routes extracted items per execution storage target. Unregistered
/// executions default to the database.
#[derive(Default)]
pub struct ItemRouter {
    targets: DashMap<Uuid, StorageTarget>,
    http: once_cell::sync::OnceCell<reqwest::Client>,
}

impl ItemRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: Uuid, target: StorageTarget) {
        self.targets.insert(execution_id, target);
    }

    pub fn forget(&self, execution_id: Uuid) {
        self.targets.remove(&execution_id);
    }

    fn target(&self, execution_id: Uuid) -> StorageTarget {
        self.targets
            .get(&execution_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn http(&self) -> &reqwest::Client {
        self.http.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default()
        })
    }
}

/// Cloneable submission handle. Dropping every handle drains and stops the
/// writer.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Command>,
}

impl SinkHandle {
    /// Submit a record; blocks while the buffer is full.
    pub async fn submit(&self, record: SinkRecord) {
        if self.tx.send(Command::Record(record)).await.is_err() {
            error!("sink closed; record dropped at submit");
        }
    }

    /// Force a flush and wait for it to land.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub struct BatchSink {
    handle: SinkHandle,
    task: JoinHandle<()>,
}

impl BatchSink {
    pub fn spawn(
        config: SinkConfig,
        store: Arc<MetadataStore>,
        router: Arc<ItemRouter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let spill_dir = config
            .spill_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("crawlflow_spill"));
        let writer = Writer {
            config,
            store,
            router,
            spill_dir,
            items: Vec::new(),
            node_opens: Vec::new(),
            node_updates: Vec::new(),
            update_index: HashMap::new(),
        };
        let task = tokio::spawn(writer.run(rx));
        Self {
            handle: SinkHandle { tx },
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Drain everything and stop the writer.
    pub async fn shutdown(self) {
        self.handle.flush().await;
        drop(self.handle);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("sink writer task failed at shutdown: {e}");
            }
        }
    }
}

struct Writer {
    config: SinkConfig,
    store: Arc<MetadataStore>,
    router: Arc<ItemRouter>,
    spill_dir: PathBuf,
    items: Vec<ExtractedItem>,
    node_opens: Vec<NodeExecution>,
    node_updates: Vec<NodeExecutionUpdate>,
    /// node-execution id → position in `node_updates`, for coalescing.
    update_index: HashMap<Uuid, usize>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.recover_spill().await;

        let interval = Duration::from_millis(self.config.flush_interval_ms.max(10));
        loop {
            let command = tokio::time::timeout(interval, rx.recv()).await;
            match command {
                Ok(Some(Command::Record(record))) => {
                    self.buffer(record);
                    if self.buffered() >= self.config.batch_size {
                        self.flush_all().await;
                    }
                }
                Ok(Some(Command::Flush(done))) => {
                    self.flush_all().await;
                    let _ = done.send(());
                }
                Ok(None) => {
                    // All handles dropped: final drain.
                    self.flush_all().await;
                    debug!("sink writer exiting");
                    return;
                }
                Err(_) => {
                    // Interval elapsed without traffic.
                    if self.buffered() > 0 {
                        self.flush_all().await;
                    }
                }
            }
        }
    }

    fn buffer(&mut self, record: SinkRecord) {
        match record {
            SinkRecord::Item(item) => self.items.push(item),
            SinkRecord::NodeOpen(rec) => self.node_opens.push(rec),
            SinkRecord::NodeUpdate(update) => {
                if let Some(&pos) = self.update_index.get(&update.id) {
                    // Newest payload wins, position preserved.
                    self.node_updates[pos] = update;
                } else {
                    self.update_index.insert(update.id, self.node_updates.len());
                    self.node_updates.push(update);
                }
            }
        }
    }

    fn buffered(&self) -> usize {
        self.items.len() + self.node_opens.len() + self.node_updates.len()
    }

    async fn flush_all(&mut self) {
        let opens = std::mem::take(&mut self.node_opens);
        if !opens.is_empty() {
            let count = opens.len();
            if let Err(spilled) = self
                .write_with_retry("node_opens", || {
                    let store = Arc::clone(&self.store);
                    let opens = opens.clone();
                    async move { store.insert_node_executions(&opens).await }
                })
                .await
            {
                self.spill(opens.into_iter().map(SinkRecord::NodeOpen), &spilled);
            } else {
                debug!(count, "flushed node-execution opens");
            }
        }

        let updates = std::mem::take(&mut self.node_updates);
        self.update_index.clear();
        if !updates.is_empty() {
            let count = updates.len();
            if let Err(spilled) = self
                .write_with_retry("node_updates", || {
                    let store = Arc::clone(&self.store);
                    let updates = updates.clone();
                    async move { store.apply_node_updates(&updates).await }
                })
                .await
            {
                self.spill(updates.into_iter().map(SinkRecord::NodeUpdate), &spilled);
            } else {
                debug!(count, "flushed node-execution updates");
            }
        }

        let items = std::mem::take(&mut self.items);
        if !items.is_empty() {
            self.deliver_items(items).await;
        }
    }

    /// Deliver items per execution storage target.
    async fn deliver_items(&mut self, items: Vec<ExtractedItem>) {
        let mut by_execution: HashMap<Uuid, Vec<ExtractedItem>> = HashMap::new();
        for item in items {
            by_execution.entry(item.execution_id).or_default().push(item);
        }

        for (execution_id, batch) in by_execution {
            let target = self.router.target(execution_id);
            let result = match &target {
                StorageTarget::Database => {
                    self.write_with_retry("items", || {
                        let store = Arc::clone(&self.store);
                        let batch = batch.clone();
                        async move { store.insert_items(&batch).await }
                    })
                    .await
                }
                StorageTarget::File { dir } => {
                    let dir = PathBuf::from(dir);
                    self.write_with_retry("items_file", || {
                        let dir = dir.clone();
                        let batch = batch.clone();
                        async move { append_items_file(&dir, execution_id, &batch).await }
                    })
                    .await
                }
                StorageTarget::Webhook { endpoint } => {
                    let endpoint = endpoint.clone();
                    let http = self.router.http().clone();
                    self.write_with_retry("items_webhook", || {
                        let endpoint = endpoint.clone();
                        let http = http.clone();
                        let batch = batch.clone();
                        async move { post_items_webhook(&http, &endpoint, &batch).await }
                    })
                    .await
                }
            };
            if let Err(spilled) = result {
                self.spill(batch.into_iter().map(SinkRecord::Item), &spilled);
            }
        }
    }

    /// Retry a write with exponential backoff and jitter. On exhaustion the
    /// caller spills the batch.
    async fn write_with_retry<F, Fut>(&self, what: &str, mut op: F) -> Result<(), String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<()>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_write_retries {
                        error!("sink {what} write failed after {attempt} attempts: {e}");
                        return Err(e.to_string());
                    }
                    let base = 100u64.saturating_mul(1 << attempt.min(6));
                    let jitter = rand::rng().random_range(0..base / 2 + 1);
                    warn!("sink {what} write failed (attempt {attempt}): {e}; backing off");
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }

    /// Persist a failed batch to local scratch for later recovery.
    fn spill(&self, records: impl Iterator<Item = SinkRecord>, reason: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.spill_dir) {
            error!("cannot create spill dir: {e}; records lost");
            return;
        }
        let path = self
            .spill_dir
            .join(format!("spill_{}.jsonl", Uuid::new_v4()));
        let mut count = 0usize;
        let write = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            for record in records {
                let line = serde_json::to_string(&record)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writeln!(file, "{line}")?;
                count += 1;
            }
            file.sync_all()
        })();
        match write {
            Ok(()) => warn!(
                "spilled {count} records to {} after: {reason}",
                path.display()
            ),
            Err(e) => error!("spill write failed: {e}; records lost"),
        }
    }

    /// Re-buffer spilled batches from a previous run; each record appears in
    /// the store exactly once because inserts are keyed on stable ids.
    async fn recover_spill(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.spill_dir) else {
            return;
        };
        let mut recovered = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in content.lines() {
                match serde_json::from_str::<SinkRecord>(line) {
                    Ok(record) => {
                        self.buffer(record);
                        recovered += 1;
                    }
                    Err(e) => warn!("skipping malformed spill line: {e}"),
                }
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cannot remove recovered spill file {}: {e}", path.display());
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered spilled sink records");
            self.flush_all().await;
        }
    }
}

async fn append_items_file(
    dir: &PathBuf,
    execution_id: Uuid,
    items: &[ExtractedItem],
) -> EngineResult<()> {
    use crate::error::EngineError;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| EngineError::internal(format!("item file dir: {e}")))?;
    let path = dir.join(format!("{execution_id}.jsonl"));
    let mut lines = String::new();
    for item in items {
        lines.push_str(
            &serde_json::to_string(item).map_err(|e| EngineError::internal(e.to_string()))?,
        );
        lines.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| EngineError::internal(format!("item file open: {e}")))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, lines.as_bytes())
        .await
        .map_err(|e| EngineError::internal(format!("item file write: {e}")))?;
    Ok(())
}

async fn post_items_webhook(
    http: &reqwest::Client,
    endpoint: &str,
    items: &[ExtractedItem],
) -> EngineResult<()> {
    use crate::error::{EngineError, ErrorKind};
    let response = http
        .post(endpoint)
        .json(items)
        .send()
        .await
        .map_err(|e| EngineError::new(ErrorKind::ConnectionError, format!("webhook: {e}")))?;
    if !response.status().is_success() {
        return Err(EngineError::new(
            ErrorKind::ServerError,
            format!("webhook returned {}", response.status()),
        ));
    }
    Ok(())
}
