//! Worker runtime assembly.
//!
//! Wires the whole stack for one worker process: store, queue, dedup cache,
//! browser pool, proxy pool, recovery engine, batch sink, event bus, phase
//! orchestrator, interpreter, the worker loop itself and the background
//! jobs (learning promoter, partition maintenance, proxy health, scheduler).
//! Process-wide state is limited to what is built here and torn down on
//! shutdown; everything else threads through explicit handles.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::BrowserPool;
use crate::config::EngineConfig;
use crate::dedup::{DedupCache, MemoryDedupCache};
use crate::error::EngineResult;
use crate::events::ExecutionEventBus;
use crate::nodes::{Interpreter, NodeRegistry};
use crate::phase::PhaseOrchestrator;
use crate::proxy::ProxyPool;
use crate::queue::{MemoryTaskQueue, SqliteTaskQueue, TaskQueue};
use crate::recovery::RecoveryEngine;
use crate::scheduler::Scheduler;
use crate::sink::{BatchSink, ItemRouter, SinkHandle};
use crate::store::MetadataStore;
use crate::worker::{Worker, default_worker_id};

/// Queue backend selection for the runtime.
pub enum QueueBackend {
    Memory,
    Sqlite(PathBuf),
}

pub struct WorkerRuntime {
    pub config: Arc<EngineConfig>,
    pub store: Arc<MetadataStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub dedup: Arc<dyn DedupCache>,
    pub events: Arc<ExecutionEventBus>,
    pub registry: Arc<NodeRegistry>,
    pub pool: Option<Arc<BrowserPool>>,
    pub proxies: Arc<ProxyPool>,
    pub recovery: Arc<RecoveryEngine>,
    pub orchestrator: Arc<PhaseOrchestrator>,
    pub interpreter: Arc<Interpreter>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
    sink: Option<BatchSink>,
    sink_handle: SinkHandle,
    background: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Build the full stack. `with_browser` is off for headless-less test
    /// deployments where node executors are registered mocks.
    pub async fn build(
        config: EngineConfig,
        queue_backend: QueueBackend,
        registry: NodeRegistry,
        with_browser: bool,
    ) -> EngineResult<Self> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let db_path = config.store.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("crawlflow")
                .join("engine.sqlite")
        });
        let store = Arc::new(MetadataStore::open(&db_path, config.store.clone()).await?);

        let queue: Arc<dyn TaskQueue> = match queue_backend {
            QueueBackend::Memory => Arc::new(MemoryTaskQueue::new(
                std::time::Duration::from_secs(config.queue.visibility_timeout_secs),
            )),
            QueueBackend::Sqlite(path) => Arc::new(
                SqliteTaskQueue::open(
                    &path,
                    std::time::Duration::from_secs(config.queue.visibility_timeout_secs),
                )
                .await
                .map_err(|e| crate::error::EngineError::internal(e.to_string()))?,
            ),
        };

        let dedup: Arc<dyn DedupCache> = Arc::new(MemoryDedupCache::new());
        let events = Arc::new(ExecutionEventBus::new(1024));
        let registry = Arc::new(registry);
        let router = Arc::new(ItemRouter::new());

        let pool = if with_browser {
            Some(BrowserPool::new(config.browser.clone()))
        } else {
            None
        };

        let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
        let recovery = Arc::new(RecoveryEngine::new(
            (*config).clone(),
            Arc::clone(&proxies),
            Some(Arc::clone(&store)),
        ));
        recovery.load_persisted().await?;

        let sink = BatchSink::spawn(config.sink.clone(), Arc::clone(&store), Arc::clone(&router));
        let sink_handle = sink.handle();

        let orchestrator = Arc::new(PhaseOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&dedup),
            Arc::clone(&events),
            Arc::clone(&registry),
            Arc::clone(&router),
            shutdown.clone(),
        ));

        let interpreter = Arc::new(Interpreter::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            sink_handle.clone(),
            Arc::clone(&recovery),
            pool.clone(),
            Arc::clone(&proxies),
            config.worker.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
        ));

        let mut background = Vec::new();
        background.push(Arc::clone(&recovery).spawn_promoter(shutdown.clone()));
        background.push(Arc::clone(&proxies).spawn_health_checker(shutdown.clone()));
        background.push(spawn_partition_maintenance(
            Arc::clone(&store),
            Arc::clone(&config),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            dedup,
            events,
            registry,
            pool,
            proxies,
            recovery,
            orchestrator,
            interpreter,
            scheduler,
            shutdown,
            sink: Some(sink),
            sink_handle,
            background,
        })
    }

    #[must_use]
    pub fn sink_handle(&self) -> SinkHandle {
        self.sink_handle.clone()
    }

    #[must_use]
    pub fn worker(&self) -> Worker {
        Worker::new(
            default_worker_id(),
            Arc::clone(&self.config),
            Arc::clone(&self.queue),
            Arc::clone(&self.dedup),
            Arc::clone(&self.store),
            self.pool.clone(),
            Arc::clone(&self.interpreter),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.recovery),
            self.sink_handle.clone(),
            self.shutdown.clone(),
        )
    }

    /// Run the worker loop and the scheduler until the shutdown token fires,
    /// then tear everything down in dependency order.
    pub async fn run(mut self) -> EngineResult<()> {
        let worker = self.worker();
        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_cancel = self.shutdown.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(scheduler_cancel).await;
        });

        worker.run().await;

        if let Err(e) = scheduler_task.await {
            if !e.is_cancelled() {
                warn!("scheduler task failed: {e}");
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Stop background jobs, flush the sink, close the browser pool.
    pub async fn teardown(&mut self) {
        info!("worker runtime shutting down");
        self.shutdown.cancel();
        for handle in self.background.drain(..) {
            handle.abort();
        }
        if let Some(sink) = self.sink.take() {
            sink.shutdown().await;
        }
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        info!("worker runtime shutdown complete");
    }
}

/// Daily job: materialize upcoming item partitions, drop expired ones.
fn spawn_partition_maintenance(
    store: Arc<MetadataStore>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(6 * 60 * 60);
        loop {
            if let Err(e) =
                crate::store::ensure_partitions(store.pool(), config.store.partition_ahead_days)
                    .await
            {
                warn!("partition creator failed: {e}");
            }
            match crate::store::drop_expired_partitions(
                store.pool(),
                config.store.item_retention_days,
            )
            .await
            {
                Ok(0) => {}
                Ok(dropped) => info!(dropped, "expired item partitions dropped"),
                Err(e) => warn!("partition cleaner failed: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
