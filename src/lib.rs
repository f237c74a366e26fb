pub mod browser;
pub mod canon;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod events;
pub mod model;
pub mod nodes;
pub mod phase;
pub mod proxy;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod worker;

pub use browser::{BrowserLease, BrowserPool, BrowserProfile, Fingerprint, PoolError};
pub use canon::{CanonicalUrl, canonicalize, hash_canonical};
pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use dedup::{DedupCache, MemoryDedupCache, UrlState};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::{EventKind, ExecutionEvent, ExecutionEventBus};
pub use model::{
    Execution, ExecutionStatus, ExtractedItem, Incident, NodeExecution, NodeSpec, Phase,
    RecoveryAction, RecoveryRule, UrlTask, Workflow, WorkflowConfig,
};
pub use nodes::{
    DiscoveredUrl, Interpreter, NodeExecutor, NodeOutput, NodeRegistry, PhaseOutcome,
    TaskDisposition,
};
pub use phase::PhaseOrchestrator;
pub use proxy::ProxyPool;
pub use queue::{EnqueueOutcome, MemoryTaskQueue, QueueError, SqliteTaskQueue, TaskQueue};
pub use recovery::{
    FailureContext, PatternAnalyzer, RecoveryDirective, RecoveryEngine, RuleEngine,
};
pub use scheduler::Scheduler;
pub use sink::{BatchSink, ItemRouter, SinkHandle, SinkRecord};
pub use store::MetadataStore;
pub use worker::{Worker, WorkerRuntime};
