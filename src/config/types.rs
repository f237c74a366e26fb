//! Engine configuration types.
//!
//! The nested sections mirror the operator-facing key namespaces
//! (`recovery.*`, `ai.*`, `learning.*`, `proxy.*`, `domain.*`) plus the
//! per-worker tuning knobs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub browser: BrowserPoolConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub sink: SinkConfig,
    pub recovery: RecoveryConfig,
    pub ai: AiConfig,
    pub learning: LearningConfig,
    pub proxy: ProxyConfig,
    pub domain: DomainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Target number of tasks in flight per worker (`W`).
    pub max_in_flight: usize,
    /// Hard ceiling for a single task, seconds.
    pub task_deadline_secs: u64,
    /// Default per-node timeout, milliseconds.
    pub node_timeout_ms: u64,
    /// Navigation timeout, milliseconds.
    pub navigation_timeout_ms: u64,
    /// How long graceful shutdown waits for in-flight tasks (`T`), seconds.
    pub drain_timeout_secs: u64,
    /// Fan-out bound inside an explicit `parallel` node.
    pub parallel_node_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: num_cpus::get().max(2),
            task_deadline_secs: 300,
            node_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
            drain_timeout_secs: 30,
            parallel_node_limit: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserPoolConfig {
    /// Bounded pool size per worker (`P`).
    pub pool_size: usize,
    /// Contexts are torn down after this many task leases (`R`).
    pub max_context_uses: u32,
    /// How long `acquire` waits before reporting contention, seconds.
    pub acquire_timeout_secs: u64,
    pub headless: bool,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_context_uses: 50,
            acquire_timeout_secs: 30,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease visibility timeout, seconds. A leased task re-becomes visible
    /// after this elapses without ack/extend.
    pub visibility_timeout_secs: u64,
    /// Maximum tasks handed out per lease call.
    pub lease_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 120,
            lease_batch: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. `None` selects `{data_dir}/crawlflow/engine.sqlite`.
    pub database_path: Option<PathBuf>,
    /// Daily item partitions older than this are dropped.
    pub item_retention_days: u32,
    /// Partitions pre-created ahead of today.
    pub partition_ahead_days: u32,
    /// Workflow snapshot read-cache TTL, seconds.
    pub snapshot_cache_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            item_retention_days: 7,
            partition_ahead_days: 7,
            snapshot_cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Flush when a batch reaches this many records (`B`).
    pub batch_size: usize,
    /// Flush at least this often, milliseconds.
    pub flush_interval_ms: u64,
    /// Bounded in-memory buffer; a full buffer blocks submitters.
    pub buffer_capacity: usize,
    /// Spill directory for batches that exhaust their write retries.
    /// `None` selects a temp-dir scratch space.
    pub spill_dir: Option<PathBuf>,
    /// Write retries before spilling.
    pub max_write_retries: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval_ms: 500,
            buffer_capacity: 4096,
            spill_dir: None,
            max_write_retries: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub window_size: usize,
    pub error_rate_threshold: f64,
    pub consecutive_threshold: u32,
    /// Total recovery attempts per task before an incident is opened.
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            error_rate_threshold: 0.10,
            consecutive_threshold: 3,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    /// Request timeout, seconds.
    pub timeout: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: String::new(),
            model: String::new(),
            endpoint: String::new(),
            timeout: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Successes required before a learned action becomes a rule.
    pub promotion_threshold: u64,
    /// Minimum success ratio for promotion.
    pub min_success_rate: f64,
    /// Learned actions idle longer than this are discarded.
    pub cleanup_days: u32,
    /// Promoter pass interval, seconds.
    pub promoter_interval_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            promotion_threshold: 3,
            min_success_rate: 0.7,
            cleanup_days: 14,
            promoter_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyRotationStrategy {
    RoundRobin,
    Random,
    LeastFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub endpoints: Vec<String>,
    pub rotation_strategy: ProxyRotationStrategy,
    /// Seconds between proxy health sweeps.
    pub health_check_interval: u64,
    pub max_failures_before_disable: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: Vec::new(),
            rotation_strategy: ProxyRotationStrategy::RoundRobin,
            health_check_interval: 60,
            max_failures_before_disable: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Base block applied by `skip_domain`, seconds. Doubles per repeat.
    pub block_duration_base: u64,
    pub consecutive_fails_to_block: u32,
    pub max_block_duration: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            block_duration_base: 300,
            consecutive_fails_to_block: 5,
            max_block_duration: 3600,
        }
    }
}
