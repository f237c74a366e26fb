//! Engine configuration loading and validation.

mod types;

pub use types::{
    AiConfig, BrowserPoolConfig, DomainConfig, EngineConfig, LearningConfig, ProxyConfig,
    ProxyRotationStrategy, QueueConfig, RecoveryConfig, SinkConfig, StoreConfig, WorkerConfig,
};

use std::path::Path;

use crate::error::{EngineError, EngineResult};

impl EngineConfig {
    /// Load configuration from a JSON file. Missing sections fall back to
    /// defaults; an unreadable or malformed file is a hard error.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            EngineError::validation(format!("malformed config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check value ranges before the engine starts.
    pub fn validate(&self) -> EngineResult<()> {
        if self.worker.max_in_flight == 0 {
            return Err(EngineError::validation("worker.max_in_flight must be > 0"));
        }
        if self.browser.pool_size == 0 {
            return Err(EngineError::validation("browser.pool_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.recovery.error_rate_threshold) {
            return Err(EngineError::validation(
                "recovery.error_rate_threshold must be within 0..=1",
            ));
        }
        if self.recovery.window_size == 0 {
            return Err(EngineError::validation("recovery.window_size must be > 0"));
        }
        if self.sink.batch_size == 0 || self.sink.buffer_capacity == 0 {
            return Err(EngineError::validation(
                "sink.batch_size and sink.buffer_capacity must be > 0",
            ));
        }
        if self.ai.enabled && self.ai.endpoint.is_empty() {
            return Err(EngineError::validation(
                "ai.endpoint is required when ai.enabled",
            ));
        }
        if self.proxy.enabled && self.proxy.endpoints.is_empty() {
            return Err(EngineError::validation(
                "proxy.endpoints is required when proxy.enabled",
            ));
        }
        if !(0.0..=1.0).contains(&self.learning.min_success_rate) {
            return Err(EngineError::validation(
                "learning.min_success_rate must be within 0..=1",
            ));
        }
        Ok(())
    }
}
