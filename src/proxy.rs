//! Proxy pool with rotation and failure-based disabling.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ProxyRotationStrategy};

struct ProxyEntry {
    endpoint: String,
    failures: AtomicU32,
    disabled: AtomicBool,
}

pub struct ProxyPool {
    config: ProxyConfig,
    entries: Vec<ProxyEntry>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        let entries = config
            .endpoints
            .iter()
            .map(|endpoint| ProxyEntry {
                endpoint: endpoint.clone(),
                failures: AtomicU32::new(0),
                disabled: AtomicBool::new(false),
            })
            .collect();
        Self {
            config,
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled && !self.entries.is_empty()
    }

    /// Pick the next proxy per the configured strategy, avoiding `current`
    /// when any alternative is live.
    #[must_use]
    pub fn next(&self, current: Option<&str>) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        let live: Vec<&ProxyEntry> = self
            .entries
            .iter()
            .filter(|e| !e.disabled.load(Ordering::Relaxed))
            .collect();
        if live.is_empty() {
            return None;
        }
        let mut candidates: Vec<&ProxyEntry> = live
            .iter()
            .copied()
            .filter(|e| current != Some(e.endpoint.as_str()))
            .collect();
        if candidates.is_empty() {
            candidates = live;
        }
        match self.config.rotation_strategy {
            ProxyRotationStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].endpoint.clone())
            }
            ProxyRotationStrategy::Random => {
                use rand::prelude::IndexedRandom;
                candidates
                    .choose(&mut rand::rng())
                    .map(|e| e.endpoint.clone())
            }
            ProxyRotationStrategy::LeastFailed => candidates
                .iter()
                .min_by_key(|e| e.failures.load(Ordering::Relaxed))
                .map(|e| e.endpoint.clone()),
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.endpoint == endpoint) {
            let failures = entry.failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.config.max_failures_before_disable {
                entry.disabled.store(true, Ordering::Relaxed);
                warn!(endpoint, failures, "proxy disabled after repeated failures");
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.endpoint == endpoint) {
            entry.failures.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.disabled.load(Ordering::Relaxed))
            .count()
    }

    /// Background sweep: probe disabled proxies and re-enable the ones that
    /// answer again.
    pub fn spawn_health_checker(
        self: std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.enabled() {
                return;
            }
            let interval = Duration::from_secs(self.config.health_check_interval.max(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for entry in &self.entries {
                    if !entry.disabled.load(Ordering::Relaxed) {
                        continue;
                    }
                    if probe(&entry.endpoint).await {
                        info!(endpoint = %entry.endpoint, "proxy recovered, re-enabling");
                        entry.failures.store(0, Ordering::Relaxed);
                        entry.disabled.store(false, Ordering::Relaxed);
                    } else {
                        debug!(endpoint = %entry.endpoint, "proxy still unhealthy");
                    }
                }
            }
        })
    }
}

/// One cheap request through the proxy; any response counts as alive.
async fn probe(endpoint: &str) -> bool {
    let Ok(proxy) = reqwest::Proxy::all(endpoint) else {
        return false;
    };
    let Ok(client) = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(10))
        .build()
    else {
        return false;
    };
    client
        .get("http://connectivity-check.gstatic.com/generate_204")
        .send()
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(strategy: ProxyRotationStrategy) -> ProxyPool {
        ProxyPool::new(ProxyConfig {
            enabled: true,
            endpoints: vec![
                "http://proxy-a:8080".into(),
                "http://proxy-b:8080".into(),
                "http://proxy-c:8080".into(),
            ],
            rotation_strategy: strategy,
            health_check_interval: 60,
            max_failures_before_disable: 2,
        })
    }

    #[test]
    fn round_robin_avoids_current() {
        let pool = pool(ProxyRotationStrategy::RoundRobin);
        let next = pool.next(Some("http://proxy-a:8080")).unwrap();
        assert_ne!(next, "http://proxy-a:8080");
    }

    #[test]
    fn failures_disable_after_threshold() {
        let pool = pool(ProxyRotationStrategy::LeastFailed);
        pool.record_failure("http://proxy-a:8080");
        assert_eq!(pool.live_count(), 3);
        pool.record_failure("http://proxy-a:8080");
        assert_eq!(pool.live_count(), 2);
        // Disabled proxies never come out of next().
        for _ in 0..10 {
            assert_ne!(pool.next(None).unwrap(), "http://proxy-a:8080");
        }
    }

    #[test]
    fn least_failed_prefers_clean_proxy() {
        let pool = pool(ProxyRotationStrategy::LeastFailed);
        pool.record_failure("http://proxy-a:8080");
        pool.record_failure("http://proxy-b:8080");
        assert_eq!(pool.next(None).unwrap(), "http://proxy-c:8080");
    }

    #[test]
    fn disabled_pool_yields_nothing() {
        let pool = ProxyPool::new(ProxyConfig::default());
        assert_eq!(pool.next(None), None);
    }
}
