//! Per-domain failure pattern analyzer.
//!
//! Keeps a sliding window of the last N outcomes per domain. Activation is
//! edge-triggered: a pattern is produced when the consecutive-failure count
//! reaches the threshold or the window error rate crosses the configured
//! rate, not on every failure while the domain stays unhealthy.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::ErrorKind;

/// Analyzer activation: the dominant failure kind over the window.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPattern {
    pub domain: String,
    pub pattern: String,
    pub error_rate: f64,
    pub consecutive_failures: u32,
}

/// Point-in-time view of a domain's health.
#[derive(Debug, Clone)]
pub struct DomainHealthSnapshot {
    pub domain: String,
    pub window_len: usize,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub blocked_remaining: Option<Duration>,
    pub ip_throttle_count: u32,
}

#[derive(Debug)]
struct DomainWindow {
    /// `None` = success, `Some(kind)` = failure.
    outcomes: VecDeque<Option<ErrorKind>>,
    consecutive_failures: u32,
    /// Set by `skip_domain`; all workers consult it before leasing work.
    blocked_until: Option<Instant>,
    /// How many times this domain has been blocked; drives backoff doubling.
    block_count: u32,
    ip_throttle_count: u32,
    /// True while the last activation has not been cleared by a success.
    triggered: bool,
}

impl DomainWindow {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::new(),
            consecutive_failures: 0,
            blocked_until: None,
            block_count: 0,
            ip_throttle_count: 0,
            triggered: false,
        }
    }

    fn push(&mut self, outcome: Option<ErrorKind>, window_size: usize) {
        self.outcomes.push_back(outcome);
        while self.outcomes.len() > window_size {
            self.outcomes.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|o| o.is_some()).count();
        failures as f64 / self.outcomes.len() as f64
    }

    /// Most frequent failure kind in the window; ties break toward the most
    /// recent occurrence.
    fn dominant_kind(&self) -> Option<ErrorKind> {
        let mut counts: HashMap<ErrorKind, (usize, usize)> = HashMap::new();
        for (idx, outcome) in self.outcomes.iter().enumerate() {
            if let Some(kind) = outcome {
                let entry = counts.entry(*kind).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = idx;
            }
        }
        counts
            .into_iter()
            .max_by_key(|(_, (count, last_idx))| (*count, *last_idx))
            .map(|(kind, _)| kind)
    }
}

pub struct PatternAnalyzer {
    domains: DashMap<String, DomainWindow>,
    config: RecoveryConfig,
}

impl PatternAnalyzer {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            domains: DashMap::new(),
            config,
        }
    }

    pub fn record_success(&self, domain: &str) {
        let mut window = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainWindow::new);
        window.push(None, self.config.window_size);
        window.consecutive_failures = 0;
        window.triggered = false;
    }

    /// Record a failure; returns a pattern only when the window newly crosses
    /// an activation threshold.
    pub fn record_failure(&self, domain: &str, kind: ErrorKind) -> Option<DetectedPattern> {
        let mut window = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainWindow::new);
        window.push(Some(kind), self.config.window_size);
        window.consecutive_failures += 1;
        if kind == ErrorKind::RateLimited {
            window.ip_throttle_count += 1;
        }

        let error_rate = window.error_rate();
        let hit_consecutive = window.consecutive_failures >= self.config.consecutive_threshold;
        let hit_rate = error_rate > self.config.error_rate_threshold
            && window.outcomes.len() >= self.config.window_size.min(10);

        if (hit_consecutive || hit_rate) && !window.triggered {
            window.triggered = true;
            let pattern = window.dominant_kind().unwrap_or(kind);
            warn!(
                domain,
                pattern = pattern.as_str(),
                error_rate,
                consecutive = window.consecutive_failures,
                "failure pattern detected"
            );
            return Some(DetectedPattern {
                domain: domain.to_string(),
                pattern: pattern.as_str().to_string(),
                error_rate,
                consecutive_failures: window.consecutive_failures,
            });
        }
        None
    }

    /// Remaining block duration, if the domain is currently skipped.
    #[must_use]
    pub fn blocked_remaining(&self, domain: &str) -> Option<Duration> {
        let window = self.domains.get(domain)?;
        let until = window.blocked_until?;
        let now = Instant::now();
        if until > now { Some(until - now) } else { None }
    }

    /// Block a domain. Duration doubles per repeat block, capped at `max`.
    pub fn block(&self, domain: &str, base: Duration, max: Duration) -> Duration {
        let mut window = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainWindow::new);
        let factor = 1u32 << window.block_count.min(6);
        let duration = (base * factor).min(max);
        window.blocked_until = Some(Instant::now() + duration);
        window.block_count += 1;
        info!(domain, ?duration, "domain blocked");
        duration
    }

    #[must_use]
    pub fn health(&self, domain: &str) -> Option<DomainHealthSnapshot> {
        self.domains.get(domain).map(|w| DomainHealthSnapshot {
            domain: domain.to_string(),
            window_len: w.outcomes.len(),
            error_rate: w.error_rate(),
            consecutive_failures: w.consecutive_failures,
            blocked_remaining: w.blocked_until.and_then(|until| {
                let now = Instant::now();
                if until > now { Some(until - now) } else { None }
            }),
            ip_throttle_count: w.ip_throttle_count,
        })
    }
}
