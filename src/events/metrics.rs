//! Counters for the execution event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Default)]
pub struct EventBusMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    subscriber_lag_drops: AtomicU64,
    active_streams: AtomicUsize,
}

/// Point-in-time consistent view of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    /// Events published with no live subscriber.
    pub events_dropped: u64,
    /// Events lost to lagging subscribers (drop-oldest overflow).
    pub subscriber_lag_drops: u64,
    pub active_streams: usize,
}

impl EventBusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_published(&self) {
        self.inner.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.inner.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lag_drops(&self, n: u64) {
        self.inner
            .subscriber_lag_drops
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_active_streams(&self, n: usize) {
        self.inner.active_streams.store(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_dropped: self.inner.events_dropped.load(Ordering::Relaxed),
            subscriber_lag_drops: self.inner.subscriber_lag_drops.load(Ordering::Relaxed),
            active_streams: self.inner.active_streams.load(Ordering::Relaxed),
        }
    }
}
