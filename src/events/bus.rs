//! Per-execution event fan-out.
//!
//! One broadcast channel per execution id. Subscribers are lossy by design:
//! when a subscriber cannot keep up, the newest events overwrite the oldest
//! in its queue (tokio broadcast lag semantics). Publishing never blocks on
//! slow consumers.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use super::metrics::EventBusMetrics;
use super::types::ExecutionEvent;

/// Error surfaced by subscriber-side receive helpers.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error("subscriber lagged, {0} events lost")]
    Lagged(u64),
}

#[derive(Debug)]
pub struct ExecutionEventBus {
    channels: DashMap<Uuid, broadcast::Sender<ExecutionEvent>>,
    capacity: usize,
    metrics: EventBusMetrics,
}

impl ExecutionEventBus {
    /// `capacity` bounds each subscriber's queue; overflow drops oldest.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
            metrics: EventBusMetrics::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }

    /// Publish an event to the execution's subscribers. Returns how many
    /// subscribers received it; zero is not an error (the stream is
    /// best-effort, the store is the source of truth).
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        let sender = self
            .channels
            .entry(event.execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();

        self.metrics.increment_published();
        match sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.metrics.increment_dropped();
                trace!("event published with no active subscribers");
                0
            }
        }
    }

    /// Subscribe to one execution's stream.
    #[must_use]
    pub fn subscribe(&self, execution_id: Uuid) -> EventSubscriber {
        let receiver = self
            .channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        self.metrics.set_active_streams(self.channels.len());
        EventSubscriber {
            receiver,
            metrics: self.metrics.clone(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.channels
            .get(&execution_id)
            .map_or(0, |s| s.receiver_count())
    }

    /// Drop the channel for a terminated execution. Outstanding subscribers
    /// drain whatever is still buffered, then observe `Closed`.
    pub fn remove(&self, execution_id: Uuid) {
        if self.channels.remove(&execution_id).is_some() {
            debug!(%execution_id, "event stream removed");
        }
        self.metrics.set_active_streams(self.channels.len());
    }
}

/// Receiving half of one execution stream.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<ExecutionEvent>,
    metrics: EventBusMetrics,
}

impl EventSubscriber {
    /// Receive the next event. A lag gap is reported once, then receiving
    /// resumes from the oldest retained event.
    pub async fn recv(&mut self) -> Result<ExecutionEvent, StreamError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.metrics.record_lag_drops(n);
                Err(StreamError::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => Err(StreamError::Closed),
        }
    }
}
