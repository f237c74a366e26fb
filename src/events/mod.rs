//! Real-time execution event streaming (best-effort fan-out).

mod bus;
mod metrics;
mod types;

pub use bus::{EventSubscriber, ExecutionEventBus, StreamError};
pub use metrics::{EventBusMetrics, MetricsSnapshot};
pub use types::{EventKind, ExecutionEvent};
