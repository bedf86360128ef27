//! Best-effort metrics sinks for the messaging layer.
//!
//! Recording never fails from the caller's point of view: sinks swallow their
//! own errors so that metrics can never push backpressure into the data path.
//!
//! # Example
//! ```
//! use llm_event_bus::metrics::{MetricsSink, PrometheusMetrics};
//!
//! let metrics = PrometheusMetrics::new("event_bus");
//! metrics.inc_with_tags("messaging_publish_total", 1, &[("subject", "orders"), ("status", "success")]);
//! assert!(metrics.render().contains("event_bus_messaging_publish_total"));
//! ```

mod registry;

pub use registry::PrometheusMetrics;

use std::sync::Arc;

/// Metric name: publish attempts and outcomes
pub const PUBLISH_TOTAL: &str = "messaging_publish_total";
/// Metric name: publish latency
pub const PUBLISH_DURATION_SECONDS: &str = "messaging_publish_duration_seconds";
/// Metric name: consumed message outcomes (received, processed, error, dropped)
pub const CONSUME_TOTAL: &str = "messaging_consume_total";
/// Metric name: handler latency
pub const CONSUME_DURATION_SECONDS: &str = "messaging_consume_duration_seconds";
/// Metric name: failed pull fetches
pub const FETCH_ERRORS_TOTAL: &str = "messaging_fetch_errors_total";
/// Metric name: failed ack/nak calls
pub const SETTLE_ERRORS_TOTAL: &str = "messaging_settle_errors_total";

/// Destination for counters and observations tagged with key/value pairs
pub trait MetricsSink: Send + Sync {
    fn inc_with_tags(&self, name: &str, delta: u64, tags: &[(&str, &str)]);

    fn observe_with_tags(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_with_tags(&self, _name: &str, _delta: u64, _tags: &[(&str, &str)]) {}

    fn observe_with_tags(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}

/// Shared no-op sink used when no metrics are configured
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}
