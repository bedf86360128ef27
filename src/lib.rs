//! Reliable publish/subscribe messaging layer for NATS
//!
//! Publishers encode values as JSON and publish them transiently or through a
//! durable stream with deduplication. Subscribers consume with a bounded
//! worker pool in push or pull mode and drain gracefully on cancellation.

pub mod config;
pub mod error;
pub mod messaging;
pub mod metrics;

pub use crate::config::Config;
pub use crate::error::{BrokerError, BrokerResult, MessagingError, MessagingResult};
pub use crate::messaging::{
    MessageContext, MessageHandler, NatsBroker, Publisher, Subscriber, SubscriptionState,
};
pub use crate::metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
