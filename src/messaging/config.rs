//! Messaging configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Multiplier applied to worker concurrency to size a subscription's queue.
pub const QUEUE_CAPACITY_MULTIPLIER: usize = 4;

/// Durable consumer name used when no queue group is configured.
pub const DEFAULT_CONSUMER_NAME: &str = "default";

/// Delivery strategy for a subscription
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Broker pushes each message to a callback; at-most-once, drops when saturated
    #[default]
    Push,
    /// Subscriber fetches batches from a durable consumer; at-least-once with ack/nak
    Pull,
}

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NatsConfig {
    /// NATS server URLs
    #[serde(default = "default_servers")]
    #[validate(length(min = 1))]
    pub servers: Vec<String>,

    /// Connection name
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Enable TLS
    #[serde(default)]
    pub enable_tls: bool,

    /// Maximum reconnect attempts (`None` retries forever)
    #[serde(default)]
    pub max_reconnects: Option<usize>,

    /// Reconnect delay in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    #[validate(range(min = 1))]
    pub connection_timeout_ms: u64,

    /// Expose JetStream durable-log primitives on the connection
    #[serde(default = "default_true")]
    pub enable_jetstream: bool,

    /// Flush pending writes when the host shuts the connection down
    #[serde(default = "default_true")]
    pub drain_on_stop: bool,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            connection_name: default_connection_name(),
            enable_tls: false,
            max_reconnects: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            enable_jetstream: true,
            drain_on_stop: true,
        }
    }
}

impl NatsConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PublisherConfig {
    /// Prefix prepended verbatim to every subject
    #[serde(default)]
    pub subject_prefix: String,

    /// Maximum encoded message size in bytes
    #[serde(default = "default_max_message_size")]
    #[validate(range(min = 1))]
    pub max_message_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subject_prefix: String::new(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl PublisherConfig {
    /// Get full subject name with prefix
    pub fn full_subject(&self, subject: &str) -> String {
        format!("{}{}", self.subject_prefix, subject)
    }
}

/// Subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubscriberConfig {
    /// Prefix prepended verbatim to every subject
    #[serde(default)]
    pub subject_prefix: String,

    /// Queue group (push) or durable consumer name (pull)
    #[serde(default)]
    pub queue_group: Option<String>,

    /// Worker tasks per subscription
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 4096))]
    pub concurrency: usize,

    /// Delivery strategy
    #[serde(default)]
    pub mode: DeliveryMode,

    /// Messages requested per pull fetch
    #[serde(default = "default_fetch_batch_size")]
    #[validate(range(min = 1, max = 10000))]
    pub fetch_batch_size: usize,

    /// Maximum time a pull fetch waits for messages, in milliseconds
    #[serde(default = "default_fetch_max_wait_ms")]
    #[validate(range(min = 1))]
    pub fetch_max_wait_ms: u64,

    /// Pause after a failed pull fetch, in milliseconds
    #[serde(default = "default_fetch_error_backoff_ms")]
    pub fetch_error_backoff_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            subject_prefix: String::new(),
            queue_group: None,
            concurrency: default_concurrency(),
            mode: DeliveryMode::Push,
            fetch_batch_size: default_fetch_batch_size(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            fetch_error_backoff_ms: default_fetch_error_backoff_ms(),
        }
    }
}

impl SubscriberConfig {
    /// Get full subject name with prefix
    pub fn full_subject(&self, subject: &str) -> String {
        format!("{}{}", self.subject_prefix, subject)
    }

    /// Capacity of the bounded queue between delivery and workers
    pub fn queue_capacity(&self) -> usize {
        self.concurrency * QUEUE_CAPACITY_MULTIPLIER
    }

    /// Durable consumer name used in pull mode
    pub fn consumer_name(&self) -> &str {
        match self.queue_group.as_deref() {
            Some(group) if !group.is_empty() => group,
            _ => DEFAULT_CONSUMER_NAME,
        }
    }

    /// Queue group used in push mode, if any
    pub fn push_queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref().filter(|g| !g.is_empty())
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn fetch_error_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_error_backoff_ms)
    }
}

fn default_servers() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_connection_name() -> String {
    "llm-event-bus".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    1_048_576 // 1MB
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_fetch_batch_size() -> usize {
    10
}

fn default_fetch_max_wait_ms() -> u64 {
    2000
}

fn default_fetch_error_backoff_ms() -> u64 {
    250
}
