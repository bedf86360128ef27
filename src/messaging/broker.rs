//! Broker connection abstractions
//!
//! The publisher and subscriber only ever talk to a broker through these
//! traits. A connection is owned by the host process; nothing in this crate
//! closes it.

use crate::error::BrokerResult;
use crate::messaging::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by the broker for each pushed message.
///
/// Runs on the broker's delivery task and must return promptly.
pub type DeliveryCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Live connection to the message bus
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, message: Message) -> BrokerResult<()>;

    /// Block until every pending publish has been acknowledged by the server
    async fn flush(&self) -> BrokerResult<()>;

    /// Flush bounded by `timeout`
    async fn flush_timeout(&self, timeout: Duration) -> BrokerResult<()>;

    /// Subscribe every delivery on `subject` to `callback`
    async fn subscribe(
        &self,
        subject: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>>;

    /// Subscribe as a member of a load-balanced queue group
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>>;

    /// Durable-log primitives, when the connection offers them
    fn durable(&self) -> Option<&dyn DurableLog>;
}

/// Handle to an active push subscription
#[async_trait]
pub trait SubscriptionHandle: Send {
    /// Stop intake and wait until already-received messages reach the callback
    async fn drain(&mut self) -> BrokerResult<()>;

    /// Stop intake immediately, discarding anything not yet delivered
    async fn unsubscribe(&mut self) -> BrokerResult<()>;
}

/// Durable append-only log primitives (streams and pull consumers)
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Look up the stream bound to `subject`; `BrokerError::StreamNotFound` if absent
    async fn stream_info(&self, subject: &str) -> BrokerResult<StreamInfo>;

    /// Create a stream bound to `subject`; `BrokerError::StreamAlreadyExists` if present
    async fn create_stream(&self, subject: &str) -> BrokerResult<()>;

    /// Publish into the stream and wait for its storage acknowledgement
    async fn publish_durable(&self, message: Message) -> BrokerResult<PublishAck>;

    /// Create the named durable consumer if it does not exist yet
    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> BrokerResult<()>;

    /// Fetch up to `batch_size` messages, waiting at most `max_wait`.
    ///
    /// An expired wait with nothing to deliver yields an empty batch.
    async fn pull_fetch(
        &self,
        subject: &str,
        consumer: &str,
        batch_size: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Box<dyn FetchedMessage>>>;
}

/// A message delivered by a pull consumer, awaiting settlement
#[async_trait]
pub trait FetchedMessage: Send + Sync {
    fn message(&self) -> &Message;

    /// Commit consumption progress
    async fn ack(&self) -> BrokerResult<()>;

    /// Ask the broker to redeliver according to its own policy
    async fn nak(&self) -> BrokerResult<()>;
}

/// Stream metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub last_sequence: u64,
}

/// Storage acknowledgement for a durable publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    /// The broker recognised the dedup identifier and did not store the message again
    pub duplicate: bool,
}

/// Stream name derived from the subject it is bound to.
///
/// Stream names may not contain subject separators or wildcards.
pub fn stream_name(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// NATS subject matching: `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
