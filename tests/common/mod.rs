//! Common test utilities for messaging integration tests
//!
//! Provides a recording metrics sink, a fault-injecting broker wrapper around
//! `InMemoryBroker`, a handler probe that records timing and overlap, and
//! polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use llm_event_bus::error::{BrokerError, BrokerResult};
use llm_event_bus::messaging::{
    BrokerConnection, DeliveryCallback, DurableLog, FetchedMessage, InMemoryBroker, Message,
    PublishAck, StreamInfo, SubscriptionHandle, SubscriptionState,
};
use llm_event_bus::metrics::MetricsSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Default upper bound for polling helpers
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A single recorded metric event
#[derive(Debug, Clone)]
pub struct Recorded {
    pub name: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

impl Recorded {
    fn matches(&self, name: &str, filter: &[(&str, &str)]) -> bool {
        self.name == name
            && filter
                .iter()
                .all(|(k, v)| self.tags.iter().any(|(tk, tv)| tk == k && tv == v))
    }
}

/// Metrics sink that keeps every event in memory
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<Vec<Recorded>>,
    observations: Mutex<Vec<Recorded>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of counter deltas for `name` whose tags include every `filter` pair
    pub fn count(&self, name: &str, filter: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|r| r.matches(name, filter))
            .map(|r| r.value as u64)
            .sum()
    }

    /// Number of observations for `name` whose tags include every `filter` pair
    pub fn observed(&self, name: &str, filter: &[(&str, &str)]) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|r| r.matches(name, filter))
            .count()
    }
}

fn owned(tags: &[(&str, &str)]) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl MetricsSink for RecordingMetrics {
    fn inc_with_tags(&self, name: &str, delta: u64, tags: &[(&str, &str)]) {
        self.counters.lock().push(Recorded {
            name: name.to_string(),
            value: delta as f64,
            tags: owned(tags),
        });
    }

    fn observe_with_tags(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.observations.lock().push(Recorded {
            name: name.to_string(),
            value,
            tags: owned(tags),
        });
    }
}

/// `InMemoryBroker` wrapper that fails selected operations on demand
#[derive(Default)]
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    pub fail_subscribe: AtomicBool,
    pub fail_flush: AtomicBool,
    pub fail_create_stream: AtomicBool,
    pub fail_stream_info: AtomicBool,
    pub fail_ensure_consumer: AtomicBool,
    /// Number of upcoming pull fetches that fail with a transport error
    pub fetch_failures: AtomicUsize,
    /// Number of upcoming stream lookups that report the stream missing
    pub stale_stream_lookups: AtomicUsize,
}

impl FlakyBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> BrokerResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(format!("injected {} failure", what)));
        }
        Ok(())
    }

    fn durable_inner(&self) -> BrokerResult<&dyn DurableLog> {
        self.inner
            .durable()
            .ok_or_else(|| BrokerError::Transport("durable log disabled".to_string()))
    }
}

/// Consume one unit of an injected failure budget
fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BrokerConnection for FlakyBroker {
    async fn publish(&self, message: Message) -> BrokerResult<()> {
        self.inner.publish(message).await
    }

    async fn flush(&self) -> BrokerResult<()> {
        Self::injected(&self.fail_flush, "flush")?;
        self.inner.flush().await
    }

    async fn flush_timeout(&self, timeout: Duration) -> BrokerResult<()> {
        Self::injected(&self.fail_flush, "flush")?;
        self.inner.flush_timeout(timeout).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        Self::injected(&self.fail_subscribe, "subscribe")?;
        self.inner.subscribe(subject, callback).await
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        Self::injected(&self.fail_subscribe, "subscribe")?;
        self.inner.queue_subscribe(subject, group, callback).await
    }

    fn durable(&self) -> Option<&dyn DurableLog> {
        self.inner.durable().map(|_| self as &dyn DurableLog)
    }
}

#[async_trait]
impl DurableLog for FlakyBroker {
    async fn stream_info(&self, subject: &str) -> BrokerResult<StreamInfo> {
        Self::injected(&self.fail_stream_info, "stream info")?;
        if take_one(&self.stale_stream_lookups) {
            return Err(BrokerError::StreamNotFound);
        }
        self.durable_inner()?.stream_info(subject).await
    }

    async fn create_stream(&self, subject: &str) -> BrokerResult<()> {
        Self::injected(&self.fail_create_stream, "create stream")?;
        self.durable_inner()?.create_stream(subject).await
    }

    async fn publish_durable(&self, message: Message) -> BrokerResult<PublishAck> {
        self.durable_inner()?.publish_durable(message).await
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> BrokerResult<()> {
        Self::injected(&self.fail_ensure_consumer, "ensure consumer")?;
        self.durable_inner()?.ensure_consumer(subject, consumer).await
    }

    async fn pull_fetch(
        &self,
        subject: &str,
        consumer: &str,
        batch_size: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Box<dyn FetchedMessage>>> {
        if take_one(&self.fetch_failures) {
            return Err(BrokerError::Transport("injected fetch failure".to_string()));
        }
        self.durable_inner()?
            .pull_fetch(subject, consumer, batch_size, max_wait)
            .await
    }
}

/// Records handler invocations: payloads, timing and overlap
#[derive(Default)]
pub struct HandlerProbe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    payloads: Mutex<Vec<String>>,
    intervals: Mutex<Vec<(Instant, Instant)>>,
}

impl HandlerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation that takes `work` to complete
    pub async fn observe(&self, message: &Message, work: Duration) {
        let start = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !work.is_zero() {
            tokio::time::sleep(work).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .push(String::from_utf8_lossy(&message.payload).into_owned());
        self.intervals.lock().push((start, Instant::now()));
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().clone()
    }

    /// `(start, end)` of every completed invocation
    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().clone()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait for a subscription to reach `state`
pub async fn wait_for_state(
    receiver: &mut watch::Receiver<SubscriptionState>,
    state: SubscriptionState,
) -> bool {
    tokio::time::timeout(WAIT_TIMEOUT, receiver.wait_for(|current| *current == state))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}
