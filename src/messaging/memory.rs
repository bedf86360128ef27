//! In-process broker with core pub/sub and a durable log
//!
//! Mirrors the NATS semantics the messaging layer relies on: plain and
//! queue-group subscriptions with wildcard subjects, streams that capture
//! every publish on their subject, a duplicate window keyed on the dedup
//! header, and durable pull consumers with explicit ack/nak. Used for local
//! development and as the broker behind the test suite.

use crate::error::{BrokerError, BrokerResult};
use crate::messaging::broker::{
    stream_name, subject_matches, BrokerConnection, DeliveryCallback, DurableLog, FetchedMessage,
    PublishAck, StreamInfo, SubscriptionHandle,
};
use crate::messaging::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// In-memory broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Offer durable-log primitives
    pub durable_enabled: bool,

    /// Window during which a repeated dedup identifier is suppressed
    pub duplicate_window: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            durable_enabled: true,
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// How a pull delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Ack,
    Nak,
}

/// Consumer progress and settlement history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub name: String,
    /// Deliveries handed out, redeliveries included
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    /// Delivered but not yet settled
    pub pending: usize,
    /// `(stream sequence, settlement)` in settlement order
    pub settlements: Vec<(u64, Settlement)>,
}

struct CoreSubscription {
    subject: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

struct StoredMessage {
    sequence: u64,
    message: Message,
}

#[derive(Default)]
struct ConsumerState {
    cursor: usize,
    redeliver: VecDeque<u64>,
    pending: HashSet<u64>,
    info: ConsumerInfo,
}

struct StreamState {
    subject: String,
    messages: Vec<StoredMessage>,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
    notify: Arc<Notify>,
}

impl StreamState {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            messages: Vec::new(),
            dedup: HashMap::new(),
            consumers: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn last_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence).unwrap_or(0)
    }

    /// Append unless the dedup identifier was seen within `window`
    fn store(&mut self, name: &str, message: Message, window: Duration) -> PublishAck {
        let now = Instant::now();
        self.dedup
            .retain(|_, (_, stored_at)| now.duration_since(*stored_at) < window);

        if let Some(id) = message.dedup_id() {
            if let Some((sequence, _)) = self.dedup.get(id) {
                return PublishAck {
                    stream: name.to_string(),
                    sequence: *sequence,
                    duplicate: true,
                };
            }
        }

        let sequence = self.last_sequence() + 1;
        if let Some(id) = message.dedup_id() {
            self.dedup.insert(id.to_string(), (sequence, now));
        }
        self.messages.push(StoredMessage { sequence, message });
        self.notify.notify_waiters();

        PublishAck {
            stream: name.to_string(),
            sequence,
            duplicate: false,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_subscription_id: u64,
    subscriptions: HashMap<u64, CoreSubscription>,
    group_cursors: HashMap<(String, String), usize>,
    streams: HashMap<String, StreamState>,
    published: Vec<Message>,
}

impl BrokerState {
    fn route(&mut self, message: &Message) {
        let mut groups: HashMap<(String, String), Vec<u64>> = HashMap::new();
        let mut ids: Vec<&u64> = self.subscriptions.keys().collect();
        ids.sort();

        for id in ids {
            let subscription = &self.subscriptions[id];
            if !subject_matches(&subscription.subject, &message.subject) {
                continue;
            }
            match &subscription.group {
                Some(group) => groups
                    .entry((subscription.subject.clone(), group.clone()))
                    .or_default()
                    .push(*id),
                None => {
                    let _ = subscription.sender.send(message.clone());
                }
            }
        }

        for (key, members) in groups {
            let cursor = self.group_cursors.entry(key).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if let Some(subscription) = self.subscriptions.get(&chosen) {
                let _ = subscription.sender.send(message.clone());
            }
        }
    }

    fn stream_for_subject(&mut self, subject: &str) -> Option<(&String, &mut StreamState)> {
        self.streams
            .iter_mut()
            .find(|(_, stream)| subject_matches(&stream.subject, subject))
    }
}

struct Inner {
    config: InMemoryConfig,
    state: Mutex<BrokerState>,
    publish_attempts: AtomicU64,
    flushes: AtomicU64,
    flush_timeouts: Mutex<Vec<Duration>>,
    streams_created: AtomicU64,
}

/// In-process [`BrokerConnection`]
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BrokerState::default()),
                publish_attempts: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
                flush_timeouts: Mutex::new(Vec::new()),
                streams_created: AtomicU64::new(0),
            }),
        }
    }

    /// Publish calls received, transient and durable
    pub fn publish_count(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Flush calls received, bounded and unbounded
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// Timeouts passed to bounded flushes, in call order
    pub fn flush_timeouts(&self) -> Vec<Duration> {
        self.inner.flush_timeouts.lock().clone()
    }

    /// Streams created over the broker's lifetime
    pub fn streams_created(&self) -> u64 {
        self.inner.streams_created.load(Ordering::SeqCst)
    }

    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().streams.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every message accepted by `publish` or `publish_durable`, in order
    pub fn published_messages(&self) -> Vec<Message> {
        self.inner.state.lock().published.clone()
    }

    /// Messages stored in the stream bound to `subject`
    pub fn stream_messages(&self, subject: &str) -> Vec<Message> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(&stream_name(subject))
            .map(|stream| stream.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_info(&self, subject: &str, consumer: &str) -> Option<ConsumerInfo> {
        let state = self.inner.state.lock();
        let stream = state.streams.get(&stream_name(subject))?;
        let consumer = stream.consumers.get(consumer)?;
        let mut info = consumer.info.clone();
        info.pending = consumer.pending.len();
        Some(info)
    }

    /// Number of live core subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    fn add_subscription(
        &self,
        subject: &str,
        group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Box<dyn SubscriptionHandle> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_subscription_id += 1;
            let id = state.next_subscription_id;
            state.subscriptions.insert(
                id,
                CoreSubscription {
                    subject: subject.to_string(),
                    group: group.map(str::to_string),
                    sender,
                },
            );
            id
        };

        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                callback(message);
            }
        });

        debug!(subject = subject, group = group.unwrap_or_default(), id = id, "In-memory subscription added");
        Box::new(InMemorySubscription {
            id,
            inner: self.inner.clone(),
            task: Some(task),
        })
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn publish(&self, message: Message) -> BrokerResult<()> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let window = self.inner.config.duplicate_window;
        let mut state = self.inner.state.lock();

        state.published.push(message.clone());
        state.route(&message);
        if let Some((name, stream)) = state.stream_for_subject(&message.subject) {
            let name = name.clone();
            stream.store(&name, message, window);
        }
        Ok(())
    }

    async fn flush(&self) -> BrokerResult<()> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush_timeout(&self, timeout: Duration) -> BrokerResult<()> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush_timeouts.lock().push(timeout);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        Ok(self.add_subscription(subject, None, callback))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        Ok(self.add_subscription(subject, Some(group), callback))
    }

    fn durable(&self) -> Option<&dyn DurableLog> {
        if self.inner.config.durable_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl DurableLog for InMemoryBroker {
    async fn stream_info(&self, subject: &str) -> BrokerResult<StreamInfo> {
        let name = stream_name(subject);
        let state = self.inner.state.lock();
        let stream = state.streams.get(&name).ok_or(BrokerError::StreamNotFound)?;

        Ok(StreamInfo {
            name,
            subjects: vec![stream.subject.clone()],
            messages: stream.messages.len() as u64,
            last_sequence: stream.last_sequence(),
        })
    }

    async fn create_stream(&self, subject: &str) -> BrokerResult<()> {
        let name = stream_name(subject);
        let mut state = self.inner.state.lock();
        if state.streams.contains_key(&name) {
            return Err(BrokerError::StreamAlreadyExists);
        }

        state.streams.insert(name, StreamState::new(subject));
        self.inner.streams_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_durable(&self, message: Message) -> BrokerResult<PublishAck> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let window = self.inner.config.duplicate_window;
        let mut state = self.inner.state.lock();

        let (name, stream) = state
            .stream_for_subject(&message.subject)
            .ok_or_else(|| BrokerError::NoStream(message.subject.clone()))?;
        let name = name.clone();
        let ack = stream.store(&name, message.clone(), window);

        state.published.push(message.clone());
        state.route(&message);
        Ok(ack)
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> BrokerResult<()> {
        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .get_mut(&stream_name(subject))
            .ok_or(BrokerError::StreamNotFound)?;

        stream
            .consumers
            .entry(consumer.to_string())
            .or_insert_with(|| ConsumerState {
                info: ConsumerInfo {
                    name: consumer.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            });
        Ok(())
    }

    async fn pull_fetch(
        &self,
        subject: &str,
        consumer: &str,
        batch_size: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Box<dyn FetchedMessage>>> {
        let name = stream_name(subject);
        let deadline = Instant::now() + max_wait;
        let notify = {
            let state = self.inner.state.lock();
            let stream = state.streams.get(&name).ok_or(BrokerError::StreamNotFound)?;
            stream.notify.clone()
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(&name, consumer, batch_size)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

impl InMemoryBroker {
    fn take_batch(
        &self,
        stream_name: &str,
        consumer: &str,
        batch_size: usize,
    ) -> BrokerResult<Vec<Box<dyn FetchedMessage>>> {
        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .get_mut(stream_name)
            .ok_or(BrokerError::StreamNotFound)?;
        let StreamState {
            messages,
            consumers,
            ..
        } = stream;
        let consumer_state = consumers
            .get_mut(consumer)
            .ok_or_else(|| BrokerError::Transport(format!("consumer {} not found", consumer)))?;

        let mut sequences = Vec::new();
        while sequences.len() < batch_size {
            if let Some(sequence) = consumer_state.redeliver.pop_front() {
                sequences.push(sequence);
            } else if consumer_state.cursor < messages.len() {
                sequences.push(messages[consumer_state.cursor].sequence);
                consumer_state.cursor += 1;
            } else {
                break;
            }
        }

        let mut batch: Vec<Box<dyn FetchedMessage>> = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            let Ok(index) = messages.binary_search_by_key(&sequence, |m| m.sequence) else {
                continue;
            };
            let message = messages[index].message.clone();
            consumer_state.pending.insert(sequence);
            consumer_state.info.delivered += 1;
            batch.push(Box::new(InMemoryFetched {
                inner: self.inner.clone(),
                stream: stream_name.to_string(),
                consumer: consumer.to_string(),
                sequence,
                message,
                settled: AtomicBool::new(false),
            }));
        }
        Ok(batch)
    }
}

struct InMemorySubscription {
    id: u64,
    inner: Arc<Inner>,
    task: Option<JoinHandle<()>>,
}

impl InMemorySubscription {
    fn remove(&self) {
        self.inner.state.lock().subscriptions.remove(&self.id);
    }
}

#[async_trait]
impl SubscriptionHandle for InMemorySubscription {
    async fn drain(&mut self) -> BrokerResult<()> {
        // Dropping the routing entry closes the channel; the delivery task
        // exits once everything already routed has reached the callback.
        self.remove();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.remove();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.remove();
    }
}

struct InMemoryFetched {
    inner: Arc<Inner>,
    stream: String,
    consumer: String,
    sequence: u64,
    message: Message,
    settled: AtomicBool,
}

impl InMemoryFetched {
    fn settle(&self, settlement: Settlement) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled);
        }

        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .get_mut(&self.stream)
            .ok_or(BrokerError::StreamNotFound)?;
        let consumer = stream
            .consumers
            .get_mut(&self.consumer)
            .ok_or_else(|| BrokerError::Transport(format!("consumer {} not found", self.consumer)))?;

        consumer.pending.remove(&self.sequence);
        consumer.info.settlements.push((self.sequence, settlement));
        match settlement {
            Settlement::Ack => consumer.info.acked += 1,
            Settlement::Nak => {
                consumer.info.naked += 1;
                consumer.redeliver.push_back(self.sequence);
                stream.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

/// An unsettled delivery that is dropped goes back for redelivery, as an
/// expired ack wait would on a real broker.
impl Drop for InMemoryFetched {
    fn drop(&mut self) {
        if *self.settled.get_mut() {
            return;
        }

        let mut state = self.inner.state.lock();
        let Some(stream) = state.streams.get_mut(&self.stream) else {
            return;
        };
        if let Some(consumer) = stream.consumers.get_mut(&self.consumer) {
            if consumer.pending.remove(&self.sequence) {
                consumer.redeliver.push_back(self.sequence);
                stream.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl FetchedMessage for InMemoryFetched {
    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.settle(Settlement::Ack)
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.settle(Settlement::Nak)
    }
}
