//! NATS and JetStream implementation of the broker traits

use crate::error::{BrokerError, BrokerResult, MessagingError, MessagingResult};
use crate::messaging::broker::{
    stream_name, BrokerConnection, DeliveryCallback, DurableLog, FetchedMessage, PublishAck,
    StreamInfo, SubscriptionHandle,
};
use crate::messaging::config::NatsConfig;
use crate::messaging::message::{Headers, Message};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, Consumer},
    context::{CreateStreamErrorKind, GetStreamErrorKind, PublishErrorKind},
    AckKind, ErrorCode,
};
use async_nats::{Client, ConnectOptions, Event, HeaderMap, ServerAddr};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Production [`BrokerConnection`] over an async-nats client.
///
/// The host owns the connection: it calls [`NatsBroker::connect`] at startup
/// and [`NatsBroker::shutdown`] once every subscription has drained.
pub struct NatsBroker {
    client: Client,
    jetstream: Option<jetstream::Context>,
    consumers: DashMap<String, Consumer<pull::Config>>,
    closed: Arc<AtomicBool>,
    config: NatsConfig,
}

impl NatsBroker {
    /// Connect using the configured servers and reconnect policy
    pub async fn connect(config: &NatsConfig) -> MessagingResult<Self> {
        config.validate()?;
        let servers = config
            .servers
            .iter()
            .map(|server| server.parse::<ServerAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MessagingError::Configuration(format!("Invalid NATS server address: {}", e)))?;
        let closed = Arc::new(AtomicBool::new(false));

        let client = ConnectOptions::new()
            .name(&config.connection_name)
            .reconnect_delay_callback(reconnect_policy(
                config.max_reconnects,
                config.reconnect_delay(),
                closed.clone(),
            ))
            .connection_timeout(config.connection_timeout())
            .require_tls(config.enable_tls)
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => warn!("NATS connection lost"),
                    Event::Connected => info!("NATS connection (re)established"),
                    other => debug!(event = ?other, "NATS connection event"),
                }
            })
            .connect(servers)
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("NATS connection failed: {}", e)))?;

        info!(
            servers = ?config.servers,
            name = %config.connection_name,
            jetstream = config.enable_jetstream,
            "Connected to NATS"
        );
        let mut broker = Self::from_client(client, config.clone());
        broker.closed = closed;
        Ok(broker)
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client, config: NatsConfig) -> Self {
        let jetstream = config
            .enable_jetstream
            .then(|| jetstream::new(client.clone()));

        Self {
            client,
            jetstream,
            consumers: DashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Whether the connection gave up reconnecting
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush pending writes when `drain_on_stop` is set. The client closes on drop.
    pub async fn shutdown(&self) -> MessagingResult<()> {
        if self.config.drain_on_stop && !self.is_closed() {
            self.client
                .flush()
                .await
                .map_err(|e| MessagingError::ConnectionFailed(format!("NATS flush on shutdown failed: {}", e)))?;
        }
        info!(name = %self.config.connection_name, "NATS connection shut down");
        Ok(())
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn context(&self) -> BrokerResult<&jetstream::Context> {
        self.ensure_open()?;
        self.jetstream
            .as_ref()
            .ok_or_else(|| BrokerError::Transport("JetStream disabled".to_string()))
    }

    async fn consumer(&self, subject: &str, name: &str, create: bool) -> BrokerResult<Consumer<pull::Config>> {
        let key = format!("{}/{}", stream_name(subject), name);
        if let Some(consumer) = self.consumers.get(&key) {
            return Ok(consumer.clone());
        }

        let stream = self
            .context()?
            .get_stream(stream_name(subject))
            .await
            .map_err(|e| match e.kind() {
                GetStreamErrorKind::JetStream(err) if err.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                    BrokerError::StreamNotFound
                }
                _ => transport(e),
            })?;

        let consumer = if create {
            stream
                .get_or_create_consumer(
                    name,
                    pull::Config {
                        durable_name: Some(name.to_string()),
                        ack_policy: AckPolicy::Explicit,
                        ..Default::default()
                    },
                )
                .await
                .map_err(transport)?
        } else {
            stream.get_consumer(name).await.map_err(transport)?
        };

        self.consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    fn spawn_subscription(
        &self,
        subscriber: async_nats::Subscriber,
        subject: &str,
        callback: DeliveryCallback,
    ) -> Box<dyn SubscriptionHandle> {
        let (control, mut control_rx) = mpsc::unbounded_channel::<Control>();
        let mut subscriber = subscriber;
        let subject = subject.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    control = control_rx.recv() => {
                        let draining = matches!(control, Some(Control::Drain));
                        if let Err(e) = subscriber.unsubscribe().await {
                            warn!(subject = %subject, error = %e, "NATS unsubscribe failed");
                        }
                        if draining {
                            // Buffered messages are still delivered once interest is removed
                            while let Some(message) = subscriber.next().await {
                                callback(from_nats(message));
                            }
                        }
                        break;
                    }
                    message = subscriber.next() => match message {
                        Some(message) => callback(from_nats(message)),
                        None => break,
                    },
                }
            }
            debug!(subject = %subject, "NATS delivery task stopped");
        });

        Box::new(NatsSubscription {
            control,
            task: Some(task),
        })
    }
}

#[async_trait]
impl BrokerConnection for NatsBroker {
    async fn publish(&self, message: Message) -> BrokerResult<()> {
        self.ensure_open()?;
        let result = if message.headers.is_empty() {
            self.client.publish(message.subject, message.payload).await
        } else {
            let headers = to_header_map(&message.headers);
            self.client
                .publish_with_headers(message.subject, headers, message.payload)
                .await
        };
        result.map_err(transport)
    }

    async fn flush(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        self.client.flush().await.map_err(transport)
    }

    async fn flush_timeout(&self, timeout: Duration) -> BrokerResult<()> {
        self.ensure_open()?;
        match tokio::time::timeout(timeout, self.client.flush()).await {
            Ok(result) => result.map_err(transport),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        self.ensure_open()?;
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(transport)?;
        Ok(self.spawn_subscription(subscriber, subject, callback))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        callback: DeliveryCallback,
    ) -> BrokerResult<Box<dyn SubscriptionHandle>> {
        self.ensure_open()?;
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(transport)?;
        Ok(self.spawn_subscription(subscriber, subject, callback))
    }

    fn durable(&self) -> Option<&dyn DurableLog> {
        if self.jetstream.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl DurableLog for NatsBroker {
    async fn stream_info(&self, subject: &str) -> BrokerResult<StreamInfo> {
        let stream = self
            .context()?
            .get_stream(stream_name(subject))
            .await
            .map_err(|e| match e.kind() {
                GetStreamErrorKind::JetStream(err) if err.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                    BrokerError::StreamNotFound
                }
                _ => transport(e),
            })?;

        let info = stream.cached_info();
        Ok(StreamInfo {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
            last_sequence: info.state.last_sequence,
        })
    }

    async fn create_stream(&self, subject: &str) -> BrokerResult<()> {
        self.context()?
            .create_stream(jetstream::stream::Config {
                name: stream_name(subject),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| match e.kind() {
                CreateStreamErrorKind::JetStream(err) if err.error_code() == ErrorCode::STREAM_NAME_EXIST => {
                    BrokerError::StreamAlreadyExists
                }
                _ => transport(e),
            })
    }

    async fn publish_durable(&self, message: Message) -> BrokerResult<PublishAck> {
        let headers = to_header_map(&message.headers);
        let ack = self
            .context()?
            .publish_with_headers(message.subject, headers, message.payload)
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> BrokerResult<()> {
        self.consumer(subject, consumer, true).await.map(|_| ())
    }

    async fn pull_fetch(
        &self,
        subject: &str,
        consumer: &str,
        batch_size: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Box<dyn FetchedMessage>>> {
        let consumer = self.consumer(subject, consumer, false).await?;
        let mut batch = consumer
            .batch()
            .max_messages(batch_size)
            .expires(max_wait)
            .messages()
            .await
            .map_err(transport)?;

        let mut fetched: Vec<Box<dyn FetchedMessage>> = Vec::with_capacity(batch_size);
        while let Some(message) = batch.next().await {
            let message = message.map_err(transport)?;
            fetched.push(Box::new(NatsFetched {
                converted: from_nats(message.message.clone()),
                message,
            }));
        }
        Ok(fetched)
    }
}

enum Control {
    Drain,
    Unsubscribe,
}

struct NatsSubscription {
    control: mpsc::UnboundedSender<Control>,
    task: Option<JoinHandle<()>>,
}

impl NatsSubscription {
    async fn stop(&mut self, control: Control) -> BrokerResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        // The task may already have exited if the connection closed
        let _ = self.control.send(control);
        task.await.map_err(transport)
    }
}

#[async_trait]
impl SubscriptionHandle for NatsSubscription {
    async fn drain(&mut self) -> BrokerResult<()> {
        self.stop(Control::Drain).await
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.stop(Control::Unsubscribe).await
    }
}

struct NatsFetched {
    message: jetstream::Message,
    converted: Message,
}

#[async_trait]
impl FetchedMessage for NatsFetched {
    fn message(&self) -> &Message {
        &self.converted
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

/// Delay before each connection attempt.
///
/// async-nats retries forever, so the limit is enforced here: attempt 1 is
/// immediate, the next `max_reconnects` attempts wait `delay`, and once the
/// budget is spent the connection is marked closed and the connector parks.
fn reconnect_policy(
    max_reconnects: Option<usize>,
    delay: Duration,
    closed: Arc<AtomicBool>,
) -> impl Fn(usize) -> Duration + Send + Sync + 'static {
    move |attempts| {
        if attempts <= 1 {
            return Duration::ZERO;
        }
        match max_reconnects {
            Some(max) if attempts > max + 1 => {
                if !closed.swap(true, Ordering::AcqRel) {
                    error!(attempts = attempts - 1, "NATS reconnect limit reached, giving up");
                }
                Duration::MAX
            }
            _ => delay,
        }
    }
}

fn transport(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Transport(e.to_string())
}

fn publish_error(e: jetstream::context::PublishError) -> BrokerError {
    match e.kind() {
        PublishErrorKind::TimedOut => BrokerError::Timeout,
        PublishErrorKind::StreamNotFound => BrokerError::NoStream(e.to_string()),
        _ => transport(e),
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        map.append(name, value);
    }
    map
}

fn from_nats(message: async_nats::Message) -> Message {
    let headers: Headers = message
        .headers
        .iter()
        .flat_map(|map| map.iter())
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.to_string(), value.to_string()))
        })
        .collect();

    Message {
        subject: message.subject.to_string(),
        payload: message.payload,
        headers,
    }
}
