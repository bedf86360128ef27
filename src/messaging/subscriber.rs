//! Concurrent message consumption with bounded backpressure and graceful drain

use crate::error::{MessagingError, MessagingResult};
use crate::messaging::broker::{BrokerConnection, DeliveryCallback, DurableLog};
use crate::messaging::config::{DeliveryMode, SubscriberConfig};
use crate::messaging::context::{default_context_deriver, ContextDeriver, MessageContext};
use crate::messaging::message::Message;
use crate::messaging::provisioner::StreamProvisioner;
use crate::messaging::worker::{BoundedQueue, Delivery, Enqueue, WorkerPool, WorkerShared};
use crate::metrics::{self, MetricsSink, CONSUME_TOTAL, FETCH_ERRORS_TOTAL};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Caller-supplied message handler
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: MessageContext, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageContext, Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: MessageContext, message: Message) -> anyhow::Result<()> {
        (self)(ctx, message).await
    }
}

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    Created,
    /// Subscribe or stream provisioning in progress
    Subscribing,
    /// Workers running and intake open
    Ready,
    /// Intake stopped; waiting for in-flight handlers
    Draining,
    /// Terminal
    Stopped,
}

impl SubscriptionState {
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        matches!(
            (self, next),
            (Created, Subscribing)
                | (Subscribing, Ready)
                | (Subscribing, Stopped)
                | (Ready, Draining)
                | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SubscriptionState::Stopped
    }
}

/// Consumes subjects from a broker connection it does not own
#[derive(Clone)]
pub struct Subscriber {
    broker: Arc<dyn BrokerConnection>,
    provisioner: StreamProvisioner,
    config: Arc<SubscriberConfig>,
    derive_context: ContextDeriver,
    metrics: Arc<dyn MetricsSink>,
}

impl Subscriber {
    /// Create a subscriber; the configuration is validated here
    pub fn new(broker: Arc<dyn BrokerConnection>, config: SubscriberConfig) -> MessagingResult<Self> {
        config.validate()?;
        Ok(Self {
            provisioner: StreamProvisioner::new(broker.clone()),
            broker,
            config: Arc::new(config),
            derive_context: default_context_deriver(),
            metrics: metrics::noop(),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace how per-message contexts are derived from the consume context
    pub fn with_context_deriver<F>(mut self, derive: F) -> Self
    where
        F: Fn(&MessageContext, &Message) -> MessageContext + Send + Sync + 'static,
    {
        self.derive_context = Arc::new(derive);
        self
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Create a subscription in the `Created` state
    pub fn subscription(&self, subject: &str) -> Subscription {
        let (state, _) = watch::channel(SubscriptionState::Created);
        Subscription {
            subject: self.config.full_subject(subject),
            subscriber: self.clone(),
            state,
        }
    }

    /// Consume `subject` until `ctx` is done, then drain and return.
    ///
    /// Setup failures are returned immediately; per-message failures are only
    /// logged and counted.
    pub async fn consume<H>(&self, ctx: &MessageContext, subject: &str, handler: H) -> MessagingResult<()>
    where
        H: MessageHandler + 'static,
    {
        self.subscription(subject).run(ctx, Arc::new(handler)).await
    }
}

/// One consumption of one subject. Runs once; a stopped subscription cannot be reused.
pub struct Subscription {
    subject: String,
    subscriber: Subscriber,
    state: watch::Sender<SubscriptionState>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SubscriptionState) -> MessagingResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(MessagingError::InvalidStateTransition(format!(
                "{} -> {}",
                current, next
            )));
        }
        debug!(subject = %self.subject, from = %current, to = %next, "Subscription state changed");
        self.state.send_replace(next);
        Ok(())
    }

    /// Run until `ctx` is done. Returns only after every handler invocation
    /// has finished.
    pub async fn run(self, ctx: &MessageContext, handler: Arc<dyn MessageHandler>) -> MessagingResult<()> {
        self.transition(SubscriptionState::Subscribing)?;

        let config = self.subscriber.config.clone();
        let result = match config.mode {
            DeliveryMode::Push => self.run_push(ctx, handler, &config).await,
            DeliveryMode::Pull => self.run_pull(ctx, handler, &config).await,
        };

        if !self.state().is_terminal() {
            self.transition(SubscriptionState::Stopped)?;
        }
        result
    }

    fn worker_shared(
        &self,
        ctx: &MessageContext,
        handler: Arc<dyn MessageHandler>,
        queue: &str,
    ) -> Arc<WorkerShared> {
        Arc::new(WorkerShared {
            subject: self.subject.clone(),
            queue: queue.to_string(),
            parent: ctx.clone(),
            handler,
            derive_context: self.subscriber.derive_context.clone(),
            metrics: self.subscriber.metrics.clone(),
        })
    }

    async fn run_push(
        &self,
        ctx: &MessageContext,
        handler: Arc<dyn MessageHandler>,
        config: &SubscriberConfig,
    ) -> MessagingResult<()> {
        let subject = self.subject.as_str();
        let group = config.push_queue_group();
        let queue_label = group.unwrap_or_default().to_string();
        let broker = &self.subscriber.broker;

        info!(
            subject = subject,
            queue = %queue_label,
            concurrency = config.concurrency,
            "Starting subscription"
        );

        let mut queue = BoundedQueue::new(config.queue_capacity());
        let workers = WorkerPool::spawn(
            config.concurrency,
            &queue,
            self.worker_shared(ctx, handler, &queue_label),
        );

        let callback = self.push_callback(&queue, queue_label.clone());
        let subscribed = match group {
            Some(group) => broker.queue_subscribe(subject, group, callback).await,
            None => broker.subscribe(subject, callback).await,
        };

        let mut handle = match subscribed {
            Ok(handle) => handle,
            Err(source) => {
                error!(subject = subject, error = %source, "Subscribe failed");
                queue.close();
                workers.join().await;
                return Err(MessagingError::SubscribeFailed {
                    subject: subject.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = broker.flush().await {
            error!(subject = subject, error = %source, "Flush after subscribe failed");
            if let Err(e) = handle.unsubscribe().await {
                warn!(subject = subject, error = %e, "Unsubscribe after failed flush failed");
            }
            queue.close();
            workers.join().await;
            return Err(MessagingError::SubscribeFailed {
                subject: subject.to_string(),
                source,
            });
        }

        self.transition(SubscriptionState::Ready)?;
        info!(subject = subject, queue = %queue_label, "Subscription ready");

        ctx.done().await;

        self.transition(SubscriptionState::Draining)?;
        info!(subject = subject, "Draining subscription");
        if let Err(e) = handle.drain().await {
            warn!(subject = subject, error = %e, "Subscription drain failed");
        }
        queue.close();
        workers.join().await;

        self.transition(SubscriptionState::Stopped)?;
        info!(subject = subject, queue = %queue_label, "Subscription stopped");
        Ok(())
    }

    fn push_callback(&self, queue: &BoundedQueue, queue_label: String) -> DeliveryCallback {
        let producer = queue.push_producer();
        let metrics = self.subscriber.metrics.clone();
        let subject = self.subject.clone();

        Arc::new(move |message: Message| {
            let dropped = |reason: &str| {
                metrics.inc_with_tags(
                    CONSUME_TOTAL,
                    1,
                    &[
                        ("subject", subject.as_str()),
                        ("queue", queue_label.as_str()),
                        ("status", "dropped"),
                        ("reason", reason),
                    ],
                );
            };

            match producer.try_enqueue(message) {
                (Enqueue::Queued, length) => {
                    debug!(subject = %subject, queue_length = length, "Message queued");
                }
                (Enqueue::Full, capacity) => {
                    dropped("queue_full");
                    warn!(subject = %subject, capacity = capacity, "Message dropped: queue full");
                }
                (Enqueue::Closed, _) => {
                    dropped("closed");
                    debug!(subject = %subject, "Message discarded: subscription closed");
                }
            }
        })
    }

    async fn run_pull(
        &self,
        ctx: &MessageContext,
        handler: Arc<dyn MessageHandler>,
        config: &SubscriberConfig,
    ) -> MessagingResult<()> {
        let subject = self.subject.as_str();
        let consumer = config.consumer_name();

        let Some(durable) = self.subscriber.broker.durable() else {
            return Err(MessagingError::BackendUnavailable(
                "durable log required for pull consumption".to_string(),
            ));
        };

        self.subscriber.provisioner.ensure(subject).await?;
        durable
            .ensure_consumer(subject, consumer)
            .await
            .map_err(|source| MessagingError::SubscribeFailed {
                subject: subject.to_string(),
                source,
            })?;

        let mut queue = BoundedQueue::new(config.queue_capacity());
        let workers = WorkerPool::spawn(
            config.concurrency,
            &queue,
            self.worker_shared(ctx, handler, consumer),
        );

        self.transition(SubscriptionState::Ready)?;
        info!(
            subject = subject,
            queue = consumer,
            concurrency = config.concurrency,
            "Durable subscription ready"
        );

        self.fetch_loop(ctx, durable, &queue, config).await;

        self.transition(SubscriptionState::Draining)?;
        info!(subject = subject, "Draining durable subscription");
        queue.close();
        workers.join().await;

        self.transition(SubscriptionState::Stopped)?;
        info!(subject = subject, queue = consumer, "Durable subscription stopped");
        Ok(())
    }

    async fn fetch_loop(
        &self,
        ctx: &MessageContext,
        durable: &dyn DurableLog,
        queue: &BoundedQueue,
        config: &SubscriberConfig,
    ) {
        let subject = self.subject.as_str();
        let consumer = config.consumer_name();

        while !ctx.is_done() {
            // Unsettled deliveries of an abandoned fetch are redelivered by the broker
            let fetched = tokio::select! {
                _ = ctx.done() => break,
                fetched = durable.pull_fetch(
                    subject,
                    consumer,
                    config.fetch_batch_size,
                    config.fetch_max_wait(),
                ) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    let err = MessagingError::FetchFailed {
                        subject: subject.to_string(),
                        source: e,
                    };
                    error!(subject = subject, queue = consumer, error = %err, "Fetch error");
                    self.subscriber.metrics.inc_with_tags(
                        FETCH_ERRORS_TOTAL,
                        1,
                        &[("subject", subject), ("queue", consumer)],
                    );
                    tokio::select! {
                        _ = ctx.done() => {}
                        _ = tokio::time::sleep(config.fetch_error_backoff()) => {}
                    }
                    continue;
                }
            };

            if !batch.is_empty() {
                debug!(subject = subject, queue = consumer, fetched = batch.len(), "Fetched batch");
            }

            // Deliveries left unsent on cancel are abandoned unsettled
            for fetched in batch {
                let sent = tokio::select! {
                    biased;
                    _ = ctx.done() => false,
                    sent = queue.send(Delivery::Durable(fetched)) => sent,
                };
                if !sent {
                    return;
                }
            }
        }
    }
}
