//! Bounded queue and worker pool shared by push and pull subscriptions

use crate::messaging::broker::FetchedMessage;
use crate::messaging::context::{ContextDeriver, MessageContext};
use crate::messaging::message::Message;
use crate::messaging::subscriber::MessageHandler;
use crate::metrics::{MetricsSink, CONSUME_DURATION_SECONDS, CONSUME_TOTAL, SETTLE_ERRORS_TOTAL};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

/// A unit of work sitting in the bounded queue
pub(crate) enum Delivery {
    /// Pushed by the broker; nothing to settle
    Transient(Message),
    /// Fetched from a durable consumer; acked or naked after handling
    Durable(Box<dyn FetchedMessage>),
}

impl Delivery {
    pub(crate) fn message(&self) -> &Message {
        match self {
            Delivery::Transient(message) => message,
            Delivery::Durable(fetched) => fetched.message(),
        }
    }
}

/// Outcome of a non-blocking enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// Queue at capacity; the message was dropped
    Full,
    /// Subscription is shutting down; the message was discarded
    Closed,
}

/// Fixed-capacity channel between the delivery side and the worker pool.
///
/// The subscription holds the only strong sender. Closing the queue drops it,
/// after which workers drain what is left and exit.
pub(crate) struct BoundedQueue {
    sender: Option<mpsc::Sender<Delivery>>,
    receiver: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    capacity: usize,
}

impl BoundedQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender: Some(sender),
            receiver: Arc::new(Mutex::new(receiver)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handle for the broker callback; does not keep the queue open
    pub(crate) fn push_producer(&self) -> PushProducer {
        PushProducer {
            sender: self.sender.as_ref().map(mpsc::Sender::downgrade),
            capacity: self.capacity,
        }
    }

    /// Blocking enqueue used by the pull fetch loop
    pub(crate) async fn send(&self, delivery: Delivery) -> bool {
        match &self.sender {
            Some(sender) => sender.send(delivery).await.is_ok(),
            None => false,
        }
    }

    pub(crate) fn close(&mut self) {
        self.sender.take();
    }
}

/// Non-blocking producer side used from broker delivery callbacks
#[derive(Clone)]
pub(crate) struct PushProducer {
    sender: Option<mpsc::WeakSender<Delivery>>,
    capacity: usize,
}

impl PushProducer {
    pub(crate) fn try_enqueue(&self, message: Message) -> (Enqueue, usize) {
        let Some(sender) = self.sender.as_ref().and_then(mpsc::WeakSender::upgrade) else {
            return (Enqueue::Closed, 0);
        };

        match sender.try_send(Delivery::Transient(message)) {
            Ok(()) => (Enqueue::Queued, self.capacity - sender.capacity()),
            Err(mpsc::error::TrySendError::Full(_)) => (Enqueue::Full, self.capacity),
            Err(mpsc::error::TrySendError::Closed(_)) => (Enqueue::Closed, 0),
        }
    }
}

/// Everything a worker needs to process a delivery
pub(crate) struct WorkerShared {
    pub subject: String,
    pub queue: String,
    pub parent: MessageContext,
    pub handler: Arc<dyn MessageHandler>,
    pub derive_context: ContextDeriver,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Fixed set of worker tasks consuming one bounded queue
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(size: usize, queue: &BoundedQueue, shared: Arc<WorkerShared>) -> Self {
        let handles = (0..size)
            .map(|worker_id| {
                let receiver = queue.receiver.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { receiver.lock().await.recv().await };
                        match next {
                            Some(delivery) => process(&shared, worker_id, delivery).await,
                            None => break,
                        }
                    }
                    debug!(subject = %shared.subject, worker = worker_id, "Worker stopped");
                })
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to exit
    pub(crate) async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }
    }
}

async fn process(shared: &WorkerShared, worker_id: usize, delivery: Delivery) {
    let ctx = (shared.derive_context)(&shared.parent, delivery.message());
    let span = tracing::info_span!(
        "handle_message",
        subject = %shared.subject,
        queue = %shared.queue,
        worker = worker_id,
        correlation_id = ctx.correlation_id().unwrap_or_default(),
        message_id = ctx.message_id().unwrap_or_default(),
    );

    async {
        let record = |status: &str, reason: &str| {
            shared.metrics.inc_with_tags(
                CONSUME_TOTAL,
                1,
                &[
                    ("subject", shared.subject.as_str()),
                    ("queue", shared.queue.as_str()),
                    ("status", status),
                    ("reason", reason),
                ],
            );
        };

        record("received", "none");
        let start = Instant::now();
        let result = shared
            .handler
            .handle(ctx, delivery.message().clone())
            .await;
        shared.metrics.observe_with_tags(
            CONSUME_DURATION_SECONDS,
            start.elapsed().as_secs_f64(),
            &[("subject", shared.subject.as_str()), ("queue", shared.queue.as_str())],
        );

        match &result {
            Ok(()) => {
                record("processed", "none");
                debug!("Message processed");
            }
            Err(e) => {
                record("error", "handler");
                error!(error = %e, "Handler error");
            }
        }

        if let Delivery::Durable(fetched) = &delivery {
            let (kind, settled) = match result {
                Ok(()) => ("ack", fetched.ack().await),
                Err(_) => ("nak", fetched.nak().await),
            };
            if let Err(e) = settled {
                shared.metrics.inc_with_tags(
                    SETTLE_ERRORS_TOTAL,
                    1,
                    &[
                        ("subject", shared.subject.as_str()),
                        ("queue", shared.queue.as_str()),
                        ("kind", kind),
                    ],
                );
                warn!(kind = kind, error = %e, "Failed to settle message");
            }
        }
    }
    .instrument(span)
    .await
}
