//! Transient and durable publishing

use crate::error::{BrokerError, MessagingError, MessagingResult};
use crate::messaging::broker::{BrokerConnection, PublishAck};
use crate::messaging::config::PublisherConfig;
use crate::messaging::context::MessageContext;
use crate::messaging::message::Message;
use crate::messaging::provisioner::StreamProvisioner;
use crate::metrics::{self, MetricsSink, PUBLISH_DURATION_SECONDS, PUBLISH_TOTAL};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;
use validator::Validate;

const MODE_TRANSIENT: &str = "transient";
const MODE_DURABLE: &str = "durable";

/// Serializes values as JSON and publishes them on a broker connection it
/// does not own. No retries are performed; every error is returned to the caller.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerConnection>,
    provisioner: StreamProvisioner,
    config: Arc<PublisherConfig>,
    metrics: Arc<dyn MetricsSink>,
}

impl Publisher {
    /// Create a publisher; the configuration is validated here
    pub fn new(broker: Arc<dyn BrokerConnection>, config: PublisherConfig) -> MessagingResult<Self> {
        config.validate()?;
        Ok(Self {
            provisioner: StreamProvisioner::new(broker.clone()),
            broker,
            config: Arc::new(config),
            metrics: metrics::noop(),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Fire-and-forget publish followed by a flush.
    ///
    /// The flush is bounded by the context deadline when one is set, and waits
    /// for the connection otherwise.
    pub async fn publish<T>(&self, ctx: &MessageContext, subject: &str, message: &T) -> MessagingResult<()>
    where
        T: Serialize + ?Sized,
    {
        ctx.check()?;
        let subject = self.config.full_subject(subject);
        let start = Instant::now();
        self.record(&subject, MODE_TRANSIENT, "attempt", "none");

        let result = self.publish_transient(ctx, &subject, message).await;
        self.finish(ctx, &subject, MODE_TRANSIENT, start, &result);
        result
    }

    /// Publish through the durable log with a deduplication identifier.
    ///
    /// The stream for `subject` is provisioned first. An empty or missing
    /// `dedup_id` is replaced by a generated one, so every durable publish
    /// carries an identifier.
    pub async fn publish_durable<T>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message: &T,
        dedup_id: Option<&str>,
    ) -> MessagingResult<PublishAck>
    where
        T: Serialize + ?Sized,
    {
        ctx.check()?;
        let subject = self.config.full_subject(subject);
        let start = Instant::now();
        self.record(&subject, MODE_DURABLE, "attempt", "none");

        let result = self
            .publish_to_stream(ctx, &subject, message, dedup_id)
            .await;
        self.finish(ctx, &subject, MODE_DURABLE, start, &result);
        result
    }

    async fn publish_transient<T>(&self, ctx: &MessageContext, subject: &str, message: &T) -> MessagingResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.encode(message)?;

        self.broker
            .publish(Message::new(subject, payload))
            .await
            .map_err(|source| MessagingError::PublishFailed {
                subject: subject.to_string(),
                source,
            })?;

        let flushed = match ctx.remaining() {
            Some(remaining) => self.broker.flush_timeout(remaining).await,
            None => self.broker.flush().await,
        };
        flushed.map_err(|source| MessagingError::FlushFailed {
            subject: subject.to_string(),
            source,
        })
    }

    async fn publish_to_stream<T>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message: &T,
        dedup_id: Option<&str>,
    ) -> MessagingResult<PublishAck>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.encode(message)?;
        self.provisioner.ensure(subject).await?;

        let Some(durable) = self.broker.durable() else {
            return Err(MessagingError::BackendUnavailable(
                "durable log not offered by this connection".to_string(),
            ));
        };

        let dedup_id = match dedup_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let message = Message::new(subject, payload).with_dedup_id(dedup_id);

        let published = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, durable.publish_durable(message))
                .await
                .unwrap_or(Err(BrokerError::Timeout)),
            None => durable.publish_durable(message).await,
        };

        let ack = published.map_err(|source| MessagingError::PublishFailed {
            subject: subject.to_string(),
            source,
        })?;

        if ack.duplicate {
            debug!(subject = subject, stream = %ack.stream, sequence = ack.sequence, "Duplicate publish suppressed by broker");
        }
        Ok(ack)
    }

    fn encode<T>(&self, message: &T) -> MessagingResult<Bytes>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > self.config.max_message_size {
            return Err(MessagingError::InvalidMessage(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                payload.len(),
                self.config.max_message_size
            )));
        }
        Ok(Bytes::from(payload))
    }

    fn record(&self, subject: &str, mode: &str, status: &str, reason: &str) {
        self.metrics.inc_with_tags(
            PUBLISH_TOTAL,
            1,
            &[
                ("subject", subject),
                ("mode", mode),
                ("status", status),
                ("reason", reason),
            ],
        );
    }

    fn finish<R>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        mode: &str,
        start: Instant,
        result: &MessagingResult<R>,
    ) {
        match result {
            Ok(_) => {
                self.record(subject, mode, "success", "none");
                self.metrics.observe_with_tags(
                    PUBLISH_DURATION_SECONDS,
                    start.elapsed().as_secs_f64(),
                    &[("subject", subject), ("mode", mode)],
                );
                debug!(
                    subject = subject,
                    mode = mode,
                    correlation_id = ctx.correlation_id().unwrap_or_default(),
                    "Message published"
                );
            }
            Err(e) => {
                self.record(subject, mode, "failure", e.failure_reason());
                error!(
                    subject = subject,
                    mode = mode,
                    correlation_id = ctx.correlation_id().unwrap_or_default(),
                    error_code = e.error_code(),
                    error = %e,
                    "Publish failed"
                );
            }
        }
    }
}
