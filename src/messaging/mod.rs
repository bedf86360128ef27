//! Reliable publish/subscribe over a NATS-style broker
//!
//! This module layers delivery guarantees, bounded concurrency and graceful
//! shutdown on top of a broker connection owned by the host process.
//!
//! # Features
//!
//! - **Transient publish**: JSON-encoded, flushed, bounded by the caller's deadline
//! - **Durable publish**: stream auto-provisioning and broker-side deduplication
//! - **Push consumption**: bounded queue of `concurrency × 4`, drops when saturated
//! - **Pull consumption**: durable consumer, batch fetch, ack on success, nak on failure
//! - **Graceful drain**: consumption returns only after in-flight handlers finish
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────────────────────────────────┐
//! │  Publisher   │    │               Subscriber                  │
//! ├──────────────┤    ├───────────────────────────────────────────┤
//! │ publish      │    │ push: callback ──► bounded queue ──► N    │
//! │ publish_     │    │ pull: fetch loop ─► bounded queue ──► N   │
//! │   durable    │    │                     workers (ack / nak)   │
//! └──────┬───────┘    └─────────────────────┬─────────────────────┘
//!        │        StreamProvisioner         │
//!        ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  BrokerConnection / DurableLog  (NatsBroker, InMemoryBroker)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use llm_event_bus::messaging::{
//!     Message, MessageContext, NatsBroker, NatsConfig, Publisher, PublisherConfig, Subscriber,
//!     SubscriberConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(NatsBroker::connect(&NatsConfig::default()).await?);
//!
//!     let publisher = Publisher::new(broker.clone(), PublisherConfig::default())?;
//!     let ctx = MessageContext::new();
//!     publisher.publish(&ctx, "orders.created", &serde_json::json!({"id": 1})).await?;
//!
//!     let subscriber = Subscriber::new(broker.clone(), SubscriberConfig::default())?;
//!     subscriber
//!         .consume(&ctx, "orders.created", |_ctx: MessageContext, message: Message| async move {
//!             println!("{}", String::from_utf8_lossy(&message.payload));
//!             anyhow::Ok(())
//!         })
//!         .await?;
//!
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod context;
pub mod memory;
pub mod message;
pub mod nats;
pub mod provisioner;
pub mod publisher;
pub mod subscriber;
mod worker;

pub use broker::{
    stream_name, subject_matches, BrokerConnection, DeliveryCallback, DurableLog, FetchedMessage,
    PublishAck, StreamInfo, SubscriptionHandle,
};
pub use config::{
    DeliveryMode, NatsConfig, PublisherConfig, SubscriberConfig, DEFAULT_CONSUMER_NAME,
    QUEUE_CAPACITY_MULTIPLIER,
};
pub use context::{default_context_deriver, ContextDeriver, MessageContext};
pub use memory::{ConsumerInfo, InMemoryBroker, InMemoryConfig, Settlement};
pub use message::{Headers, Message, DEDUP_HEADER};
pub use nats::NatsBroker;
pub use provisioner::StreamProvisioner;
pub use publisher::Publisher;
pub use subscriber::{MessageHandler, Subscriber, Subscription, SubscriptionState};
