//! Request-scoped context: cancellation, deadline and correlation metadata

use crate::error::{MessagingError, MessagingResult};
use crate::messaging::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation, deadline and correlation metadata passed explicitly through
/// publish and consume calls.
///
/// Cloning is cheap and clones share the same cancellation token; use
/// [`MessageContext::child`] to derive a context that can be cancelled
/// independently of its parent.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    correlation_id: Option<String>,
    message_id: Option<String>,
}

/// Builds the per-message context handed to a handler from the subscription's
/// parent context and the raw message.
pub type ContextDeriver = Arc<dyn Fn(&MessageContext, &Message) -> MessageContext + Send + Sync>;

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing cancellation token
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Derive a context cancelled together with `self` but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
            correlation_id: self.correlation_id.clone(),
            message_id: self.message_id.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when no deadline is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Error describing why the context is done, if it is
    pub fn check(&self) -> MessagingResult<()> {
        if self.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(MessagingError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancellation.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancellation.cancelled().await,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Dedup identifier of the message being handled, if any
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}

/// Default derivation: child context with a fresh correlation identifier and
/// the message's dedup identifier, if present.
pub fn default_context_deriver() -> ContextDeriver {
    Arc::new(|parent: &MessageContext, message: &Message| {
        let ctx = parent
            .child()
            .with_correlation_id(Uuid::new_v4().to_string());
        match message.dedup_id() {
            Some(id) => ctx.with_message_id(id),
            None => ctx,
        }
    })
}
