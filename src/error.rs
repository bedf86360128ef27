use thiserror::Error;

/// Messaging error types
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message rejected before any I/O (e.g. payload too large)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration rejected at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Context was cancelled before or during the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Context deadline elapsed before the operation started
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Broker rejected or failed to accept a publish
    #[error("Publish failed on {subject}: {source}")]
    PublishFailed {
        subject: String,
        #[source]
        source: BrokerError,
    },

    /// Flush (or bounded flush) did not complete
    #[error("Flush failed on {subject}: {source}")]
    FlushFailed {
        subject: String,
        #[source]
        source: BrokerError,
    },

    /// Subscription could not be established
    #[error("Subscribe failed on {subject}: {source}")]
    SubscribeFailed {
        subject: String,
        #[source]
        source: BrokerError,
    },

    /// Durable stream lookup or creation failed
    #[error("Stream provisioning failed for {subject}: {source}")]
    StreamProvisioning {
        subject: String,
        #[source]
        source: BrokerError,
    },

    /// Pull fetch failed for a reason other than an empty batch
    #[error("Fetch failed on {subject}: {source}")]
    FetchFailed {
        subject: String,
        #[source]
        source: BrokerError,
    },

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Requested capability is not offered by the connection
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// Subscription lifecycle violation
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl MessagingError {
    /// Whether the caller may reasonably retry the same call.
    ///
    /// Local failures (bad payload, bad configuration, cancellation) are not
    /// retryable; every failure that originates at the broker is.
    pub fn is_retryable(&self) -> bool {
        match self {
            MessagingError::Serialization(_)
            | MessagingError::InvalidMessage(_)
            | MessagingError::Configuration(_)
            | MessagingError::Cancelled
            | MessagingError::DeadlineExceeded
            | MessagingError::BackendUnavailable(_)
            | MessagingError::InvalidStateTransition(_) => false,
            MessagingError::PublishFailed { .. }
            | MessagingError::FlushFailed { .. }
            | MessagingError::SubscribeFailed { .. }
            | MessagingError::StreamProvisioning { .. }
            | MessagingError::FetchFailed { .. }
            | MessagingError::ConnectionFailed(_) => true,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            MessagingError::Serialization(_) => "SERIALIZATION_ERROR",
            MessagingError::InvalidMessage(_) => "INVALID_MESSAGE",
            MessagingError::Configuration(_) => "CONFIGURATION_ERROR",
            MessagingError::Cancelled => "CANCELLED",
            MessagingError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            MessagingError::PublishFailed { .. } => "PUBLISH_FAILED",
            MessagingError::FlushFailed { .. } => "FLUSH_FAILED",
            MessagingError::SubscribeFailed { .. } => "SUBSCRIBE_FAILED",
            MessagingError::StreamProvisioning { .. } => "STREAM_PROVISIONING_FAILED",
            MessagingError::FetchFailed { .. } => "FETCH_FAILED",
            MessagingError::ConnectionFailed(_) => "CONNECTION_FAILED",
            MessagingError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            MessagingError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }

    /// Short tag value used for the `reason` label on failure metrics
    pub fn failure_reason(&self) -> &'static str {
        match self {
            MessagingError::Serialization(_) => "serialization",
            MessagingError::InvalidMessage(_) => "invalid_message",
            MessagingError::Configuration(_) => "configuration",
            MessagingError::Cancelled => "cancelled",
            MessagingError::DeadlineExceeded => "deadline",
            MessagingError::PublishFailed { .. } => "publish",
            MessagingError::FlushFailed { .. } => "flush",
            MessagingError::SubscribeFailed { .. } => "subscribe",
            MessagingError::StreamProvisioning { .. } => "provision",
            MessagingError::FetchFailed { .. } => "fetch",
            MessagingError::ConnectionFailed(_) => "connection",
            MessagingError::BackendUnavailable(_) => "unavailable",
            MessagingError::InvalidStateTransition(_) => "state",
        }
    }
}

/// Errors reported by a broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("stream not found")]
    StreamNotFound,

    #[error("stream already exists")]
    StreamAlreadyExists,

    /// A stream with the derived name exists but captures other subjects
    #[error("stream {stream} is bound to {bound:?}")]
    SubjectConflict { stream: String, bound: Vec<String> },

    /// No stream is bound to the subject of a durable publish
    #[error("no stream bound to subject {0}")]
    NoStream(String),

    #[error("timed out")]
    Timeout,

    /// Connection gave up reconnecting or was shut down
    #[error("connection closed")]
    Closed,

    /// Ack or nak issued twice for the same delivery
    #[error("message already settled")]
    AlreadySettled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout)
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for MessagingError {
    fn from(err: validator::ValidationErrors) -> Self {
        MessagingError::Configuration(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for MessagingError {
    fn from(err: config::ConfigError) -> Self {
        MessagingError::Configuration(err.to_string())
    }
}

/// Result type alias
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Result type for broker collaborator calls
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
