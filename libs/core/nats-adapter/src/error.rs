//! Error types for the NATS adapters.

use crate::events::MessageDeliveryError;
use messaging::{ConversionError, ErrorCategory};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error that can occur in NATS adapter operations.
#[derive(Debug, Error)]
pub enum NatsError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(String),

    /// Subscription could not be created; the container stays stopped
    #[error("Subscription error for subject '{subject}': {message}")]
    Subscription {
        subject: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Payload could not be converted to or from wire bytes
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Message could not be delivered to the broker
    #[error("Delivery error: {0}")]
    Delivery(#[from] Box<MessageDeliveryError>),

    /// Broker disconnected or client buffer full
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// No stream captures the subject
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Consumer error (fetch, ack, unsubscribe)
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NatsError {
    /// Get the error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NatsError::Connection(_) => ErrorCategory::Transient,
            NatsError::Unavailable(_) => ErrorCategory::Transient,
            NatsError::Timeout(_) => ErrorCategory::Transient,
            NatsError::Consumer(_) => ErrorCategory::Transient,

            NatsError::Subscription { .. } => ErrorCategory::Permanent,
            NatsError::Conversion(_) => ErrorCategory::Permanent,
            NatsError::StreamNotFound(_) => ErrorCategory::Permanent,
            NatsError::Config(_) => ErrorCategory::Permanent,
            NatsError::Serialization(_) => ErrorCategory::Permanent,

            // Delegate to the broker cause
            NatsError::Delivery(e) => e.cause_category(),
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Create a subscription error wrapping a broker cause.
    pub fn subscription(
        subject: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Subscription {
            subject: subject.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a subscription error without an underlying cause.
    pub fn subscription_message(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscription {
            subject: subject.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn consumer_error(msg: impl std::fmt::Display) -> Self {
        Self::Consumer(msg.to_string())
    }
}

impl From<MessageDeliveryError> for NatsError {
    fn from(error: MessageDeliveryError) -> Self {
        NatsError::Delivery(Box::new(error))
    }
}
