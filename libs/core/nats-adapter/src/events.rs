//! Typed error events routed to error destinations.

use crate::broker::DeliveryMetadata;
use crate::error::NatsError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use messaging::{ConversionError, ErrorCategory, ProcessingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An inbound payload could not be converted. The message is left un-acked.
#[derive(Debug, Error)]
#[error("failed to convert message on '{subject}': {cause}")]
pub struct MessageConversionError {
    pub subject: String,
    pub payload: Bytes,
    pub metadata: DeliveryMetadata,
    #[source]
    pub cause: ConversionError,
}

impl MessageConversionError {
    pub fn to_event(&self) -> ErrorEvent {
        ErrorEvent::Conversion {
            subject: self.subject.clone(),
            payload: self.payload.to_vec(),
            metadata: self.metadata.clone(),
            error: self.cause.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// A message could not be delivered, either to the internal bus (inbound)
/// or to the broker (outbound).
#[derive(Debug, Error)]
#[error("{description} (subject '{subject}')")]
pub struct MessageDeliveryError {
    pub subject: String,
    pub description: String,
    pub metadata: Option<DeliveryMetadata>,
    #[source]
    pub cause: BoxError,
}

impl MessageDeliveryError {
    pub fn new(
        subject: impl Into<String>,
        description: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            description: description.into(),
            metadata: None,
            cause: Box::new(cause),
        }
    }

    pub fn with_metadata(mut self, metadata: DeliveryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Category of the underlying cause, `Transient` when unknown.
    pub fn cause_category(&self) -> ErrorCategory {
        if let Some(nats) = self.cause.downcast_ref::<NatsError>() {
            nats.category()
        } else if let Some(processing) = self.cause.downcast_ref::<ProcessingError>() {
            processing.category()
        } else {
            ErrorCategory::Transient
        }
    }

    pub fn to_event(&self) -> ErrorEvent {
        ErrorEvent::Delivery {
            subject: self.subject.clone(),
            metadata: self.metadata.clone(),
            error: self.description.clone(),
            cause: self.cause.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// Serializable error event, suitable for an error channel or dead letter subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorEvent {
    /// Inbound payload failed to convert
    Conversion {
        subject: String,
        payload: Vec<u8>,
        metadata: DeliveryMetadata,
        error: String,
        occurred_at: DateTime<Utc>,
    },

    /// Message could not be handed to its destination
    Delivery {
        subject: String,
        metadata: Option<DeliveryMetadata>,
        error: String,
        cause: String,
        occurred_at: DateTime<Utc>,
    },

    /// Async publish gave up after exhausting its resend budget
    PublishExhausted {
        subject: String,
        message_id: Uuid,
        payload: Vec<u8>,
        attempts: u32,
        failure_history: Vec<String>,
        occurred_at: DateTime<Utc>,
    },
}

impl ErrorEvent {
    pub fn subject(&self) -> &str {
        match self {
            ErrorEvent::Conversion { subject, .. }
            | ErrorEvent::Delivery { subject, .. }
            | ErrorEvent::PublishExhausted { subject, .. } => subject,
        }
    }

    /// Short label used in metrics and dead letter subjects.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorEvent::Conversion { .. } => "conversion",
            ErrorEvent::Delivery { .. } => "delivery",
            ErrorEvent::PublishExhausted { .. } => "publish_exhausted",
        }
    }
}
