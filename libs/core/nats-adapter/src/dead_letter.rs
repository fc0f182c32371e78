//! Dead letter destination for error events.

use crate::broker::Publisher;
use crate::error::NatsError;
use crate::events::ErrorEvent;
use crate::headers;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::Context;
use async_trait::async_trait;
use bytes::Bytes;
use messaging::{Message, MessageChannel, MessageHeaders, ProcessingError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Header carrying the [`ErrorEvent::kind`] of a dead letter.
pub const ERROR_KIND: &str = "nats_error_kind";

/// Publishes each error event as JSON to `<prefix>.<kind>` and waits for the
/// broker ack. Usable as the error channel of an inbound adapter and the
/// failure channel of an async outbound handler.
pub struct DeadLetterChannel {
    name: String,
    subject_prefix: String,
    publisher: Arc<dyn Publisher>,
}

impl DeadLetterChannel {
    pub fn new(subject_prefix: impl Into<String>, publisher: Arc<dyn Publisher>) -> Self {
        let subject_prefix = subject_prefix.into();
        Self {
            name: format!("{subject_prefix}-dead-letter"),
            subject_prefix,
            publisher,
        }
    }

    pub fn subject_for(&self, event: &ErrorEvent) -> String {
        format!("{}.{}", self.subject_prefix, event.kind())
    }
}

#[async_trait]
impl MessageChannel<ErrorEvent> for DeadLetterChannel {
    async fn send(&self, message: Message<ErrorEvent>) -> Result<bool, ProcessingError> {
        let event = message.payload();
        let subject = self.subject_for(event);
        let payload = serde_json::to_vec(event)
            .map_err(|e| ProcessingError::permanent_with_source("failed to encode error event", e))?;

        let mut dl_headers = MessageHeaders::new();
        dl_headers.insert(headers::MSG_ID.to_string(), message.id().to_string());
        dl_headers.insert(ERROR_KIND.to_string(), event.kind().to_string());

        let receipt = self
            .publisher
            .publish(&subject, &dl_headers, Bytes::from(payload))
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    ProcessingError::transient_with_source("dead letter publish failed", e)
                } else {
                    ProcessingError::permanent_with_source("dead letter publish failed", e)
                }
            })?;

        debug!(
            subject = %subject,
            original_subject = %event.subject(),
            sequence = receipt.sequence,
            "Error event dead-lettered"
        );
        Ok(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ensure a JetStream stream capturing `<prefix>.>` exists for dead letters.
pub async fn ensure_dead_letter_stream(
    jetstream: &Context,
    stream: &str,
    subject_prefix: &str,
) -> Result<(), NatsError> {
    if jetstream.get_stream(stream).await.is_ok() {
        debug!(stream = %stream, "Dead letter stream already exists");
        return Ok(());
    }

    info!(stream = %stream, "Creating dead letter stream");
    jetstream
        .create_stream(StreamConfig {
            name: stream.to_string(),
            subjects: vec![format!("{subject_prefix}.>")],
            max_messages: 10_000,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            ..Default::default()
        })
        .await
        .map_err(|e| NatsError::consumer_error(format!("failed to create stream '{stream}': {e}")))?;

    info!(stream = %stream, "Dead letter stream created");
    Ok(())
}
