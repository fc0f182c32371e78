use super::outbound_headers;
use crate::broker::{PublishReceipt, Publisher};
use crate::error::NatsError;
use crate::events::MessageDeliveryError;
use crate::metrics::AdapterMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use messaging::{ErrorCategory, Message, MessageHandler, PayloadConverter, ProcessingError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Publishes each message and waits for the broker ack. No retries.
pub struct SyncOutboundHandler<T> {
    name: String,
    subject: String,
    publisher: Arc<dyn Publisher>,
    converter: Arc<dyn PayloadConverter<T>>,
    metrics: AdapterMetrics,
}

impl<T> SyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        subject: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        converter: Arc<dyn PayloadConverter<T>>,
    ) -> Self {
        let subject = subject.into();
        let name = format!("{subject}-sync-outbound");
        Self {
            metrics: AdapterMetrics::new(&name),
            name,
            subject,
            publisher,
            converter,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish `message`. `None` is skipped and yields `Ok(None)`.
    pub async fn handle(
        &self,
        message: Option<&Message<T>>,
    ) -> Result<Option<PublishReceipt>, NatsError> {
        let Some(message) = message else {
            debug!(handler = %self.name, "No message to publish, skipping");
            return Ok(None);
        };

        let payload = self.converter.to_wire(message.payload())?;
        let headers = outbound_headers(message);
        let start = Instant::now();

        match self
            .publisher
            .publish(&self.subject, &headers, Bytes::from(payload))
            .await
        {
            Ok(receipt) => {
                self.metrics.published(start.elapsed());
                debug!(
                    handler = %self.name,
                    message_id = %message.id(),
                    stream = %receipt.stream,
                    sequence = receipt.sequence,
                    duplicate = receipt.duplicate,
                    "Message published"
                );
                Ok(Some(receipt))
            }
            Err(e) => {
                self.metrics.publish_failed("publish");
                warn!(
                    handler = %self.name,
                    message_id = %message.id(),
                    error = %e,
                    "Failed to publish message"
                );
                Err(MessageDeliveryError::new(
                    self.subject.clone(),
                    format!("failed to publish message {}", message.id()),
                    e,
                )
                .into())
            }
        }
    }
}

#[async_trait]
impl<T> MessageHandler<T> for SyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), ProcessingError> {
        match SyncOutboundHandler::handle(self, Some(&message)).await {
            Ok(_) => Ok(()),
            Err(NatsError::Conversion(e)) => Err(ProcessingError::Conversion(e)),
            Err(e) => match e.category() {
                ErrorCategory::Permanent => Err(ProcessingError::permanent_with_source(
                    "publish failed",
                    e,
                )),
                _ => Err(ProcessingError::transient_with_source("publish failed", e)),
            },
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
