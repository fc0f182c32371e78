//! Inbound adapter: broker messages in, internal bus messages out.

use crate::broker::{ListenerOutcome, MessageListener, RawBrokerMessage};
use crate::container::MessageListenerContainer;
use crate::error::NatsError;
use crate::events::{ErrorEvent, MessageConversionError, MessageDeliveryError};
use crate::lifecycle::Lifecycle;
use crate::metrics::AdapterMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use messaging::{Message, MessageChannel, PayloadConverter, ProcessingError};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Converts every delivered message and sends it to an output channel.
///
/// Failures never escape a delivery: they become [`ErrorEvent`]s on the
/// error channel (or an error log) and the message is left un-acked for
/// redelivery.
pub struct NatsInboundAdapter<T>
where
    T: Send + Sync + 'static,
{
    name: String,
    container: Arc<dyn MessageListenerContainer>,
    listener: Arc<InboundListener<T>>,
    initialized: AtomicBool,
}

impl<T> NatsInboundAdapter<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        container: Arc<dyn MessageListenerContainer>,
        converter: Arc<dyn PayloadConverter<T>>,
        output: Arc<dyn MessageChannel<T>>,
    ) -> Self {
        let name = name.into();
        let listener = Arc::new(InboundListener {
            metrics: AdapterMetrics::new(&name),
            name: name.clone(),
            converter,
            output,
            error_channel: None,
        });

        Self {
            name,
            container,
            listener,
            initialized: AtomicBool::new(false),
        }
    }

    /// Route conversion and delivery failures to `channel` instead of the log.
    /// Ignored once the adapter has been initialized.
    pub fn with_error_channel(mut self, channel: Arc<dyn MessageChannel<ErrorEvent>>) -> Self {
        match Arc::get_mut(&mut self.listener) {
            Some(listener) => listener.error_channel = Some(channel),
            None => warn!(adapter = %self.name, "Listener already registered, error channel ignored"),
        }
        self
    }

    pub fn container(&self) -> &Arc<dyn MessageListenerContainer> {
        &self.container
    }

    /// Take ownership of the container's lifecycle and register the listener.
    /// Runs once; later calls do nothing.
    pub fn on_init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.container.set_auto_startup(false);
        self.container.set_listener(self.listener.clone());
        debug!(adapter = %self.name, container = %self.container.name(), "Inbound adapter initialized");
    }
}

#[async_trait]
impl<T> Lifecycle for NatsInboundAdapter<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), NatsError> {
        self.on_init();
        self.container.start().await
    }

    async fn stop(&self) -> Result<(), NatsError> {
        self.container.stop().await
    }

    fn is_running(&self) -> bool {
        self.container.is_running()
    }
}

struct InboundListener<T>
where
    T: Send + Sync + 'static,
{
    name: String,
    converter: Arc<dyn PayloadConverter<T>>,
    output: Arc<dyn MessageChannel<T>>,
    error_channel: Option<Arc<dyn MessageChannel<ErrorEvent>>>,
    metrics: AdapterMetrics,
}

impl<T> InboundListener<T>
where
    T: Send + Sync + 'static,
{
    async fn route_error(&self, event: ErrorEvent) {
        let kind = event.kind();
        self.metrics.error_event(kind);

        let Some(channel) = &self.error_channel else {
            error!(adapter = %self.name, kind, event = ?event, "No error channel, dropping error event");
            return;
        };

        match channel.send(Message::new(event)).await {
            Ok(true) => {}
            Ok(false) => error!(adapter = %self.name, kind, "Error channel rejected error event"),
            Err(e) => error!(adapter = %self.name, kind, error = %e, "Failed to send error event"),
        }
    }
}

#[async_trait]
impl<T> MessageListener for InboundListener<T>
where
    T: Send + Sync + 'static,
{
    async fn on_message(&self, raw: &RawBrokerMessage) -> ListenerOutcome {
        let payload = match self.converter.from_wire(&raw.payload) {
            Ok(payload) => payload,
            Err(cause) => {
                let error = MessageConversionError {
                    subject: raw.subject.clone(),
                    payload: raw.payload.clone(),
                    metadata: raw.metadata.clone(),
                    cause,
                };
                warn!(
                    adapter = %self.name,
                    subject = %raw.subject,
                    delivered = raw.metadata.delivered,
                    error = %error,
                    "Failed to convert inbound message"
                );
                self.route_error(error.to_event()).await;
                return ListenerOutcome::ConversionFailed;
            }
        };

        let mut headers = raw.headers.clone();
        raw.metadata.write_headers(&raw.subject, &mut headers);
        let message = Message::builder(payload).headers(headers).build();

        let sent = AssertUnwindSafe(self.output.send(message))
            .catch_unwind()
            .await;

        let cause = match sent {
            Ok(Ok(true)) => {
                debug!(
                    adapter = %self.name,
                    subject = %raw.subject,
                    stream_sequence = raw.metadata.stream_sequence,
                    "Inbound message delivered"
                );
                return ListenerOutcome::Ack;
            }
            Ok(Ok(false)) => ProcessingError::transient(format!(
                "output channel '{}' rejected the message",
                self.output.name()
            )),
            Ok(Err(e)) => e,
            Err(_) => ProcessingError::permanent(format!(
                "output channel '{}' panicked",
                self.output.name()
            )),
        };

        let error = MessageDeliveryError::new(
            raw.subject.clone(),
            "failed to deliver inbound message to the output channel",
            cause,
        )
        .with_metadata(raw.metadata.clone());
        warn!(
            adapter = %self.name,
            subject = %raw.subject,
            delivered = raw.metadata.delivered,
            error = %error,
            "Inbound message not delivered"
        );
        self.route_error(error.to_event()).await;
        ListenerOutcome::DeliveryFailed
    }
}
