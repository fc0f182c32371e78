//! Broker primitives the containers and handlers are written against.
//!
//! `nats.rs` implements these over async-nats JetStream, `memory.rs` over an
//! in-process broker used by tests and local wiring.

use crate::config::{ConsumerProperties, DeliveryMode};
use crate::error::NatsError;
use crate::headers;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use messaging::MessageHeaders;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delivery bookkeeping the broker attaches to every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Number of times this message has been delivered, starting at 1
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeliveryMetadata {
    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }

    /// Write this metadata as `nats_*` headers.
    pub fn write_headers(&self, subject: &str, target: &mut MessageHeaders) {
        target.insert(headers::SUBJECT.to_string(), subject.to_string());
        target.insert(headers::DELIVERED.to_string(), self.delivered.to_string());
        target.insert(
            headers::STREAM_SEQUENCE.to_string(),
            self.stream_sequence.to_string(),
        );
        target.insert(
            headers::CONSUMER_SEQUENCE.to_string(),
            self.consumer_sequence.to_string(),
        );
        if let Some(timestamp) = self.timestamp {
            target.insert(headers::TIMESTAMP.to_string(), timestamp.to_rfc3339());
        }
    }

    /// Read metadata back from `nats_*` headers. `None` when the message did
    /// not come from an inbound adapter.
    pub fn from_headers(source: &MessageHeaders) -> Option<Self> {
        let number = |key: &str| source.get(key).and_then(|v| v.parse::<u64>().ok());

        Some(Self {
            delivered: number(headers::DELIVERED)?,
            stream_sequence: number(headers::STREAM_SEQUENCE)?,
            consumer_sequence: number(headers::CONSUMER_SEQUENCE)?,
            timestamp: source
                .get(headers::TIMESTAMP)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Acknowledges one delivered message.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), NatsError>;
}

/// A message as delivered by the broker, before conversion.
pub struct RawBrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: MessageHeaders,
    pub metadata: DeliveryMetadata,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl RawBrokerMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: MessageHeaders::new(),
            metadata: DeliveryMetadata::default(),
            acknowledger: None,
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_metadata(mut self, metadata: DeliveryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_acknowledger(mut self, acknowledger: Box<dyn Acknowledger>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    /// Acknowledge the message. Messages without an acknowledger (core NATS,
    /// hand-built test messages) ack trivially.
    pub async fn ack(&self) -> Result<(), NatsError> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RawBrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBrokerMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Result of handing one message to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// Processed; the container acknowledges it
    Ack,
    /// Payload could not be converted; left for redelivery
    ConversionFailed,
    /// Downstream refused or failed; left for redelivery
    DeliveryFailed,
}

impl ListenerOutcome {
    pub fn should_ack(&self) -> bool {
        matches!(self, ListenerOutcome::Ack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerOutcome::Ack => "ack",
            ListenerOutcome::ConversionFailed => "conversion_failed",
            ListenerOutcome::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Callback invoked for every delivered message.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &RawBrokerMessage) -> ListenerOutcome;
}

/// Listener backed by a synchronous closure.
pub struct ListenerFn<F>(F);

/// Wrap a closure as a [`MessageListener`].
pub fn listener_fn<F>(f: F) -> ListenerFn<F>
where
    F: Fn(&RawBrokerMessage) -> ListenerOutcome + Send + Sync,
{
    ListenerFn(f)
}

#[async_trait]
impl<F> MessageListener for ListenerFn<F>
where
    F: Fn(&RawBrokerMessage) -> ListenerOutcome + Send + Sync,
{
    async fn on_message(&self, message: &RawBrokerMessage) -> ListenerOutcome {
        (self.0)(message)
    }
}

/// A live consumer binding, owned by exactly one container.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `max_wait` for at most `batch_size` messages.
    async fn poll(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawBrokerMessage>, NatsError>;

    /// Release the binding. Called once per subscription.
    async fn unsubscribe(&mut self) -> Result<(), NatsError>;

    fn subject(&self) -> &str;
}

/// Creates subscriptions for one consumer identity.
#[async_trait]
pub trait SubscriptionFactory: Send + Sync {
    fn properties(&self) -> &ConsumerProperties;

    /// Single attempt, no retries. `PushAsync` requires `listener`; the other
    /// modes ignore it.
    async fn create_subscription(
        &self,
        mode: DeliveryMode,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<Box<dyn Subscription>, NatsError>;
}

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Resolves when the broker acknowledges (or rejects) a publish.
pub type AckFuture = BoxFuture<'static, Result<PublishReceipt, NatsError>>;

/// Thin publish primitive used by the outbound handlers.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hand the message to the client without waiting for the broker ack.
    /// Buffer-full and disconnected conditions are `NatsError::Unavailable`.
    async fn publish_async(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> Result<AckFuture, NatsError>;

    /// Publish and wait for the broker ack.
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> Result<PublishReceipt, NatsError> {
        self.publish_async(subject, headers, payload).await?.await
    }

    /// Whether the client currently has a broker connection.
    fn is_connected(&self) -> bool {
        true
    }
}
