//! JetStream implementations of the broker primitives.

use crate::broker::{
    AckFuture, Acknowledger, DeliveryMetadata, MessageListener, PublishReceipt, Publisher,
    RawBrokerMessage, Subscription, SubscriptionFactory,
};
use crate::config::{ConsumerProperties, DeliveryMode};
use crate::dispatch::spawn_dispatcher;
use crate::error::NatsError;
use async_nats::jetstream::consumer::{pull, push, AckPolicy, Consumer};
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::stream::Stream as JetStream;
use async_nats::jetstream::{self, Context};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use core_config::nats::NatsConfig;
use futures::{FutureExt, StreamExt};
use messaging::MessageHeaders;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect to NATS with the given settings.
pub async fn connect(config: &NatsConfig) -> Result<Client, NatsError> {
    info!(url = %config.url, client_name = %config.client_name, "Connecting to NATS");

    let options = ConnectOptions::default()
        .name(&config.client_name)
        .connection_timeout(config.connect_timeout)
        .retry_on_initial_connect();

    async_nats::connect_with_options(config.url.as_str(), options)
        .await
        .map_err(|e| NatsError::Connection(e.to_string()))
}

/// Creates JetStream subscriptions for one consumer identity.
#[derive(Clone)]
pub struct NatsSubscriptionFactory {
    client: Client,
    jetstream: Context,
    properties: ConsumerProperties,
}

impl NatsSubscriptionFactory {
    pub fn new(client: Client, properties: ConsumerProperties) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            properties,
        }
    }

    async fn stream(&self) -> Result<JetStream, NatsError> {
        let props = &self.properties;
        self.jetstream
            .get_stream(props.stream())
            .await
            .map_err(|e| {
                NatsError::subscription(
                    props.subject(),
                    format!("stream '{}' not available", props.stream()),
                    e,
                )
            })
    }

    async fn pull_consumer(&self) -> Result<Consumer<pull::Config>, NatsError> {
        let props = &self.properties;
        let stream = self.stream().await?;

        let config = pull::Config {
            durable_name: props.consumer_name().map(str::to_string),
            ack_policy: AckPolicy::Explicit,
            ack_wait: props.ack_wait(),
            max_deliver: props.max_deliver(),
            filter_subject: props.subject().to_string(),
            ..Default::default()
        };

        match props.consumer_name() {
            Some(durable) if props.bind_only() => stream.get_consumer(durable).await.map_err(|e| {
                NatsError::subscription_message(
                    props.subject(),
                    format!("pull consumer '{durable}' not found: {e}"),
                )
            }),
            Some(durable) => stream
                .get_or_create_consumer(durable, config)
                .await
                .map_err(|e| NatsError::subscription(props.subject(), "failed to bind pull consumer", e)),
            None => stream
                .create_consumer(config)
                .await
                .map_err(|e| NatsError::subscription(props.subject(), "failed to create pull consumer", e)),
        }
    }

    async fn push_consumer(&self) -> Result<Consumer<push::Config>, NatsError> {
        let props = &self.properties;
        let stream = self.stream().await?;

        // Queue group members must agree on the deliver subject
        let deliver_subject = match props.consumer_name() {
            Some(name) => format!("_deliver.{}.{}", props.stream(), name),
            None => self.client.new_inbox(),
        };
        let config = push::Config {
            deliver_subject,
            deliver_group: props.queue_group().map(str::to_string),
            durable_name: props.consumer_name().map(str::to_string),
            ack_policy: AckPolicy::Explicit,
            ack_wait: props.ack_wait(),
            max_deliver: props.max_deliver(),
            filter_subject: props.subject().to_string(),
            ..Default::default()
        };

        match props.consumer_name() {
            Some(durable) if props.bind_only() => stream.get_consumer(durable).await.map_err(|e| {
                NatsError::subscription_message(
                    props.subject(),
                    format!("push consumer '{durable}' not found: {e}"),
                )
            }),
            Some(durable) => stream
                .get_or_create_consumer(durable, config)
                .await
                .map_err(|e| NatsError::subscription(props.subject(), "failed to bind push consumer", e)),
            None => stream
                .create_consumer(config)
                .await
                .map_err(|e| NatsError::subscription(props.subject(), "failed to create push consumer", e)),
        }
    }
}

#[async_trait]
impl SubscriptionFactory for NatsSubscriptionFactory {
    fn properties(&self) -> &ConsumerProperties {
        &self.properties
    }

    async fn create_subscription(
        &self,
        mode: DeliveryMode,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<Box<dyn Subscription>, NatsError> {
        let props = &self.properties;
        debug!(
            stream = %props.stream(),
            subject = %props.subject(),
            consumer = ?props.consumer_name(),
            mode = %mode,
            "Creating JetStream subscription"
        );

        match mode {
            DeliveryMode::Pull => {
                let consumer = self.pull_consumer().await?;
                Ok(Box::new(PullSubscription {
                    consumer: Some(consumer),
                    subject: props.subject().to_string(),
                }))
            }
            DeliveryMode::PushSync => Ok(Box::new(self.push_subscription().await?)),
            DeliveryMode::PushAsync => {
                let listener = listener.ok_or_else(|| {
                    NatsError::subscription_message(
                        props.subject(),
                        "push_async subscriptions require a listener",
                    )
                })?;
                let subscription = self.push_subscription().await?;
                Ok(spawn_dispatcher(
                    format!("{}-dispatcher", props.consumer_name().unwrap_or(props.subject())),
                    Box::new(subscription),
                    listener,
                    props.pull_batch_size(),
                    props.max_wait(),
                ))
            }
        }
    }
}

impl NatsSubscriptionFactory {
    async fn push_subscription(&self) -> Result<PushSubscription, NatsError> {
        let consumer = self.push_consumer().await?;
        let messages = consumer.messages().await.map_err(|e| {
            NatsError::subscription(self.properties.subject(), "failed to subscribe to push consumer", e)
        })?;
        Ok(PushSubscription {
            messages: Some(messages),
            subject: self.properties.subject().to_string(),
        })
    }
}

struct PullSubscription {
    consumer: Option<Consumer<pull::Config>>,
    subject: String,
}

#[async_trait]
impl Subscription for PullSubscription {
    async fn poll(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawBrokerMessage>, NatsError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| NatsError::Consumer(format!("subscription on '{}' is closed", self.subject)))?;

        let mut batch = consumer
            .batch()
            .max_messages(batch_size)
            .expires(max_wait)
            .messages()
            .await
            .map_err(NatsError::consumer_error)?;

        let mut messages = Vec::with_capacity(batch_size);
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => messages.push(to_raw(message)),
                Err(e) => warn!(subject = %self.subject, error = %e, "Error receiving pulled message"),
            }
        }
        Ok(messages)
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsError> {
        // Durable pull consumers stay on the server; the binding is simply dropped
        self.consumer.take();
        Ok(())
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

struct PushSubscription {
    messages: Option<push::Messages>,
    subject: String,
}

#[async_trait]
impl Subscription for PushSubscription {
    async fn poll(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawBrokerMessage>, NatsError> {
        let messages = self
            .messages
            .as_mut()
            .ok_or_else(|| NatsError::Consumer(format!("subscription on '{}' is closed", self.subject)))?;

        let first = match tokio::time::timeout(max_wait, messages.next()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => {
                return Err(NatsError::Consumer(format!(
                    "push subscription on '{}' ended",
                    self.subject
                )))
            }
            Ok(Some(first)) => first.map_err(NatsError::consumer_error)?,
        };

        let mut batch = vec![to_raw(first)];
        // Drain whatever is already buffered, without waiting
        while batch.len() < batch_size {
            match messages.next().now_or_never() {
                Some(Some(Ok(message))) => batch.push(to_raw(message)),
                Some(Some(Err(e))) => {
                    warn!(subject = %self.subject, error = %e, "Error receiving pushed message");
                    break;
                }
                _ => break,
            }
        }
        Ok(batch)
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsError> {
        // Dropping the message stream unsubscribes from the deliver subject
        self.messages.take();
        Ok(())
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

struct JetStreamAcknowledger(jetstream::Message);

#[async_trait]
impl Acknowledger for JetStreamAcknowledger {
    async fn ack(&self) -> Result<(), NatsError> {
        self.0.ack().await.map_err(NatsError::consumer_error)
    }
}

fn to_raw(message: jetstream::Message) -> RawBrokerMessage {
    let metadata = match message.info() {
        Ok(info) => DeliveryMetadata {
            delivered: info.delivered.max(0) as u64,
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            timestamp: DateTime::from_timestamp(
                info.published.unix_timestamp(),
                info.published.nanosecond(),
            ),
        },
        Err(e) => {
            warn!(error = %e, "Failed to read message info, using defaults");
            DeliveryMetadata {
                delivered: 1,
                ..Default::default()
            }
        }
    };

    let mut headers = MessageHeaders::new();
    if let Some(map) = &message.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }

    RawBrokerMessage::new(message.subject.to_string(), message.payload.clone())
        .with_headers(headers)
        .with_metadata(metadata)
        .with_acknowledger(Box::new(JetStreamAcknowledger(message)))
}

/// Publishes to JetStream, returning the ack as a future.
#[derive(Clone)]
pub struct NatsPublisher {
    client: Client,
    jetstream: Context,
}

impl NatsPublisher {
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }
}

fn map_publish_error(subject: &str, error: jetstream::context::PublishError) -> NatsError {
    match error.kind() {
        PublishErrorKind::StreamNotFound => {
            NatsError::StreamNotFound(format!("no matching stream for subject '{subject}'"))
        }
        PublishErrorKind::TimedOut => NatsError::Timeout(format!("publish ack for '{subject}': {error}")),
        _ => NatsError::Unavailable(format!("publish to '{subject}' rejected: {error}")),
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish_async(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> Result<AckFuture, NatsError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| map_publish_error(subject, e))?;

        let subject = subject.to_string();
        Ok(async move {
            let ack = ack.await.map_err(|e| map_publish_error(&subject, e))?;
            Ok(PublishReceipt {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        }
        .boxed())
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}
