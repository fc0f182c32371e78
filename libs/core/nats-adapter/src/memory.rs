//! In-process broker with JetStream-like streams and durable consumers.
//!
//! Messages are stored per stream, consumers track pending and outstanding
//! deliveries, unacknowledged deliveries come back after `ack_wait` until
//! `max_deliver` is reached. The broker can be switched unavailable to
//! simulate an outage.

use crate::broker::{
    AckFuture, Acknowledger, DeliveryMetadata, MessageListener, PublishReceipt, Publisher,
    RawBrokerMessage, Subscription, SubscriptionFactory,
};
use crate::config::{ConsumerProperties, DeliveryMode};
use crate::dispatch::spawn_dispatcher;
use crate::error::NatsError;
use crate::headers;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use messaging::MessageHeaders;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A message stored in an in-memory stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub headers: MessageHeaders,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct StreamState {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    message_ids: HashMap<String, u64>,
    consumers: HashMap<String, ConsumerState>,
}

struct ConsumerState {
    filter: String,
    ack_wait: Duration,
    max_deliver: i64,
    pending: VecDeque<u64>,
    /// stream sequence -> redelivery deadline
    outstanding: HashMap<u64, Instant>,
    deliveries: HashMap<u64, u64>,
    acked: HashSet<u64>,
    consumer_sequence: u64,
    /// Live subscriptions bound to this consumer.
    subscribers: usize,
}

impl ConsumerState {
    fn requeue_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();

        for seq in expired.into_iter().rev() {
            self.outstanding.remove(&seq);
            let delivered = self.deliveries.get(&seq).copied().unwrap_or(0);
            if self.max_deliver > 0 && delivered >= self.max_deliver as u64 {
                debug!(sequence = seq, delivered, "Max deliver reached, dropping message");
                continue;
            }
            self.pending.push_front(seq);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    streams: Mutex<HashMap<String, StreamState>>,
    unavailable: AtomicBool,
    ack_delay_ms: AtomicU64,
    subscriptions_created: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl BrokerState {
    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), NatsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(NatsError::Unavailable("broker connection lost".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Shared handle to an in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace the subjects of) a stream.
    pub fn create_stream(&self, name: &str, subjects: &[&str]) {
        let mut streams = self.state.streams();
        let stream = streams.entry(name.to_string()).or_default();
        stream.subjects = subjects.iter().map(|s| s.to_string()).collect();
        info!(stream = %name, subjects = ?subjects, "Created in-memory stream");
    }

    pub fn delete_stream(&self, name: &str) -> bool {
        self.state.streams().remove(name).is_some()
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
        info!(available, "In-memory broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }

    /// Delay every publish acknowledgement by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state
            .ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn subscriptions_created(&self) -> usize {
        self.state.subscriptions_created.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }

    /// All messages stored in `stream`.
    pub fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        self.state
            .streams()
            .get(stream)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// How many times `sequence` has been delivered to `consumer`.
    pub fn delivery_count(&self, stream: &str, consumer: &str, sequence: u64) -> u64 {
        self.with_consumer(stream, consumer, |c| {
            c.deliveries.get(&sequence).copied().unwrap_or(0)
        })
        .unwrap_or(0)
    }

    pub fn acked_count(&self, stream: &str, consumer: &str) -> usize {
        self.with_consumer(stream, consumer, |c| c.acked.len())
            .unwrap_or(0)
    }

    /// Messages not yet acknowledged: waiting plus outstanding.
    pub fn unacked_count(&self, stream: &str, consumer: &str) -> usize {
        self.with_consumer(stream, consumer, |c| c.pending.len() + c.outstanding.len())
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, stream: &str, consumer: &str) -> bool {
        self.with_consumer(stream, consumer, |_| ()).is_some()
    }

    /// Subscription factory for one consumer identity on this broker.
    pub fn subscription_factory(&self, properties: ConsumerProperties) -> InMemorySubscriptionFactory {
        InMemorySubscriptionFactory {
            broker: self.clone(),
            properties,
        }
    }

    fn with_consumer<R>(
        &self,
        stream: &str,
        consumer: &str,
        f: impl FnOnce(&ConsumerState) -> R,
    ) -> Option<R> {
        self.state
            .streams()
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(f)
    }

    fn store(&self, subject: &str, headers: &MessageHeaders, payload: Bytes) -> Result<PublishReceipt, NatsError> {
        self.state.check_available()?;

        let mut streams = self.state.streams();
        let (name, stream) = streams
            .iter_mut()
            .find(|(_, s)| s.subjects.iter().any(|f| subject_matches(f, subject)))
            .ok_or_else(|| {
                NatsError::StreamNotFound(format!("no matching stream for subject '{subject}'"))
            })?;

        if let Some(id) = headers.get(headers::MSG_ID) {
            if let Some(sequence) = stream.message_ids.get(id) {
                return Ok(PublishReceipt {
                    stream: name.clone(),
                    sequence: *sequence,
                    duplicate: true,
                });
            }
        }

        let sequence = stream.messages.len() as u64 + 1;
        stream.messages.push(StoredMessage {
            sequence,
            subject: subject.to_string(),
            headers: headers.clone(),
            payload,
            timestamp: Utc::now(),
        });
        if let Some(id) = headers.get(headers::MSG_ID) {
            stream.message_ids.insert(id.clone(), sequence);
        }
        for consumer in stream.consumers.values_mut() {
            if subject_matches(&consumer.filter, subject) {
                consumer.pending.push_back(sequence);
            }
        }

        Ok(PublishReceipt {
            stream: name.clone(),
            sequence,
            duplicate: false,
        })
    }

    fn bind_consumer(&self, properties: &ConsumerProperties) -> Result<(String, bool), NatsError> {
        let subject = properties.subject();
        if let Err(e) = self.state.check_available() {
            return Err(NatsError::subscription(subject, "broker unreachable", e));
        }

        let mut streams = self.state.streams();
        let stream = streams.get_mut(properties.stream()).ok_or_else(|| {
            NatsError::subscription(
                subject,
                format!("stream '{}' not found", properties.stream()),
                NatsError::StreamNotFound(properties.stream().to_string()),
            )
        })?;

        // Queue group members without a durable share one ephemeral consumer
        let ephemeral = properties.durable_name().is_none();
        let name = match properties.consumer_name() {
            Some(name) => name.to_string(),
            None => format!("ephemeral-{}", uuid::Uuid::new_v4()),
        };

        if !stream.consumers.contains_key(&name) {
            if properties.bind_only() {
                return Err(NatsError::subscription_message(
                    subject,
                    format!("consumer '{name}' not found and bind-only is set"),
                ));
            }
            let pending = stream
                .messages
                .iter()
                .filter(|m| subject_matches(subject, &m.subject))
                .map(|m| m.sequence)
                .collect();
            stream.consumers.insert(
                name.clone(),
                ConsumerState {
                    filter: subject.to_string(),
                    ack_wait: properties.ack_wait(),
                    max_deliver: properties.max_deliver(),
                    pending,
                    outstanding: HashMap::new(),
                    deliveries: HashMap::new(),
                    acked: HashSet::new(),
                    consumer_sequence: 0,
                    subscribers: 0,
                },
            );
            debug!(stream = %properties.stream(), consumer = %name, "Created in-memory consumer");
        }
        if let Some(consumer) = stream.consumers.get_mut(&name) {
            consumer.subscribers += 1;
        }

        Ok((name, ephemeral))
    }

    /// Take up to `batch_size` deliveries for `consumer`.
    fn take(&self, stream_name: &str, consumer_name: &str, batch_size: usize) -> Result<Vec<RawBrokerMessage>, NatsError> {
        self.state.check_available()?;

        let mut streams = self.state.streams();
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| NatsError::StreamNotFound(stream_name.to_string()))?;
        let StreamState {
            messages, consumers, ..
        } = stream;
        let consumer = consumers
            .get_mut(consumer_name)
            .ok_or_else(|| NatsError::Consumer(format!("consumer '{consumer_name}' deleted")))?;

        let now = Instant::now();
        consumer.requeue_expired(now);

        let mut batch = Vec::new();
        while batch.len() < batch_size {
            let Some(sequence) = consumer.pending.pop_front() else {
                break;
            };
            let Some(stored) = messages.get(sequence as usize - 1) else {
                continue;
            };

            let delivered = consumer.deliveries.entry(sequence).or_insert(0);
            *delivered += 1;
            consumer.consumer_sequence += 1;
            consumer.outstanding.insert(sequence, now + consumer.ack_wait);

            let metadata = DeliveryMetadata {
                delivered: *delivered,
                stream_sequence: sequence,
                consumer_sequence: consumer.consumer_sequence,
                timestamp: Some(stored.timestamp),
            };
            batch.push(
                RawBrokerMessage::new(stored.subject.clone(), stored.payload.clone())
                    .with_headers(stored.headers.clone())
                    .with_metadata(metadata)
                    .with_acknowledger(Box::new(MemoryAcknowledger {
                        state: self.state.clone(),
                        stream: stream_name.to_string(),
                        consumer: consumer_name.to_string(),
                        sequence,
                    })),
            );
        }

        Ok(batch)
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish_async(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> Result<AckFuture, NatsError> {
        let receipt = self.store(subject, headers, payload);
        let delay = Duration::from_millis(self.state.ack_delay_ms.load(Ordering::SeqCst));

        Ok(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            receipt
        }
        .boxed())
    }

    fn is_connected(&self) -> bool {
        self.is_available()
    }
}

struct MemoryAcknowledger {
    state: Arc<BrokerState>,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> Result<(), NatsError> {
        self.state.check_available()?;
        let mut streams = self.state.streams();
        if let Some(consumer) = streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.consumer))
        {
            consumer.outstanding.remove(&self.sequence);
            consumer.acked.insert(self.sequence);
        }
        Ok(())
    }
}

/// Subscription factory bound to an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemorySubscriptionFactory {
    broker: InMemoryBroker,
    properties: ConsumerProperties,
}

#[async_trait]
impl SubscriptionFactory for InMemorySubscriptionFactory {
    fn properties(&self) -> &ConsumerProperties {
        &self.properties
    }

    async fn create_subscription(
        &self,
        mode: DeliveryMode,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<Box<dyn Subscription>, NatsError> {
        let subject = self.properties.subject();
        if mode == DeliveryMode::PushAsync && listener.is_none() {
            return Err(NatsError::subscription_message(
                subject,
                "push_async subscriptions require a listener",
            ));
        }

        let (consumer, ephemeral) = self.broker.bind_consumer(&self.properties)?;
        self.broker
            .state
            .subscriptions_created
            .fetch_add(1, Ordering::SeqCst);

        let subscription = Box::new(MemorySubscription {
            broker: self.broker.clone(),
            stream: self.properties.stream().to_string(),
            consumer: consumer.clone(),
            subject: subject.to_string(),
            ephemeral,
            closed: false,
        });

        match (mode, listener) {
            (DeliveryMode::PushAsync, Some(listener)) => Ok(spawn_dispatcher(
                format!("{consumer}-dispatcher"),
                subscription,
                listener,
                self.properties.pull_batch_size(),
                self.properties.max_wait(),
            )),
            _ => Ok(subscription),
        }
    }
}

struct MemorySubscription {
    broker: InMemoryBroker,
    stream: String,
    consumer: String,
    subject: String,
    ephemeral: bool,
    closed: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawBrokerMessage>, NatsError> {
        if self.closed {
            return Err(NatsError::Consumer(format!(
                "subscription on '{}' is closed",
                self.subject
            )));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let batch = self.broker.take(&self.stream, &self.consumer, batch_size.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.broker
            .state
            .unsubscribes
            .fetch_add(1, Ordering::SeqCst);

        if let Some(stream) = self.broker.state.streams().get_mut(&self.stream) {
            let remaining = stream.consumers.get_mut(&self.consumer).map(|consumer| {
                consumer.subscribers = consumer.subscribers.saturating_sub(1);
                consumer.subscribers
            });
            if self.ephemeral && remaining == Some(0) {
                stream.consumers.remove(&self.consumer);
            }
        }
        Ok(())
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

/// NATS subject matching with `*` (one token) and `>` (one or more trailing tokens).
pub(crate) fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
