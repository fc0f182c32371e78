use super::outbound_headers;
use crate::ack_queue::AckTrackingQueue;
use crate::broker::{PublishReceipt, Publisher};
use crate::config::ProducerConfig;
use crate::error::NatsError;
use crate::events::ErrorEvent;
use crate::headers;
use crate::metrics::AdapterMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use messaging::{
    BackoffStrategy, Message, MessageChannel, MessageHandler, PayloadConverter, ProcessingError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Final state of one `send`, as seen by its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Acknowledged(PublishReceipt),
    /// Publish failed and the message was scheduled for resend attempt `attempt`.
    /// The resend is tracked under its own ticket.
    Resent { attempt: u32 },
    /// Resend budget exhausted; the message was escalated.
    Failed { reason: String },
}

/// Resolves once the broker acks the publish or the failure path has run.
#[derive(Debug)]
pub struct AckTicket {
    rx: oneshot::Receiver<AckStatus>,
}

impl AckTicket {
    pub async fn wait(self) -> AckStatus {
        self.rx.await.unwrap_or_else(|_| AckStatus::Failed {
            reason: "ack tracking dropped".to_string(),
        })
    }
}

struct InFlightPublish<T> {
    message: Message<T>,
    payload: Bytes,
    resend_count: u32,
    completion: Option<oneshot::Sender<AckStatus>>,
}

impl<T> InFlightPublish<T> {
    fn complete(&mut self, status: AckStatus) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(status);
        }
    }
}

/// Publishes without waiting for the broker ack, tracking every publish in a
/// bounded [`AckTrackingQueue`].
///
/// Broker outages never surface to the caller: failed publishes are resent
/// with the same message id (so JetStream dedup drops duplicates) until
/// `max_resend_count` is exhausted, then escalated as
/// [`ErrorEvent::PublishExhausted`]. Once the queue passes the backpressure
/// threshold, sends are slowed down before enqueueing.
pub struct AsyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T>
where
    T: Send + Sync + 'static,
{
    name: String,
    config: ProducerConfig,
    publisher: Arc<dyn Publisher>,
    converter: Arc<dyn PayloadConverter<T>>,
    queue: AckTrackingQueue<InFlightPublish<T>>,
    resend_channel: Option<Arc<dyn MessageChannel<T>>>,
    failure_channel: Option<Arc<dyn MessageChannel<ErrorEvent>>>,
    resend_backoff: BackoffStrategy,
    slowdown_factor: AtomicU32,
    pending_resends: AtomicUsize,
    closed: AtomicBool,
    metrics: AdapterMetrics,
}

impl<T> AsyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        config: ProducerConfig,
        publisher: Arc<dyn Publisher>,
        converter: Arc<dyn PayloadConverter<T>>,
    ) -> Self {
        let name = format!("{}-async-outbound", config.subject);
        let queue =
            AckTrackingQueue::new(config.ack_queue_capacity, config.ack_queue_capacity_timeout);
        Self {
            inner: Arc::new(Inner {
                metrics: AdapterMetrics::new(&name),
                name,
                config,
                publisher,
                converter,
                queue,
                resend_channel: None,
                failure_channel: None,
                resend_backoff: BackoffStrategy::default(),
                slowdown_factor: AtomicU32::new(0),
                pending_resends: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Apply a builder setting. Ignored once the handler has been cloned.
    fn configure(mut self, setting: &str, apply: impl FnOnce(&mut Inner<T>)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => apply(inner),
            None => warn!(handler = %self.inner.name, setting, "Handler already shared, setting ignored"),
        }
        self
    }

    /// Send failed publishes here instead of back into this handler.
    pub fn with_resend_channel(self, channel: Arc<dyn MessageChannel<T>>) -> Self {
        self.configure("resend_channel", |inner| inner.resend_channel = Some(channel))
    }

    /// Destination for [`ErrorEvent::PublishExhausted`]; logged when unset.
    pub fn with_failure_channel(self, channel: Arc<dyn MessageChannel<ErrorEvent>>) -> Self {
        self.configure("failure_channel", |inner| inner.failure_channel = Some(channel))
    }

    pub fn with_resend_backoff(self, backoff: BackoffStrategy) -> Self {
        self.configure("resend_backoff", |inner| inner.resend_backoff = backoff)
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Publish `message` and return as soon as it is tracked.
    ///
    /// Only conversion failures and sends after [`close`](Self::close) are
    /// returned as errors.
    pub async fn send(&self, message: Message<T>) -> Result<AckTicket, NatsError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NatsError::Config(format!(
                "handler '{}' is closed",
                self.inner.name
            )));
        }
        self.inner.send(message).await
    }

    /// Entries currently awaiting a broker ack.
    pub fn in_flight(&self) -> usize {
        self.inner.queue.len()
    }

    /// Ack queue occupancy as a percentage of capacity.
    pub fn occupancy(&self) -> u32 {
        self.inner.queue.occupancy_percent()
    }

    /// Current backpressure multiplier, 0 when sends are not slowed down.
    pub fn slowdown_factor(&self) -> u32 {
        self.inner.slowdown_factor.load(Ordering::SeqCst)
    }

    /// Reject new sends and wait up to `timeout` for in-flight publishes and
    /// scheduled resends. Returns whether everything drained.
    pub async fn close(&self, timeout: Duration) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let drained = self.inner.queue.wait_empty(remaining).await;
            if drained && self.inner.pending_resends.load(Ordering::SeqCst) == 0 {
                info!(handler = %self.inner.name, "Async outbound handler closed");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    handler = %self.inner.name,
                    in_flight = self.inner.queue.len(),
                    pending_resends = self.inner.pending_resends.load(Ordering::SeqCst),
                    "Async outbound handler closed with publishes outstanding"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl<T> Inner<T>
where
    T: Send + Sync + 'static,
{
    async fn send(self: &Arc<Self>, message: Message<T>) -> Result<AckTicket, NatsError> {
        let payload = Bytes::from(self.converter.to_wire(message.payload())?);
        let resend_count = message
            .header(headers::RESEND_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let message_headers = outbound_headers(&message);

        self.apply_backpressure().await;

        let (tx, rx) = oneshot::channel();
        let entry = InFlightPublish {
            message,
            payload: payload.clone(),
            resend_count,
            completion: Some(tx),
        };

        let id = match self.queue.enqueue(entry).await {
            Ok(id) => id,
            Err(entry) => {
                self.metrics.publish_failed("queue_full");
                let reason = format!(
                    "ack queue full ({} entries) for {:?}",
                    self.queue.capacity(),
                    self.config.ack_queue_capacity_timeout
                );
                self.on_failure(entry, reason);
                return Ok(AckTicket { rx });
            }
        };
        self.metrics.in_flight(self.queue.len());

        let published = self
            .publisher
            .publish_async(&self.config.subject, &message_headers, payload)
            .await;

        match published {
            Ok(ack) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let outcome = tokio::time::timeout(inner.config.ack_server_timeout, ack).await;
                    let Some(tracked) = inner.queue.remove(id) else {
                        return;
                    };
                    inner.metrics.in_flight(inner.queue.len());
                    let mut entry = tracked.item;

                    match outcome {
                        Ok(Ok(receipt)) => {
                            inner.metrics.published(tracked.enqueued_at.elapsed());
                            debug!(
                                handler = %inner.name,
                                message_id = %entry.message.id(),
                                sequence = receipt.sequence,
                                duplicate = receipt.duplicate,
                                "Publish acknowledged"
                            );
                            entry.complete(AckStatus::Acknowledged(receipt));
                        }
                        Ok(Err(e)) => {
                            inner.metrics.publish_failed("ack");
                            inner.on_failure(entry, e.to_string());
                        }
                        Err(_) => {
                            inner.metrics.publish_failed("ack_timeout");
                            let reason = format!(
                                "no broker ack within {:?}",
                                inner.config.ack_server_timeout
                            );
                            inner.on_failure(entry, reason);
                        }
                    }
                });
            }
            Err(e) => {
                self.metrics.publish_failed("publish");
                if let Some(tracked) = self.queue.remove(id) {
                    self.metrics.in_flight(self.queue.len());
                    self.on_failure(tracked.item, e.to_string());
                }
            }
        }

        Ok(AckTicket { rx })
    }

    async fn apply_backpressure(&self) {
        let occupancy = self.queue.occupancy_percent();
        let threshold = u32::from(self.config.backpressure_threshold);
        let factor = if occupancy >= threshold {
            1u32 << ((occupancy - threshold) / 5).min(16)
        } else {
            0
        };

        let previous = self.slowdown_factor.swap(factor, Ordering::SeqCst);
        if previous != factor {
            self.metrics.backpressure_factor(factor);
            if factor > 0 {
                warn!(
                    handler = %self.name,
                    occupancy,
                    factor,
                    "Ack queue filling up, slowing down sends"
                );
            } else {
                info!(handler = %self.name, occupancy, "Ack queue drained, send slowdown lifted");
            }
        }

        if factor > 0 {
            tokio::time::sleep(self.config.backpressure_base_delay * factor).await;
        }
    }

    /// Resend `entry` if its budget allows, otherwise escalate it.
    fn on_failure(self: &Arc<Self>, mut entry: InFlightPublish<T>, reason: String) {
        let mut history: Vec<String> = entry
            .message
            .header(headers::FAILURE_HISTORY)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        history.push(reason.clone());

        if entry.resend_count < self.config.max_resend_count {
            let attempt = entry.resend_count + 1;
            let history_json = serde_json::to_string(&history).unwrap_or_else(|_| "[]".into());
            warn!(
                handler = %self.name,
                message_id = %entry.message.id(),
                attempt,
                max_resend_count = self.config.max_resend_count,
                reason = %reason,
                "Publish failed, scheduling resend"
            );
            entry.complete(AckStatus::Resent { attempt });

            let delay = self.resend_backoff.delay(entry.resend_count);
            let payload = entry.payload;
            let message = entry
                .message
                .with_header(headers::RESEND_COUNT, attempt.to_string())
                .with_header(headers::FAILURE_HISTORY, history_json);

            self.pending_resends.fetch_add(1, Ordering::SeqCst);
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.resend(message, payload, attempt).await;
                inner.pending_resends.fetch_sub(1, Ordering::SeqCst);
            });
            return;
        }

        let attempts = entry.resend_count + 1;
        error!(
            handler = %self.name,
            message_id = %entry.message.id(),
            attempts,
            history = ?history,
            "Publish failed after exhausting resends"
        );
        self.metrics.publish_exhausted();
        entry.complete(AckStatus::Failed {
            reason: reason.clone(),
        });

        let event = ErrorEvent::PublishExhausted {
            subject: self.config.subject.clone(),
            message_id: entry.message.id(),
            payload: entry.payload.to_vec(),
            attempts,
            failure_history: history,
            occurred_at: Utc::now(),
        };
        let inner = self.clone();
        tokio::spawn(async move { inner.escalate(event).await });
    }

    /// Hand `message` to the resend channel, or publish it again directly.
    /// A rejected hand-off counts as another failed attempt.
    async fn resend(self: &Arc<Self>, message: Message<T>, payload: Bytes, resend_count: u32) {
        self.metrics.resent();
        let message_id = message.id();

        let Some(channel) = &self.resend_channel else {
            if let Err(e) = self.send(message).await {
                error!(handler = %self.name, message_id = %message_id, error = %e, "Resend failed");
            }
            return;
        };

        let message_headers = message.headers().clone();
        let reason = match channel.send(message).await {
            Ok(true) => return,
            Ok(false) => format!("resend channel '{}' rejected the message", channel.name()),
            Err(e) => format!("resend channel '{}' failed: {e}", channel.name()),
        };
        warn!(
            handler = %self.name,
            message_id = %message_id,
            channel = %channel.name(),
            reason = %reason,
            "Resend hand-off failed"
        );

        // The channel consumed the message; restore it from the wire payload
        match self.converter.from_wire(&payload) {
            Ok(restored) => {
                let message = Message::builder(restored)
                    .id(message_id)
                    .headers(message_headers)
                    .build();
                self.on_failure(
                    InFlightPublish {
                        message,
                        payload,
                        resend_count,
                        completion: None,
                    },
                    reason,
                );
            }
            Err(e) => {
                error!(
                    handler = %self.name,
                    message_id = %message_id,
                    error = %e,
                    "Cannot restore message after failed resend hand-off"
                );
                let mut history: Vec<String> = message_headers
                    .get(headers::FAILURE_HISTORY)
                    .and_then(|v| serde_json::from_str(v).ok())
                    .unwrap_or_default();
                history.push(reason);
                self.metrics.publish_exhausted();
                self.escalate(ErrorEvent::PublishExhausted {
                    subject: self.config.subject.clone(),
                    message_id,
                    payload: payload.to_vec(),
                    attempts: resend_count + 1,
                    failure_history: history,
                    occurred_at: Utc::now(),
                })
                .await;
            }
        }
    }

    /// Deliver `event` to the failure channel, retrying a rejected send once.
    async fn escalate(&self, event: ErrorEvent) {
        self.metrics.error_event(event.kind());
        let Some(channel) = &self.failure_channel else {
            error!(handler = %self.name, event = ?event, "No failure channel, dropping exhausted publish");
            return;
        };

        for attempt in 1..=2u32 {
            match channel.send(Message::new(event.clone())).await {
                Ok(true) => return,
                Ok(false) => warn!(
                    handler = %self.name,
                    channel = %channel.name(),
                    attempt,
                    "Failure channel rejected exhausted publish"
                ),
                Err(e) => warn!(
                    handler = %self.name,
                    channel = %channel.name(),
                    attempt,
                    error = %e,
                    "Failed to send exhausted publish"
                ),
            }
            if attempt == 1 {
                tokio::time::sleep(self.resend_backoff.delay(0)).await;
            }
        }
        error!(handler = %self.name, event = ?event, "Dropping exhausted publish after failure channel retry");
    }
}

#[async_trait]
impl<T> MessageHandler<T> for AsyncOutboundHandler<T>
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), ProcessingError> {
        match self.send(message).await {
            Ok(_) => Ok(()),
            Err(NatsError::Conversion(e)) => Err(ProcessingError::Conversion(e)),
            Err(e) => Err(ProcessingError::permanent_with_source("send rejected", e)),
        }
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
