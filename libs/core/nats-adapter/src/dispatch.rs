//! Per-message dispatch shared by worker threads and push dispatchers.

use crate::broker::{ListenerOutcome, MessageListener, RawBrokerMessage, Subscription};
use crate::error::NatsError;
use crate::metrics::AdapterMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before polling again after a poll error.
pub(crate) const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Hand one message to the listener and ack it iff the listener says so.
///
/// Listener panics are contained here and treated as a delivery failure.
pub(crate) async fn deliver(
    component: &str,
    listener: &dyn MessageListener,
    message: RawBrokerMessage,
    metrics: &AdapterMetrics,
) -> ListenerOutcome {
    metrics.message_received();
    let start = Instant::now();

    let outcome = match AssertUnwindSafe(listener.on_message(&message))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            metrics.listener_panicked();
            error!(
                component = %component,
                subject = %message.subject,
                stream_sequence = message.metadata.stream_sequence,
                "Listener panicked, message left for redelivery"
            );
            ListenerOutcome::DeliveryFailed
        }
    };
    metrics.message_handled(outcome.as_str(), start.elapsed());

    if outcome.should_ack() {
        if let Err(e) = message.ack().await {
            metrics.ack_failed();
            warn!(
                component = %component,
                subject = %message.subject,
                error = %e,
                "Failed to ack message"
            );
        }
    } else {
        debug!(
            component = %component,
            subject = %message.subject,
            delivered = message.metadata.delivered,
            outcome = outcome.as_str(),
            "Message not acknowledged"
        );
    }

    outcome
}

/// Poll `subscription` and deliver every message in order until `shutdown`
/// flips. Shared by container worker threads and push dispatchers.
pub(crate) async fn consume(
    component: &str,
    subscription: &mut dyn Subscription,
    listener: &dyn MessageListener,
    shutdown: &mut watch::Receiver<bool>,
    batch_size: usize,
    max_wait: Duration,
    metrics: &AdapterMetrics,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,

            polled = subscription.poll(batch_size, max_wait) => match polled {
                Ok(messages) => {
                    for message in messages {
                        // Remaining messages stay un-acked and are redelivered
                        if *shutdown.borrow() {
                            break;
                        }
                        deliver(component, listener, message, metrics).await;
                    }
                }
                Err(e) => {
                    metrics.poll_failed();
                    error!(component = %component, error = %e, "Error polling subscription");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }
}

/// Drive `subscription` on a tokio task, delivering every message to
/// `listener` until the returned subscription is unsubscribed.
///
/// This is how `PushAsync` subscriptions deliver: the task runs on the
/// client's runtime and no OS thread is created.
pub fn spawn_dispatcher(
    component: impl Into<String>,
    mut subscription: Box<dyn Subscription>,
    listener: Arc<dyn MessageListener>,
    batch_size: usize,
    max_wait: Duration,
) -> Box<dyn Subscription> {
    let component = component.into();
    let subject = subscription.subject().to_string();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let metrics = AdapterMetrics::new(&component);

    let task = tokio::spawn(async move {
        debug!(component = %component, "Push dispatcher started");
        consume(
            &component,
            subscription.as_mut(),
            listener.as_ref(),
            &mut shutdown_rx,
            batch_size,
            max_wait,
            &metrics,
        )
        .await;
        info!(component = %component, "Push dispatcher stopped");
        subscription
    });

    Box::new(DispatchedSubscription {
        subject,
        shutdown: shutdown_tx,
        task: Some(task),
    })
}

struct DispatchedSubscription {
    subject: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Box<dyn Subscription>>>,
}

#[async_trait]
impl Subscription for DispatchedSubscription {
    async fn poll(
        &mut self,
        _batch_size: usize,
        _max_wait: Duration,
    ) -> Result<Vec<RawBrokerMessage>, NatsError> {
        Err(NatsError::Consumer(format!(
            "subscription on '{}' is dispatched to its listener and cannot be polled",
            self.subject
        )))
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let _ = self.shutdown.send(true);
        let mut inner = task.await.map_err(NatsError::consumer_error)?;
        inner.unsubscribe().await
    }

    fn subject(&self) -> &str {
        &self.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{listener_fn, Acknowledger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Acknowledger for CountingAck {
        async fn ack(&self) -> Result<(), NatsError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingListener;

    #[async_trait]
    impl MessageListener for PanickingListener {
        async fn on_message(&self, _message: &RawBrokerMessage) -> ListenerOutcome {
            panic!("listener bug")
        }
    }

    fn message(acks: &Arc<AtomicUsize>) -> RawBrokerMessage {
        RawBrokerMessage::new("orders", "{}").with_acknowledger(Box::new(CountingAck(acks.clone())))
    }

    #[tokio::test]
    async fn test_deliver_acks_only_on_ack() {
        let acks = Arc::new(AtomicUsize::new(0));
        let metrics = AdapterMetrics::new("test");

        let ack = listener_fn(|_| ListenerOutcome::Ack);
        let reject = listener_fn(|_| ListenerOutcome::DeliveryFailed);

        deliver("test", &ack, message(&acks), &metrics).await;
        deliver("test", &reject, message(&acks), &metrics).await;

        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_contains_panics() {
        let acks = Arc::new(AtomicUsize::new(0));
        let metrics = AdapterMetrics::new("test");

        let outcome = deliver("test", &PanickingListener, message(&acks), &metrics).await;

        assert_eq!(outcome, ListenerOutcome::DeliveryFailed);
        assert_eq!(acks.load(Ordering::SeqCst), 0);
    }
}
