//! Channels connecting producers and handlers on the internal bus.

use crate::{error::ProcessingError, handler::MessageHandler, message::Message};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A destination that messages can be sent to.
///
/// `Ok(true)` means the message was accepted, `Ok(false)` means the channel
/// declined it (for example a full buffer after the send timeout). Errors are
/// reserved for failures raised while handling the message.
#[async_trait]
pub trait MessageChannel<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn send(&self, message: Message<T>) -> Result<bool, ProcessingError>;

    fn name(&self) -> &str;
}

/// A channel whose messages are pulled by the consumer.
#[async_trait]
pub trait PollableChannel<T>: MessageChannel<T>
where
    T: Send + Sync + 'static,
{
    /// Wait up to `timeout` for the next message.
    async fn receive(&self, timeout: Duration) -> Option<Message<T>>;
}

/// Bounded buffered channel backed by a tokio mpsc queue.
pub struct QueueChannel<T> {
    name: String,
    capacity: usize,
    send_timeout: Duration,
    sender: mpsc::Sender<Message<T>>,
    receiver: Mutex<mpsc::Receiver<Message<T>>>,
}

impl<T> QueueChannel<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            capacity,
            send_timeout: Duration::from_secs(1),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// How long `send` waits for space before declining the message.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the next message without waiting.
    pub async fn try_receive(&self) -> Option<Message<T>> {
        self.receiver.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl<T> MessageChannel<T> for QueueChannel<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, message: Message<T>) -> Result<bool, ProcessingError> {
        match self.sender.send_timeout(message, self.send_timeout).await {
            Ok(()) => Ok(true),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                debug!(channel = %self.name, "Queue channel full, message declined");
                Ok(false)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(ProcessingError::ChannelClosed(self.name.clone()))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<T> PollableChannel<T> for QueueChannel<T>
where
    T: Send + Sync + 'static,
{
    async fn receive(&self, timeout: Duration) -> Option<Message<T>> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Point-to-point channel that invokes its subscriber on the sender's task.
pub struct DirectChannel<T> {
    name: String,
    subscriber: RwLock<Option<Arc<dyn MessageHandler<T>>>>,
}

impl<T> DirectChannel<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriber: RwLock::new(None),
        }
    }

    /// Replace the current subscriber.
    pub fn subscribe(&self, handler: Arc<dyn MessageHandler<T>>) {
        let mut guard = self
            .subscriber
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(handler);
    }

    pub fn unsubscribe(&self) {
        let mut guard = self
            .subscriber
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take();
    }

    fn current(&self) -> Option<Arc<dyn MessageHandler<T>>> {
        self.subscriber
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl<T> MessageChannel<T> for DirectChannel<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, message: Message<T>) -> Result<bool, ProcessingError> {
        let handler = self.current().ok_or_else(|| {
            ProcessingError::permanent(format!("channel '{}' has no subscribers", self.name))
        })?;
        handler.handle(message).await?;
        Ok(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, FailingHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_queue_channel_send_receive() {
        let channel = QueueChannel::new("orders", 4);
        assert!(channel.send(Message::new(1u32)).await.unwrap());
        assert!(channel.send(Message::new(2u32)).await.unwrap());
        assert_eq!(channel.len(), 2);

        let first = channel.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.payload(), &1);
        let second = channel.try_receive().await.unwrap();
        assert_eq!(second.payload(), &2);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_queue_channel_declines_when_full() {
        let channel =
            QueueChannel::new("tiny", 1).with_send_timeout(Duration::from_millis(10));
        assert!(channel.send(Message::new("a")).await.unwrap());
        assert!(!channel.send(Message::new("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_channel_receive_times_out() {
        let channel: QueueChannel<u8> = QueueChannel::new("empty", 1);
        assert!(channel.receive(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_direct_channel_dispatches() {
        let channel = DirectChannel::new("direct");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        channel.subscribe(Arc::new(handler_fn(move |_m: Message<u8>| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })));

        assert!(channel.send(Message::new(1)).await.unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_direct_channel_errors() {
        let channel: DirectChannel<u8> = DirectChannel::new("direct");
        assert!(channel.send(Message::new(1)).await.is_err());

        channel.subscribe(Arc::new(FailingHandler::new("boom")));
        assert!(channel.send(Message::new(1)).await.is_err());

        channel.unsubscribe();
        assert!(channel.send(Message::new(1)).await.is_err());
    }
}
