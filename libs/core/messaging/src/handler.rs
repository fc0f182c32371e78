//! Message handlers: the consuming end of a channel.

use crate::{error::ProcessingError, message::Message};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Handles a single message.
///
/// Implementations should be idempotent where possible: broker-backed
/// channels deliver at least once.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), ProcessingError>;

    /// Handler name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handler that always fails with a permanent error. Useful in tests.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    reason: String,
}

impl FailingHandler {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl<T> MessageHandler<T> for FailingHandler
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, _message: Message<T>) -> Result<(), ProcessingError> {
        Err(ProcessingError::permanent(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Closure-backed handler created by [`handler_fn`].
pub struct FnHandler<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```rust
/// use messaging::{handler_fn, Message, MessageHandler};
///
/// let handler = handler_fn(|message: Message<u32>| async move {
///     assert_eq!(*message.payload(), 1);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut, T>(f: F) -> FnHandler<F, T>
where
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> MessageHandler<T> for FnHandler<F, T>
where
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send,
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), ProcessingError> {
        (self.f)(message).await
    }

    fn name(&self) -> &str {
        "fn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |message: Message<u32>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(*message.payload(), Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle(Message::new(5)).await.unwrap();
        handler.handle(Message::new(2)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_failing_handler() {
        let handler = FailingHandler::new("nope");
        let err = MessageHandler::<()>::handle(&handler, Message::new(()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
