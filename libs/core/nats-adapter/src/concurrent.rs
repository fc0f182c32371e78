//! A container that fans one consumer identity out to N child containers.

use crate::broker::{MessageListener, SubscriptionFactory};
use crate::config::{ContainerSettings, DeliveryMode};
use crate::container::{ListenerContainer, MessageListenerContainer};
use crate::error::NatsError;
use crate::lifecycle::Lifecycle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Runs `concurrency` [`ListenerContainer`]s named `<name>-<index>` that share
/// one subscription factory, and therefore one durable or queue group.
pub struct ConcurrentListenerContainer {
    name: String,
    mode: DeliveryMode,
    children: Vec<Arc<ListenerContainer>>,
    running: AtomicBool,
    auto_startup: AtomicBool,
}

impl ConcurrentListenerContainer {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn SubscriptionFactory>,
        settings: &ContainerSettings,
    ) -> Result<Self, NatsError> {
        let name = name.into();
        if settings.concurrency == 0 {
            return Err(NatsError::Config(format!(
                "container '{name}' needs a concurrency of at least 1"
            )));
        }
        // Children without a shared consumer would each see every message
        if settings.concurrency > 1 && factory.properties().consumer_name().is_none() {
            return Err(NatsError::Config(format!(
                "container '{name}' with concurrency {} needs a durable name or queue group",
                settings.concurrency
            )));
        }

        let children = (0..settings.concurrency)
            .map(|index| {
                Arc::new(ListenerContainer::new(
                    format!("{name}-{index}"),
                    factory.clone(),
                    settings,
                ))
            })
            .collect();

        Ok(Self {
            name,
            mode: settings.delivery_mode,
            children,
            running: AtomicBool::new(false),
            auto_startup: AtomicBool::new(settings.auto_startup),
        })
    }

    pub fn children(&self) -> &[Arc<ListenerContainer>] {
        &self.children
    }

    pub fn concurrency(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl Lifecycle for ConcurrentListenerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    /// Start every child in index order. If a child fails, the children
    /// already started keep running and the parent reports running so a
    /// later `stop` releases them.
    async fn start(&self) -> Result<(), NatsError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (index, child) in self.children.iter().enumerate() {
            if let Err(e) = child.start().await {
                error!(
                    container = %self.name,
                    child = %child.name(),
                    started = index,
                    error = %e,
                    "Failed to start child container"
                );
                if index == 0 {
                    self.running.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
        }

        info!(
            container = %self.name,
            concurrency = self.children.len(),
            mode = %self.mode,
            "Concurrent listener container started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), NatsError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        for child in &self.children {
            if let Err(e) = child.stop().await {
                first_error.get_or_insert(e);
            }
        }

        info!(container = %self.name, "Concurrent listener container stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn auto_startup(&self) -> bool {
        self.auto_startup.load(Ordering::SeqCst)
    }
}

impl MessageListenerContainer for ConcurrentListenerContainer {
    fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        for child in &self.children {
            child.set_listener(listener.clone());
        }
    }

    fn set_auto_startup(&self, auto_startup: bool) {
        self.auto_startup.store(auto_startup, Ordering::SeqCst);
        for child in &self.children {
            child.set_auto_startup(auto_startup);
        }
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    fn live_workers(&self) -> usize {
        self.children.iter().map(|c| c.live_workers()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{listener_fn, ListenerOutcome};
    use crate::config::ConsumerProperties;
    use crate::memory::InMemoryBroker;
    use std::time::Duration;

    fn factory(broker: &InMemoryBroker) -> Arc<dyn SubscriptionFactory> {
        let properties = ConsumerProperties::new("ORDERS", "orders.created")
            .with_durable_name("orders-worker")
            .with_max_wait(Duration::from_millis(50));
        Arc::new(broker.subscription_factory(properties))
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let broker = InMemoryBroker::new();
        let settings = ContainerSettings::default().with_concurrency(0);
        assert!(ConcurrentListenerContainer::new("orders", factory(&broker), &settings).is_err());
    }

    #[test]
    fn test_concurrency_without_shared_consumer_is_rejected() {
        let broker = InMemoryBroker::new();
        let settings = ContainerSettings::default().with_concurrency(2);
        let unnamed: Arc<dyn SubscriptionFactory> = Arc::new(
            broker.subscription_factory(ConsumerProperties::new("ORDERS", "orders.created")),
        );
        match ConcurrentListenerContainer::new("orders", unnamed, &settings) {
            Err(e) => assert!(e.to_string().contains("durable name or queue group")),
            Ok(_) => panic!("unshared concurrent consumer accepted"),
        }

        let single = ContainerSettings::default();
        let unnamed: Arc<dyn SubscriptionFactory> = Arc::new(
            broker.subscription_factory(ConsumerProperties::new("ORDERS", "orders.created")),
        );
        assert!(ConcurrentListenerContainer::new("orders", unnamed, &single).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_children_are_named_by_index() {
        let broker = InMemoryBroker::new();
        broker.create_stream("ORDERS", &["orders.>"]);
        let settings = ContainerSettings::default()
            .with_concurrency(3)
            .with_shutdown_grace(Duration::from_secs(2));
        let container =
            ConcurrentListenerContainer::new("orders", factory(&broker), &settings).unwrap();
        container.set_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        let names: Vec<_> = container.children().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["orders-0", "orders-1", "orders-2"]);

        container.start().await.unwrap();
        assert!(container.is_running());
        assert_eq!(container.live_workers(), 3);
        assert_eq!(
            container.children()[1].worker_thread_name().as_deref(),
            Some("orders-1-nats-C-1")
        );

        container.stop().await.unwrap();
        assert!(!container.is_running());
        assert_eq!(container.live_workers(), 0);
        assert_eq!(broker.unsubscribes(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_first_child_leaves_parent_stopped() {
        let broker = InMemoryBroker::new();
        let settings = ContainerSettings::default().with_concurrency(2);
        let container =
            ConcurrentListenerContainer::new("orders", factory(&broker), &settings).unwrap();
        container.set_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        assert!(container.start().await.is_err());
        assert!(!container.is_running());
        assert!(container.children().iter().all(|c| !c.is_running()));
    }

    #[test]
    fn test_auto_startup_propagates_to_children() {
        let broker = InMemoryBroker::new();
        let settings = ContainerSettings::default().with_concurrency(2);
        let container =
            ConcurrentListenerContainer::new("orders", factory(&broker), &settings).unwrap();

        container.set_auto_startup(false);
        assert!(!container.auto_startup());
        assert!(container.children().iter().all(|c| !c.auto_startup()));
    }
}
