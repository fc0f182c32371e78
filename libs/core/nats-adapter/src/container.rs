//! Listener containers: own a subscription and drive messages to a listener.
//!
//! `Pull` and `PushSync` containers run one dedicated OS thread named
//! `<container>-nats-C-<n>`, where `n` counts starts of that container. The
//! thread blocks on the tokio runtime that called [`Lifecycle::start`], so the
//! runtime must be multi-threaded. `PushAsync` containers own no thread; the
//! subscription factory hands delivery to a dispatcher task.

use crate::broker::{MessageListener, Subscription, SubscriptionFactory};
use crate::config::{ContainerSettings, DeliveryMode};
use crate::dispatch;
use crate::error::NatsError;
use crate::lifecycle::Lifecycle;
use crate::metrics::AdapterMetrics;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle state of a [`ListenerContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ContainerState::Starting,
            2 => ContainerState::Running,
            3 => ContainerState::Stopping,
            _ => ContainerState::Stopped,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Starting => write!(f, "starting"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Common surface of single and concurrent containers, used by the inbound
/// adapter.
pub trait MessageListenerContainer: Lifecycle {
    /// Listener used from the next start on.
    fn set_listener(&self, listener: Arc<dyn MessageListener>);

    fn set_auto_startup(&self, auto_startup: bool);

    fn delivery_mode(&self) -> DeliveryMode;

    /// Number of worker threads currently alive.
    fn live_workers(&self) -> usize;
}

enum Active {
    Worker {
        thread: JoinHandle<Option<Box<dyn Subscription>>>,
        shutdown: watch::Sender<bool>,
        thread_name: String,
    },
    Dispatched(Box<dyn Subscription>),
}

/// Decrements the live worker count when the worker thread exits.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Container bound to one subscription.
pub struct ListenerContainer {
    name: String,
    mode: DeliveryMode,
    factory: Arc<dyn SubscriptionFactory>,
    shutdown_grace: Duration,
    state: AtomicU8,
    auto_startup: AtomicBool,
    starts: AtomicU64,
    live: Arc<AtomicUsize>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    active: Mutex<Option<Active>>,
    metrics: AdapterMetrics,
}

impl ListenerContainer {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn SubscriptionFactory>,
        settings: &ContainerSettings,
    ) -> Self {
        let name = name.into();
        let metrics = AdapterMetrics::new(&name);
        Self {
            name,
            mode: settings.delivery_mode,
            factory,
            shutdown_grace: settings.shutdown_grace,
            state: AtomicU8::new(ContainerState::Stopped as u8),
            auto_startup: AtomicBool::new(settings.auto_startup),
            starts: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            listener: RwLock::new(None),
            active: Mutex::new(None),
            metrics,
        }
    }

    pub fn with_listener(self, listener: Arc<dyn MessageListener>) -> Self {
        self.set_listener(listener);
        self
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Name of the current worker thread, `None` when stopped or in `PushAsync` mode.
    pub fn worker_thread_name(&self) -> Option<String> {
        match self.active().as_ref() {
            Some(Active::Worker { thread_name, .. }) => Some(thread_name.clone()),
            _ => None,
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn transition(&self, from: ContainerState, to: ContainerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_state(&self, state: ContainerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn do_start(&self) -> Result<(), NatsError> {
        let listener = self.listener().ok_or_else(|| {
            NatsError::Config(format!("container '{}' has no listener", self.name))
        })?;

        // Workers block on the caller's runtime, so find it before subscribing
        let runtime = if self.mode.owns_worker() {
            Some(Handle::try_current().map_err(|e| {
                NatsError::Config(format!(
                    "container '{}' must be started inside a tokio runtime: {e}",
                    self.name
                ))
            })?)
        } else {
            None
        };

        let subscription = self
            .factory
            .create_subscription(self.mode, Some(listener.clone()))
            .await?;

        let Some(runtime) = runtime else {
            *self.active() = Some(Active::Dispatched(subscription));
            return Ok(());
        };

        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let thread_name = format!("{}-nats-C-{}", self.name, n);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            name: thread_name.clone(),
            subscription,
            listener,
            shutdown: shutdown_rx,
            batch_size: self.factory.properties().pull_batch_size(),
            max_wait: self.factory.properties().max_wait(),
            metrics: self.metrics.clone(),
        };

        // The worker is handed over after spawning so a failed spawn can still release it
        let (handoff_tx, handoff_rx) = oneshot::channel::<Worker>();
        let live = LiveGuard::enter(&self.live);
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _live = live;
                let worker = handoff_rx.blocking_recv().ok()?;
                Some(runtime.block_on(worker.run()))
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.discard(worker.subscription).await;
                return Err(NatsError::Consumer(format!(
                    "failed to spawn worker thread '{thread_name}': {e}"
                )));
            }
        };
        if let Err(worker) = handoff_tx.send(worker) {
            self.discard(worker.subscription).await;
            return Err(NatsError::Consumer(format!(
                "worker thread '{thread_name}' exited before taking its subscription"
            )));
        }

        *self.active() = Some(Active::Worker {
            thread,
            shutdown: shutdown_tx,
            thread_name,
        });
        Ok(())
    }

    /// Unsubscribe a subscription that never reached a running worker.
    async fn discard(&self, mut subscription: Box<dyn Subscription>) {
        if let Err(e) = subscription.unsubscribe().await {
            warn!(container = %self.name, error = %e, "Failed to release subscription after start failure");
        }
    }

    async fn release(&self, active: Active) -> Result<(), NatsError> {
        match active {
            Active::Dispatched(mut subscription) => subscription.unsubscribe().await,
            Active::Worker {
                thread,
                shutdown,
                thread_name,
            } => {
                let _ = shutdown.send(true);

                let deadline = Instant::now() + self.shutdown_grace;
                while !thread.is_finished() && Instant::now() < deadline {
                    tokio::time::sleep(JOIN_POLL_INTERVAL).await;
                }

                if !thread.is_finished() {
                    warn!(
                        container = %self.name,
                        thread = %thread_name,
                        grace_ms = self.shutdown_grace.as_millis() as u64,
                        "Worker did not stop within the shutdown grace period, unsubscribe deferred"
                    );
                    tokio::spawn(deferred_unsubscribe(thread, thread_name));
                    return Ok(());
                }

                match thread.join() {
                    Ok(Some(mut subscription)) => subscription.unsubscribe().await,
                    Ok(None) => Ok(()),
                    Err(_) => Err(NatsError::Consumer(format!(
                        "worker thread '{thread_name}' panicked"
                    ))),
                }
            }
        }
    }
}

async fn deferred_unsubscribe(
    thread: JoinHandle<Option<Box<dyn Subscription>>>,
    thread_name: String,
) {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(None)) => {}
        Ok(Ok(Some(mut subscription))) => match subscription.unsubscribe().await {
            Ok(()) => debug!(thread = %thread_name, "Deferred unsubscribe completed"),
            Err(e) => error!(thread = %thread_name, error = %e, "Deferred unsubscribe failed"),
        },
        _ => error!(thread = %thread_name, "Worker thread panicked, subscription not released"),
    }
}

#[async_trait]
impl Lifecycle for ListenerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), NatsError> {
        if !self.transition(ContainerState::Stopped, ContainerState::Starting) {
            debug!(container = %self.name, state = %self.state(), "Start ignored");
            return Ok(());
        }

        match self.do_start().await {
            Ok(()) => {
                self.set_state(ContainerState::Running);
                self.metrics.live_workers(self.live_workers());
                info!(
                    container = %self.name,
                    mode = %self.mode,
                    subject = %self.factory.properties().subject(),
                    thread = ?self.worker_thread_name(),
                    "Listener container started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ContainerState::Stopped);
                error!(container = %self.name, error = %e, "Failed to start listener container");
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), NatsError> {
        if !self.transition(ContainerState::Running, ContainerState::Stopping) {
            debug!(container = %self.name, state = %self.state(), "Stop ignored");
            return Ok(());
        }

        let active = self.active().take();
        let result = match active {
            Some(active) => self.release(active).await,
            None => Ok(()),
        };

        self.set_state(ContainerState::Stopped);
        self.metrics.live_workers(self.live_workers());
        match &result {
            Ok(()) => info!(container = %self.name, "Listener container stopped"),
            Err(e) => error!(container = %self.name, error = %e, "Listener container stopped with error"),
        }
        result
    }

    fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    fn auto_startup(&self) -> bool {
        self.auto_startup.load(Ordering::SeqCst)
    }
}

impl MessageListenerContainer for ListenerContainer {
    fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    fn set_auto_startup(&self, auto_startup: bool) {
        self.auto_startup.store(auto_startup, Ordering::SeqCst);
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        if let Some(Active::Worker { shutdown, .. }) = self.active().take() {
            let _ = shutdown.send(true);
        }
    }
}

struct Worker {
    name: String,
    subscription: Box<dyn Subscription>,
    listener: Arc<dyn MessageListener>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    max_wait: Duration,
    metrics: AdapterMetrics,
}

impl Worker {
    async fn run(self) -> Box<dyn Subscription> {
        let Worker {
            name,
            mut subscription,
            listener,
            mut shutdown,
            batch_size,
            max_wait,
            metrics,
        } = self;

        info!(thread = %name, subject = %subscription.subject(), "Listener worker started");
        dispatch::consume(
            &name,
            subscription.as_mut(),
            listener.as_ref(),
            &mut shutdown,
            batch_size,
            max_wait,
            &metrics,
        )
        .await;
        info!(thread = %name, "Listener worker stopped");

        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{listener_fn, ListenerOutcome, Publisher};
    use crate::config::ConsumerProperties;
    use crate::memory::InMemoryBroker;
    use messaging::MessageHeaders;
    use std::sync::Mutex as StdMutex;

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_stream("ORDERS", &["orders.>"]);
        broker
    }

    fn container(broker: &InMemoryBroker, mode: DeliveryMode) -> ListenerContainer {
        let properties = ConsumerProperties::new("ORDERS", "orders.created")
            .with_durable_name("orders-worker")
            .with_max_wait(Duration::from_millis(50));
        let settings = ContainerSettings::default()
            .with_delivery_mode(mode)
            .with_shutdown_grace(Duration::from_secs(2));
        ListenerContainer::new(
            "orders",
            Arc::new(broker.subscription_factory(properties)),
            &settings,
        )
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_start_outside_runtime_leaves_no_subscription() {
        let broker = broker();
        let container = container(&broker, DeliveryMode::Pull)
            .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        let err = futures::executor::block_on(container.start()).unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.live_workers(), 0);
        assert_eq!(broker.subscriptions_created(), broker.unsubscribes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_requires_listener() {
        let broker = broker();
        let container = container(&broker, DeliveryMode::Pull);

        let err = container.start().await.unwrap_err();
        assert!(matches!(err, NatsError::Config(_)));
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(broker.subscriptions_created(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pull_container_runs_named_worker() {
        let broker = broker();
        let threads = Arc::new(StdMutex::new(Vec::new()));
        let seen = threads.clone();
        let container = container(&broker, DeliveryMode::Pull).with_listener(Arc::new(
            listener_fn(move |_| {
                let name = std::thread::current().name().map(str::to_string);
                seen.lock().unwrap().push(name);
                ListenerOutcome::Ack
            }),
        ));

        container.start().await.unwrap();
        assert!(container.is_running());
        assert_eq!(container.live_workers(), 1);
        assert_eq!(container.worker_thread_name().as_deref(), Some("orders-nats-C-1"));

        broker
            .publish("orders.created", &MessageHeaders::new(), "{}".into())
            .await
            .unwrap();
        wait_for(|| !threads.lock().unwrap().is_empty()).await;

        container.stop().await.unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.live_workers(), 0);
        assert_eq!(broker.unsubscribes(), 1);
        assert_eq!(broker.acked_count("ORDERS", "orders-worker"), 1);
        assert_eq!(
            threads.lock().unwrap()[0].as_deref(),
            Some("orders-nats-C-1")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop_are_idempotent() {
        let broker = broker();
        let container = container(&broker, DeliveryMode::PushSync)
            .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        container.start().await.unwrap();
        container.start().await.unwrap();
        assert_eq!(broker.subscriptions_created(), 1);
        assert_eq!(container.live_workers(), 1);

        container.stop().await.unwrap();
        container.stop().await.unwrap();
        assert_eq!(broker.unsubscribes(), 1);

        // Restart gets a fresh thread number
        container.start().await.unwrap();
        assert_eq!(container.worker_thread_name().as_deref(), Some("orders-nats-C-2"));
        container.stop().await.unwrap();
        assert_eq!(broker.unsubscribes(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_push_async_owns_no_thread() {
        let broker = broker();
        let container = container(&broker, DeliveryMode::PushAsync)
            .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        container.start().await.unwrap();
        assert!(container.is_running());
        assert_eq!(container.live_workers(), 0);
        assert!(container.worker_thread_name().is_none());

        broker
            .publish("orders.created", &MessageHeaders::new(), "{}".into())
            .await
            .unwrap();
        wait_for(|| broker.acked_count("ORDERS", "orders-worker") == 1).await;

        container.stop().await.unwrap();
        assert_eq!(broker.unsubscribes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_stream_leaves_container_stopped() {
        let broker = InMemoryBroker::new();
        let container = container(&broker, DeliveryMode::Pull)
            .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        assert!(container.start().await.is_err());
        assert!(!container.is_running());
        assert_eq!(container.live_workers(), 0);
    }
}
