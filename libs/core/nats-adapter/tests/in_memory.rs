//! End-to-end behaviour of containers, adapters and handlers over the
//! in-memory broker.

use messaging::{
    JsonConverter, Message, MessageChannel, PollableChannel, ProcessingError, QueueChannel,
    StringConverter,
};
use nats_adapter::{
    headers, listener_fn, AckStatus, AsyncOutboundHandler, ConcurrentListenerContainer,
    ConsumerProperties, ContainerSettings, DeliveryMode, ErrorEvent, InMemoryBroker, Lifecycle,
    LifecycleGroup, ListenerContainer, ListenerOutcome, MessageListenerContainer,
    NatsInboundAdapter, ProducerConfig, SyncOutboundHandler,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::{assert_some, eventually};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

const WAIT: Duration = Duration::from_secs(5);

fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_stream("ORDERS", &["orders.>"]);
    broker
}

fn properties() -> ConsumerProperties {
    ConsumerProperties::new("ORDERS", "orders.created")
        .with_durable_name("billing")
        .with_max_wait(Duration::from_millis(50))
}

fn settings(mode: DeliveryMode, concurrency: usize) -> ContainerSettings {
    ContainerSettings::default()
        .with_delivery_mode(mode)
        .with_concurrency(concurrency)
        .with_shutdown_grace(Duration::from_secs(2))
}

fn producer(broker: &InMemoryBroker, subject: &str) -> AsyncOutboundHandler<Order> {
    AsyncOutboundHandler::new(
        ProducerConfig::new(subject).with_ack_server_timeout(Duration::from_millis(500)),
        Arc::new(broker.clone()),
        Arc::new(JsonConverter::new()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lifecycle_is_idempotent_across_modes() {
    for mode in [DeliveryMode::Pull, DeliveryMode::PushSync, DeliveryMode::PushAsync] {
        let broker = broker();
        let container = ConcurrentListenerContainer::new(
            "billing",
            Arc::new(broker.subscription_factory(properties())),
            &settings(mode, 2),
        )
        .unwrap();
        container.set_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));

        container.start().await.unwrap();
        container.start().await.unwrap();
        assert!(container.is_running(), "{mode} running");
        assert_eq!(broker.subscriptions_created(), 2, "{mode} subscriptions");

        container.stop().await.unwrap();
        container.stop().await.unwrap();
        assert!(!container.is_running());
        assert_eq!(broker.unsubscribes(), 2, "{mode} unsubscribes");
        assert_eq!(container.live_workers(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_count_matches_mode_and_concurrency() {
    let broker = broker();
    let threads = Arc::new(Mutex::new(HashSet::new()));
    let seen = threads.clone();

    let container = ConcurrentListenerContainer::new(
        "billing",
        Arc::new(broker.subscription_factory(properties().with_pull_batch_size(1))),
        &settings(DeliveryMode::Pull, 3),
    )
    .unwrap();
    container.set_listener(Arc::new(listener_fn(move |_| {
        let name = std::thread::current().name().unwrap_or("unnamed").to_string();
        seen.lock().unwrap().insert(name);
        std::thread::sleep(Duration::from_millis(5));
        ListenerOutcome::Ack
    })));

    container.start().await.unwrap();
    assert_eq!(container.live_workers(), 3);

    let publisher = SyncOutboundHandler::new(
        "orders.created",
        Arc::new(broker.clone()),
        Arc::new(StringConverter),
    );
    for i in 0..30 {
        publisher
            .handle(Some(&Message::new(format!("order-{i}"))))
            .await
            .unwrap();
    }
    eventually(WAIT, "all orders acked", || broker.acked_count("ORDERS", "billing") == 30).await;

    let expected: HashSet<String> = (0..3).map(|i| format!("billing-{i}-nats-C-1")).collect();
    assert!(threads.lock().unwrap().is_subset(&expected));

    container.stop().await.unwrap();
    assert_eq!(container.live_workers(), 0);

    let push_async = ConcurrentListenerContainer::new(
        "audit",
        Arc::new(broker.subscription_factory(properties().with_durable_name("audit"))),
        &settings(DeliveryMode::PushAsync, 3),
    )
    .unwrap();
    push_async.set_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));
    push_async.start().await.unwrap();
    assert_eq!(push_async.live_workers(), 0);
    push_async.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_through_adapters() {
    let broker = broker();
    let output = Arc::new(QueueChannel::<Order>::new("orders", 64));

    let container = Arc::new(
        ConcurrentListenerContainer::new(
            "billing",
            Arc::new(broker.subscription_factory(properties())),
            &settings(DeliveryMode::Pull, 2),
        )
        .unwrap(),
    );
    let adapter = Arc::new(NatsInboundAdapter::new(
        "billing-in",
        container.clone(),
        Arc::new(JsonConverter::new()),
        output.clone(),
    ));

    adapter.on_init();
    // The adapter owns the container's lifecycle
    assert!(!container.auto_startup());

    let mut group = LifecycleGroup::new();
    group.add(container.clone()).add(adapter.clone());
    group.start_all().await.unwrap();
    assert!(adapter.is_running());
    assert!(container.is_running());

    let producer = producer(&broker, "orders.created");
    let sent = Message::builder(Order {
        id: 7,
        item: "book".into(),
    })
    .header("tenant", "acme")
    .build();
    let ticket = producer.send(sent.clone()).await.unwrap();
    assert!(matches!(ticket.wait().await, AckStatus::Acknowledged(_)));

    let received = assert_some(output.receive(WAIT).await, "round trip delivery");
    assert_eq!(received.payload(), sent.payload());
    assert_eq!(received.header("tenant"), Some("acme"));
    assert_eq!(received.header(headers::MSG_ID), Some(sent.id().to_string().as_str()));
    assert_eq!(received.header(headers::SUBJECT), Some("orders.created"));
    assert_eq!(received.header(headers::DELIVERED), Some("1"));

    eventually(WAIT, "message acked", || broker.acked_count("ORDERS", "billing") == 1).await;
    group.stop_all().await.unwrap();
    assert!(!adapter.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_delivery_is_redelivered_max_deliver_times() {
    let broker = broker();
    let container = ListenerContainer::new(
        "billing",
        Arc::new(
            broker.subscription_factory(
                properties()
                    .with_ack_wait(Duration::from_millis(50))
                    .with_max_deliver(3),
            ),
        ),
        &settings(DeliveryMode::Pull, 1),
    )
    .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::DeliveryFailed)));

    container.start().await.unwrap();
    SyncOutboundHandler::new("orders.created", Arc::new(broker.clone()), Arc::new(StringConverter))
        .handle(Some(&Message::new("never acked".to_string())))
        .await
        .unwrap();

    eventually(WAIT, "three deliveries", || broker.delivery_count("ORDERS", "billing", 1) == 3).await;
    // Past max_deliver the broker stops redelivering
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.delivery_count("ORDERS", "billing", 1), 3);
    assert_eq!(broker.acked_count("ORDERS", "billing"), 0);

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_group_children_receive_each_message_once() {
    for mode in [DeliveryMode::Pull, DeliveryMode::PushSync, DeliveryMode::PushAsync] {
        let broker = broker();
        let grouped = ConsumerProperties::new("ORDERS", "orders.created")
            .with_queue_group("billing")
            .with_max_wait(Duration::from_millis(50));
        let container = ConcurrentListenerContainer::new(
            "billing",
            Arc::new(broker.subscription_factory(grouped)),
            &settings(mode, 3),
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        container.set_listener(Arc::new(listener_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ListenerOutcome::Ack
        })));
        container.start().await.unwrap();

        SyncOutboundHandler::new("orders.created", Arc::new(broker.clone()), Arc::new(StringConverter))
            .handle(Some(&Message::new("once".to_string())))
            .await
            .unwrap();

        eventually(WAIT, "message handled", || calls.load(Ordering::SeqCst) >= 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{mode} deliveries");
        assert_eq!(broker.delivery_count("ORDERS", "billing", 1), 1, "{mode}");

        container.stop().await.unwrap();
        assert!(!broker.has_consumer("ORDERS", "billing"), "{mode} consumer removed");
    }
}

#[tokio::test]
async fn test_queue_overflow_is_resent_and_stored() {
    let broker = broker();
    broker.set_ack_delay(Duration::from_millis(150));
    let capacity_timeout = Duration::from_millis(100);
    let capacity = 2;

    let handler = AsyncOutboundHandler::<Order>::new(
        ProducerConfig::new("orders.created")
            .with_ack_queue_capacity(capacity)
            .with_ack_queue_capacity_timeout(capacity_timeout)
            .with_ack_server_timeout(Duration::from_secs(1))
            .with_max_resend_count(1)
            .with_backpressure(100, Duration::ZERO),
        Arc::new(broker.clone()),
        Arc::new(JsonConverter::new()),
    )
    .with_resend_backoff(messaging::BackoffStrategy::fixed(Duration::from_millis(250)));

    let mut tickets = Vec::new();
    for id in 0..capacity as u32 {
        tickets.push(
            handler
                .send(Message::new(Order {
                    id,
                    item: "ink".into(),
                }))
                .await
                .unwrap(),
        );
    }

    let overflow = Message::new(Order {
        id: 99,
        item: "ink".into(),
    });
    let overflow_id = overflow.id().to_string();
    let started = tokio::time::Instant::now();
    let ticket = handler.send(overflow).await.unwrap();
    assert!(started.elapsed() >= capacity_timeout);
    assert_eq!(ticket.wait().await, AckStatus::Resent { attempt: 1 });

    for ticket in tickets {
        assert!(matches!(ticket.wait().await, AckStatus::Acknowledged(_)));
    }
    eventually(WAIT, "overflowed order stored", || {
        broker
            .messages("ORDERS")
            .iter()
            .any(|m| m.headers.get(headers::MSG_ID) == Some(&overflow_id))
    })
    .await;
    assert!(handler.close(WAIT).await);
    assert_eq!(broker.messages("ORDERS").len(), capacity + 1);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_capacity() {
    let broker = broker();
    broker.set_ack_delay(Duration::from_millis(100));
    let failures = Arc::new(QueueChannel::new("failures", 64));
    let capacity = 4;

    let handler = AsyncOutboundHandler::<Order>::new(
        ProducerConfig::new("orders.created")
            .with_ack_queue_capacity(capacity)
            .with_ack_queue_capacity_timeout(Duration::from_millis(20))
            .with_max_resend_count(0)
            .with_backpressure(100, Duration::ZERO),
        Arc::new(broker.clone()),
        Arc::new(JsonConverter::new()),
    )
    .with_failure_channel(failures.clone());

    let mut tickets = Vec::new();
    for id in 0..(capacity as u32 + 1) {
        let ticket = handler
            .send(Message::new(Order {
                id,
                item: "pen".into(),
            }))
            .await
            .unwrap();
        assert!(handler.in_flight() <= capacity);
        tickets.push(ticket);
    }

    let mut statuses = Vec::new();
    for ticket in tickets {
        statuses.push(ticket.wait().await);
    }
    let acknowledged = statuses
        .iter()
        .filter(|s| matches!(s, AckStatus::Acknowledged(_)))
        .count();
    assert_eq!(acknowledged, capacity);
    assert!(matches!(statuses[capacity], AckStatus::Failed { .. }));

    let event = failures.receive(WAIT).await.unwrap();
    assert_eq!(event.payload().kind(), "publish_exhausted");
}

#[tokio::test]
async fn test_outage_loses_nothing() {
    let broker = broker();
    let handler = AsyncOutboundHandler::new(
        ProducerConfig::new("orders.created")
            .with_ack_server_timeout(Duration::from_millis(500))
            .with_max_resend_count(100),
        Arc::new(broker.clone()),
        Arc::new(JsonConverter::<Order>::new()),
    )
    .with_resend_backoff(messaging::BackoffStrategy::fixed(Duration::from_millis(20)));

    let mut ids = HashSet::new();
    for id in 0..20u32 {
        if id == 5 {
            broker.set_available(false);
        }
        if id == 15 {
            broker.set_available(true);
        }
        let message = Message::new(Order {
            id,
            item: "lamp".into(),
        });
        ids.insert(message.id().to_string());
        handler.send(message).await.unwrap();
    }

    assert!(handler.close(WAIT).await);

    let stored = broker.messages("ORDERS");
    let stored_ids: HashSet<String> = stored
        .iter()
        .filter_map(|m| m.headers.get(headers::MSG_ID).cloned())
        .collect();
    assert_eq!(stored.len(), 20);
    assert_eq!(stored_ids, ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_matching_stream() {
    let broker = InMemoryBroker::new();

    let err = SyncOutboundHandler::new(
        "nowhere.created",
        Arc::new(broker.clone()),
        Arc::new(StringConverter),
    )
    .handle(Some(&Message::new("lost".to_string())))
    .await
    .unwrap_err();
    assert!(err.to_string().contains("nowhere.created"));

    let container = ListenerContainer::new(
        "billing",
        Arc::new(broker.subscription_factory(properties())),
        &settings(DeliveryMode::Pull, 1),
    )
    .with_listener(Arc::new(listener_fn(|_| ListenerOutcome::Ack)));
    assert!(container.start().await.is_err());
    assert!(!container.is_running());
    assert_eq!(container.live_workers(), 0);
}

/// Output channel that fails the first message it sees.
struct FlakyChannel {
    inner: Arc<QueueChannel<Order>>,
    failed_once: Mutex<bool>,
}

#[async_trait::async_trait]
impl MessageChannel<Order> for FlakyChannel {
    async fn send(&self, message: Message<Order>) -> Result<bool, ProcessingError> {
        {
            let mut failed = self.failed_once.lock().unwrap();
            if !*failed {
                *failed = true;
                return Err(ProcessingError::transient("downstream busy"));
            }
        }
        self.inner.send(message).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_message_is_isolated() {
    let broker = broker();
    let output = Arc::new(QueueChannel::<Order>::new("orders", 64));
    let errors = Arc::new(QueueChannel::<ErrorEvent>::new("errors", 64));

    let container = Arc::new(
        ConcurrentListenerContainer::new(
            "billing",
            Arc::new(
                broker.subscription_factory(
                    properties()
                        .with_ack_wait(Duration::from_millis(100))
                        .with_max_deliver(2),
                ),
            ),
            &settings(DeliveryMode::Pull, 1),
        )
        .unwrap(),
    );
    let adapter = NatsInboundAdapter::new(
        "billing-in",
        container,
        Arc::new(JsonConverter::new()),
        Arc::new(FlakyChannel {
            inner: output.clone(),
            failed_once: Mutex::new(false),
        }),
    )
    .with_error_channel(errors.clone());
    adapter.start().await.unwrap();

    let raw = SyncOutboundHandler::new("orders.created", Arc::new(broker.clone()), Arc::new(StringConverter));
    for id in 1..=3 {
        raw.handle(Some(&Message::new(format!(r#"{{"id":{id},"item":"a"}}"#)))).await.unwrap();
    }
    raw.handle(Some(&Message::new("{not json".to_string()))).await.unwrap();
    for id in 4..=5 {
        raw.handle(Some(&Message::new(format!(r#"{{"id":{id},"item":"b"}}"#)))).await.unwrap();
    }

    // Order 1 fails once downstream and comes back after ack_wait
    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(output.receive(WAIT).await.unwrap().payload().id);
    }
    received.sort_unstable();
    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    // The malformed message is stream sequence 4
    eventually(WAIT, "malformed delivered twice", || {
        broker.delivery_count("ORDERS", "billing", 4) == 2
    })
    .await;
    eventually(WAIT, "good orders acked", || broker.acked_count("ORDERS", "billing") == 5).await;
    assert_eq!(broker.delivery_count("ORDERS", "billing", 5), 1);
    assert!(output.try_receive().await.is_none());

    eventually(WAIT, "three error events", || errors.len() >= 3).await;
    let mut kinds = Vec::new();
    while let Some(event) = errors.try_receive().await {
        kinds.push(event.payload().kind());
    }
    assert!(kinds.contains(&"delivery"));
    assert_eq!(kinds.iter().filter(|k| **k == "conversion").count(), 2);

    adapter.stop().await.unwrap();
}
