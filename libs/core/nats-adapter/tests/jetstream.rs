//! Adapters against a real JetStream server.
//!
//! Run with: cargo test -p nats-adapter --test jetstream -- --ignored

use core_config::nats::NatsConfig;
use messaging::{JsonConverter, Message, PollableChannel, QueueChannel};
use nats_adapter::{
    connect, headers, AckStatus, AsyncOutboundHandler, ConcurrentListenerContainer,
    ConsumerProperties, ContainerSettings, DeadLetterChannel, DeliveryMode, ErrorEvent,
    Lifecycle, MessageListenerContainer, NatsInboundAdapter, NatsPublisher,
    NatsSubscriptionFactory, ProducerConfig, SyncOutboundHandler,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestNats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: f64,
}

const WAIT: Duration = Duration::from_secs(10);

fn reading(value: f64) -> Message<Reading> {
    Message::new(Reading {
        sensor: "t-1".into(),
        value,
    })
}

async fn round_trip(mode: DeliveryMode, test_name: &str) {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name(test_name);
    let stream = names.stream("readings");
    let subject = names.subject("readings", "created");
    nats.create_stream(&stream, &[&names.subject("readings", ">")]).await;

    let client = connect(&NatsConfig::new(nats.connection_string()))
        .await
        .unwrap();
    let properties = ConsumerProperties::new(&stream, &subject)
        .with_durable_name(names.durable("reader"))
        .with_max_wait(Duration::from_millis(200));
    let container = Arc::new(
        ConcurrentListenerContainer::new(
            "reader",
            Arc::new(NatsSubscriptionFactory::new(client.clone(), properties)),
            &ContainerSettings::default()
                .with_delivery_mode(mode)
                .with_concurrency(2),
        )
        .unwrap(),
    );
    let output = Arc::new(QueueChannel::<Reading>::new("readings", 16));
    let adapter = NatsInboundAdapter::new(
        "reader-in",
        container.clone(),
        Arc::new(JsonConverter::new()),
        output.clone(),
    );
    adapter.start().await.unwrap();

    let producer = AsyncOutboundHandler::new(
        ProducerConfig::new(&subject),
        Arc::new(NatsPublisher::new(client)),
        Arc::new(JsonConverter::new()),
    );
    let sent = reading(21.5);
    let ticket = producer.send(sent.clone()).await.unwrap();
    assert!(matches!(ticket.wait().await, AckStatus::Acknowledged(_)));

    let received = output.receive(WAIT).await.expect("reading delivered");
    assert_eq!(received.payload(), sent.payload());
    assert_eq!(received.header(headers::SUBJECT), Some(subject.as_str()));
    assert_eq!(received.header(headers::DELIVERED), Some("1"));

    adapter.stop().await.unwrap();
    assert_eq!(container.live_workers(), 0);
    assert!(producer.close(WAIT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_pull_round_trip() {
    round_trip(DeliveryMode::Pull, "test_pull_round_trip").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_push_sync_round_trip() {
    round_trip(DeliveryMode::PushSync, "test_push_sync_round_trip").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_push_async_round_trip() {
    round_trip(DeliveryMode::PushAsync, "test_push_async_round_trip").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn test_resend_with_same_id_is_deduplicated() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_resend_with_same_id_is_deduplicated");
    let stream = names.stream("readings");
    let subject = names.subject("readings", "created");
    nats.create_stream(&stream, &[&names.subject("readings", ">")]).await;

    let publisher = Arc::new(NatsPublisher::new(nats.client()));
    let handler = SyncOutboundHandler::new(&subject, publisher, Arc::new(JsonConverter::new()));

    let message = Message::builder(Reading {
        sensor: "t-1".into(),
        value: 1.0,
    })
    .id(names.message_id())
    .build();
    let first = handler.handle(Some(&message)).await.unwrap().unwrap();
    let second = handler.handle(Some(&message)).await.unwrap().unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(nats.stream_messages(&stream).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn test_missing_stream_fails_publish_and_start() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_missing_stream_fails_publish_and_start");
    let subject = names.subject("nowhere", "created");

    let handler = SyncOutboundHandler::new(
        &subject,
        Arc::new(NatsPublisher::new(nats.client())),
        Arc::new(JsonConverter::new()),
    );
    assert!(handler.handle(Some(&reading(2.0))).await.is_err());

    let container = ConcurrentListenerContainer::new(
        "nowhere",
        Arc::new(NatsSubscriptionFactory::new(
            nats.client(),
            ConsumerProperties::new(names.stream("nowhere"), &subject),
        )),
        &ContainerSettings::default(),
    )
    .unwrap();
    container.set_listener(Arc::new(nats_adapter::listener_fn(|_| {
        nats_adapter::ListenerOutcome::Ack
    })));
    assert!(container.start().await.is_err());
    assert!(!container.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_malformed_message_is_dead_lettered() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_malformed_message_is_dead_lettered");
    let stream = names.stream("readings");
    let subject = names.subject("readings", "created");
    let dlq_prefix = names.subject("dlq", "readings");
    nats.create_stream(&stream, &[&names.subject("readings", ">")]).await;
    nats_adapter::ensure_dead_letter_stream(&nats.jetstream(), &names.stream("dlq"), &dlq_prefix)
        .await
        .unwrap();

    let publisher = Arc::new(NatsPublisher::new(nats.client()));
    let container = Arc::new(
        ConcurrentListenerContainer::new(
            "reader",
            Arc::new(NatsSubscriptionFactory::new(
                nats.client(),
                ConsumerProperties::new(&stream, &subject)
                    .with_durable_name(names.durable("reader"))
                    .with_max_wait(Duration::from_millis(200))
                    .with_max_deliver(1),
            )),
            &ContainerSettings::default(),
        )
        .unwrap(),
    );
    let output = Arc::new(QueueChannel::<Reading>::new("readings", 16));
    let adapter = NatsInboundAdapter::new(
        "reader-in",
        container,
        Arc::new(JsonConverter::new()),
        output.clone(),
    )
    .with_error_channel(Arc::new(DeadLetterChannel::new(&dlq_prefix, publisher.clone())));
    adapter.start().await.unwrap();

    let raw = SyncOutboundHandler::new(&subject, publisher, Arc::new(messaging::StringConverter));
    raw.handle(Some(&Message::new("{broken".to_string()))).await.unwrap();
    raw.handle(Some(&Message::new(r#"{"sensor":"t-1","value":3.0}"#.to_string())))
        .await
        .unwrap();

    let received = output.receive(WAIT).await.expect("good reading delivered");
    assert_eq!(received.payload().value, 3.0);

    let mut dead = nats
        .jetstream()
        .get_stream(names.stream("dlq"))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while dead.info().await.unwrap().state.messages == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no dead letter arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let stored = dead.get_last_raw_message_by_subject(&format!("{dlq_prefix}.conversion")).await.unwrap();
    let event: ErrorEvent = serde_json::from_slice(&stored.payload).unwrap();
    assert_eq!(event.kind(), "conversion");
    assert_eq!(event.subject(), subject);

    adapter.stop().await.unwrap();
}
