//! NATS Bridge Service
//!
//! Consumes one JetStream subject and republishes every message to another,
//! waiting for nothing on the hot path: the inbound side acknowledges once a
//! message is buffered, the outbound side tracks broker acks and resends on
//! its own.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (NATS_CONSUMER_STREAM / NATS_CONSUMER_SUBJECT)
//!   ↓ (ConcurrentListenerContainer, NATS_DELIVERY_MODE x NATS_CONCURRENCY)
//! NatsInboundAdapter<Vec<u8>> ──▶ dead letters (conversion / delivery)
//!   ↓
//! QueueChannel (relay buffer)
//!   ↓ (relay loop, original message id kept)
//! AsyncOutboundHandler<Vec<u8>> ──▶ dead letters (publish exhausted)
//!   ↓
//! NATS JetStream (NATS_PRODUCER_SUBJECT)
//! ```
//!
//! ## Features
//!
//! - Pull, push-sync and push-async consumers with per-container threads
//! - Bounded ack tracking with resends that JetStream deduplicates
//! - Dead letter stream for failed events
//! - Graceful shutdown handling
//! - Health check endpoints for Kubernetes probes
//! - Prometheus metrics

use core_config::nats::NatsConfig;
use core_config::{app_info, env_or_default, env_parse, ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use messaging::{BytesConverter, Message, PollableChannel, QueueChannel};
use nats_adapter::{
    connect, ensure_dead_letter_stream, headers, init_metrics, AsyncOutboundHandler,
    ConcurrentListenerContainer, ConsumerProperties, ContainerSettings, DeadLetterChannel,
    HealthServer, LifecycleGroup, NatsInboundAdapter, NatsPublisher,
    NatsSubscriptionFactory, ProducerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the relay waits on an empty buffer before rechecking shutdown.
const RELAY_POLL: Duration = Duration::from_millis(500);

/// Bridge-level settings on top of the adapter configs.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub health_port: u16,
    /// Relay buffer between the inbound adapter and the producer
    pub buffer_capacity: usize,
    pub dead_letter_stream: String,
    pub dead_letter_prefix: String,
    /// Time allowed for in-flight publishes to settle on shutdown
    pub drain_timeout: Duration,
}

impl FromEnv for BridgeConfig {
    /// Reads from environment variables with defaults:
    /// - HEALTH_PORT: defaults to 8081
    /// - BRIDGE_BUFFER_CAPACITY: defaults to 1024
    /// - BRIDGE_DEAD_LETTER_STREAM: defaults to DEAD_LETTERS
    /// - BRIDGE_DEAD_LETTER_PREFIX: defaults to dlq.bridge
    /// - BRIDGE_DRAIN_TIMEOUT_MS: defaults to 10000
    fn from_env() -> Result<Self, ConfigError> {
        let buffer_capacity = env_parse("BRIDGE_BUFFER_CAPACITY", 1024usize)?;
        if buffer_capacity == 0 {
            return Err(ConfigError::ParseError {
                key: "BRIDGE_BUFFER_CAPACITY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            health_port: env_parse("HEALTH_PORT", 8081)?,
            buffer_capacity,
            dead_letter_stream: env_or_default("BRIDGE_DEAD_LETTER_STREAM", "DEAD_LETTERS"),
            dead_letter_prefix: env_or_default("BRIDGE_DEAD_LETTER_PREFIX", "dlq.bridge"),
            drain_timeout: Duration::from_millis(env_parse("BRIDGE_DRAIN_TIMEOUT_MS", 10_000)?),
        })
    }
}

/// Run the bridge
///
/// 1. Sets up error reporting and structured logging
/// 2. Connects to NATS and makes sure the dead letter stream exists
/// 3. Starts the consumer containers, the relay loop and the health server
/// 4. On SIGINT/SIGTERM stops consuming, drains the buffer and waits for
///    outstanding publish acks
///
/// # Errors
///
/// Returns an error if configuration is invalid, the NATS connection fails or
/// the consumer cannot bind to its stream.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle = init_metrics();
    let app_info = app_info!();

    info!(
        name = %app_info.name,
        version = %app_info.version,
        "Starting NATS bridge service"
    );
    info!("Environment: {:?}", environment);

    let nats_config = NatsConfig::from_env().wrap_err("Invalid NATS configuration")?;
    let consumer = ConsumerProperties::from_env().wrap_err("Invalid consumer configuration")?;
    let settings = ContainerSettings::from_env().wrap_err("Invalid container configuration")?;
    let producer_config = ProducerConfig::from_env().wrap_err("Invalid producer configuration")?;
    let bridge = BridgeConfig::from_env().wrap_err("Invalid bridge configuration")?;

    info!(
        stream = %consumer.stream(),
        subject = %consumer.subject(),
        durable = ?consumer.durable_name(),
        mode = %settings.delivery_mode,
        concurrency = settings.concurrency,
        target = %producer_config.subject,
        "Bridge configuration loaded"
    );

    let client = connect(&nats_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", nats_config.url))?;
    info!("Connected to NATS successfully");

    let publisher = Arc::new(NatsPublisher::new(client.clone()));
    ensure_dead_letter_stream(
        publisher.jetstream(),
        &bridge.dead_letter_stream,
        &bridge.dead_letter_prefix,
    )
    .await
    .wrap_err("Failed to prepare dead letter stream")?;
    let dead_letters = Arc::new(DeadLetterChannel::new(
        &bridge.dead_letter_prefix,
        publisher.clone(),
    ));

    let producer = AsyncOutboundHandler::new(
        producer_config,
        publisher.clone(),
        Arc::new(BytesConverter),
    )
    .with_failure_channel(dead_letters.clone());

    let container = Arc::new(
        ConcurrentListenerContainer::new(
            "bridge",
            Arc::new(NatsSubscriptionFactory::new(client, consumer)),
            &settings,
        )
        .wrap_err("Failed to create listener container")?,
    );
    let buffer = Arc::new(QueueChannel::<Vec<u8>>::new("bridge-relay", bridge.buffer_capacity));
    let inbound = Arc::new(
        NatsInboundAdapter::new(
            "bridge-inbound",
            container.clone(),
            Arc::new(BytesConverter),
            buffer.clone(),
        )
        .with_error_channel(dead_letters),
    );
    inbound.on_init();

    let mut components = LifecycleGroup::new();
    components.add(container).add(inbound.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_server = match metrics_handle {
        Some(handle) => HealthServer::new(bridge.health_port).with_metrics(handle),
        None => HealthServer::new(bridge.health_port),
    };
    let health = health_server.state();
    health.register(inbound).await;
    health.set_publisher(publisher).await;

    let mut health_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = health_shutdown.changed().await;
        };
        if let Err(e) = health_server.run(shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    components
        .start_all()
        .await
        .wrap_err("Failed to start consumers")?;
    info!("Bridge started, relaying messages...");

    let relayed = relay(buffer.clone(), &producer, shutdown_rx).await;

    info!("Stopping consumers");
    if let Err(e) = components.stop_all().await {
        error!(error = %e, "Failed to stop consumers cleanly");
    }
    let drained = drain(&buffer, &producer).await;

    if !producer.close(bridge.drain_timeout).await {
        warn!(
            in_flight = producer.in_flight(),
            "Shutdown with publishes still unacknowledged"
        );
    }

    info!(relayed = relayed + drained, "NATS bridge service stopped");
    Ok(())
}

/// Forward buffered messages to `producer` until `shutdown` flips.
///
/// Returns the number of messages handed to the producer.
pub async fn relay(
    buffer: Arc<QueueChannel<Vec<u8>>>,
    producer: &AsyncOutboundHandler<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut relayed = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            received = buffer.receive(RELAY_POLL) => {
                if let Some(message) = received {
                    if forward(producer, message).await {
                        relayed += 1;
                    }
                }
            }
        }
    }
    relayed
}

/// Forward whatever is still buffered after the consumers stopped.
async fn drain(
    buffer: &QueueChannel<Vec<u8>>,
    producer: &AsyncOutboundHandler<Vec<u8>>,
) -> usize {
    let mut drained = 0;
    while let Some(message) = buffer.try_receive().await {
        if forward(producer, message).await {
            drained += 1;
        }
    }
    if drained > 0 {
        info!(drained, "Drained relay buffer");
    }
    drained
}

async fn forward(producer: &AsyncOutboundHandler<Vec<u8>>, message: Message<Vec<u8>>) -> bool {
    let message = keep_source_id(message);
    let id = message.id();
    match producer.send(message).await {
        Ok(_) => {
            debug!(message_id = %id, "Message relayed");
            true
        }
        Err(e) => {
            error!(message_id = %id, error = %e, "Failed to relay message");
            false
        }
    }
}

/// Reuse the source message id so a redelivered source message is
/// deduplicated by the target stream.
fn keep_source_id(message: Message<Vec<u8>>) -> Message<Vec<u8>> {
    let Some(id) = message
        .header(headers::MSG_ID)
        .and_then(|raw| Uuid::parse_str(raw).ok())
    else {
        return message;
    };

    let (message_headers, payload) = message.into_parts();
    Message::builder(payload)
        .id(id)
        .headers(message_headers)
        .build()
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
