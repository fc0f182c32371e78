//! NATS JetStream adapters between the internal message bus and a broker.
//!
//! Inbound, listener containers own a consumer subscription and hand every
//! delivered message to a listener, acknowledging only what the listener
//! accepted. Outbound, handlers publish internal messages either waiting for
//! the broker ack or tracking acks in a bounded queue with resends.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!  JetStream consumer ─▶│ ListenerContainer (xN)       │─▶ NatsInboundAdapter ─▶ MessageChannel<T>
//!                       │ worker thread / dispatcher   │        │
//!                       └──────────────────────────────┘        └─▶ error channel (ErrorEvent)
//!
//!  Message<T> ─▶ AsyncOutboundHandler ─▶ AckTrackingQueue ─▶ publish_async ─▶ JetStream
//!                      ▲                                         │
//!                      └──────────── resend (same msg id) ◀──────┘ (nak / timeout / full)
//! ```
//!
//! # Delivery modes
//!
//! | Mode | Worker | Poll |
//! |------|--------|------|
//! | `Pull` | one OS thread per container | batch fetch with `expires = max_wait` |
//! | `PushSync` | one OS thread per container | next pushed messages within `max_wait` |
//! | `PushAsync` | none, dispatcher task | pushed by the broker |
//!
//! Worker threads are named `<container>-nats-C-<n>` and run on the tokio
//! runtime that started the container, which must be multi-threaded.
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_adapter::{
//!     ConcurrentListenerContainer, ConsumerProperties, ContainerSettings, Lifecycle,
//!     NatsInboundAdapter, NatsSubscriptionFactory,
//! };
//! use messaging::{JsonConverter, QueueChannel};
//!
//! let properties = ConsumerProperties::new("ORDERS", "orders.created").with_durable_name("billing");
//! let factory = Arc::new(NatsSubscriptionFactory::new(client, properties));
//! let container = Arc::new(ConcurrentListenerContainer::new(
//!     "billing",
//!     factory,
//!     &ContainerSettings::default().with_concurrency(4),
//! )?);
//!
//! let output = Arc::new(QueueChannel::<Order>::new("orders", 1024));
//! let adapter = NatsInboundAdapter::new("billing-in", container, Arc::new(JsonConverter::new()), output);
//! adapter.start().await?;
//! ```

mod ack_queue;
mod broker;
mod concurrent;
mod config;
mod container;
mod dead_letter;
mod dispatch;
mod error;
mod events;
pub mod headers;
mod health;
mod inbound;
mod lifecycle;
mod memory;
pub mod metrics;
mod nats;
mod outbound;

pub use ack_queue::{AckTrackingQueue, Tracked};
pub use broker::{
    listener_fn, AckFuture, Acknowledger, DeliveryMetadata, ListenerFn, ListenerOutcome,
    MessageListener, PublishReceipt, Publisher, RawBrokerMessage, Subscription,
    SubscriptionFactory,
};
pub use concurrent::ConcurrentListenerContainer;
pub use config::{ConsumerProperties, ContainerSettings, DeliveryMode, ProducerConfig};
pub use container::{ContainerState, ListenerContainer, MessageListenerContainer};
pub use dead_letter::{ensure_dead_letter_stream, DeadLetterChannel, ERROR_KIND};
pub use dispatch::spawn_dispatcher;
pub use error::NatsError;
pub use events::{ErrorEvent, MessageConversionError, MessageDeliveryError};
pub use health::{HealthServer, HealthState, HealthStatus};
pub use inbound::NatsInboundAdapter;
pub use lifecycle::{Lifecycle, LifecycleGroup};
pub use memory::{InMemoryBroker, InMemorySubscriptionFactory, StoredMessage};
pub use metrics::{init_metrics, AdapterMetrics};
pub use nats::{connect, NatsPublisher, NatsSubscriptionFactory};
pub use outbound::{AckStatus, AckTicket, AsyncOutboundHandler, SyncOutboundHandler};

// Re-export from messaging
pub use messaging::{ErrorCategory, Message, MessageChannel, PayloadConverter, ProcessingError};
