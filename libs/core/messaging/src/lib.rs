//! Internal message bus abstractions shared by broker adapters.
//!
//! This library provides backend-agnostic building blocks that broker adapters
//! (such as `nats-adapter`) bridge to and from:
//! - **Messages**: immutable envelopes with an id, headers and a typed payload
//! - **Channels**: point-to-point (`DirectChannel`) and buffered (`QueueChannel`) destinations
//! - **Handlers**: the consuming end of a channel
//! - **Converters**: payload (de)serialization to wire bytes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  send   ┌──────────────────┐  handle  ┌────────────────┐
//! │ Inbound adapter │───────▶│  MessageChannel  │────────▶│ MessageHandler │
//! └─────────────────┘         └──────────────────┘          └────────────────┘
//!                                      │ receive (pollable)
//!                                      ▼
//!                             ┌──────────────────┐
//!                             │ Outbound handler │
//!                             └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use messaging::{Message, PayloadConverter, StringConverter};
//!
//! let message = Message::builder("hello".to_string())
//!     .header("tenant", "acme")
//!     .build();
//!
//! let bytes = StringConverter.to_wire(message.payload()).unwrap();
//! assert_eq!(bytes, b"hello");
//! assert_eq!(message.header("tenant"), Some("acme"));
//! ```

mod backoff;
mod channel;
mod converter;
mod error;
mod handler;
mod message;

pub use backoff::BackoffStrategy;
pub use channel::{DirectChannel, MessageChannel, PollableChannel, QueueChannel};
pub use converter::{BytesConverter, ConversionError, JsonConverter, PayloadConverter, StringConverter};
pub use error::{ErrorCategory, ProcessingError};
pub use handler::{handler_fn, FailingHandler, FnHandler, MessageHandler};
pub use message::{Message, MessageBuilder, MessageHeaders};
