//! Outbound handlers: internal bus messages out to the broker.

mod async_handler;
mod sync_handler;

pub use async_handler::{AckStatus, AckTicket, AsyncOutboundHandler};
pub use sync_handler::SyncOutboundHandler;

use crate::headers;
use messaging::{Message, MessageHeaders};

/// Broker headers for publishing `message`.
///
/// Inbound delivery metadata and the failure history are dropped, and the
/// message id becomes the JetStream dedup id so resends are not stored twice.
pub(crate) fn outbound_headers<T>(message: &Message<T>) -> MessageHeaders {
    let mut out: MessageHeaders = message
        .headers()
        .iter()
        .filter(|(key, _)| {
            !headers::INBOUND_ONLY.contains(&key.as_str()) && key.as_str() != headers::FAILURE_HISTORY
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    out.insert(headers::MSG_ID.to_string(), message.id().to_string());
    out
}
