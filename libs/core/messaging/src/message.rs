//! Message envelope carried on the internal bus.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header map attached to every message.
pub type MessageHeaders = BTreeMap<String, String>;

/// An immutable message: id, creation timestamp, headers and payload.
///
/// Messages are never mutated in place. Methods that "change" a message
/// (`with_header`, `map`) consume it and return a new value that keeps the
/// original id, so downstream deduplication keeps working across resends.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    id: Uuid,
    timestamp: DateTime<Utc>,
    headers: MessageHeaders,
    payload: T,
}

impl<T> Message<T> {
    /// Create a message with a fresh id and no headers.
    pub fn new(payload: T) -> Self {
        Self::builder(payload).build()
    }

    /// Start building a message around `payload`.
    pub fn builder(payload: T) -> MessageBuilder<T> {
        MessageBuilder {
            id: None,
            headers: MessageHeaders::new(),
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Look up a single header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Return a copy of this message with `key` set to `value`.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Transform the payload, keeping id, timestamp and headers.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            timestamp: self.timestamp,
            headers: self.headers,
            payload: f(self.payload),
        }
    }

    pub fn into_parts(self) -> (MessageHeaders, T) {
        (self.headers, self.payload)
    }
}

/// Builder for [`Message`].
#[derive(Debug)]
pub struct MessageBuilder<T> {
    id: Option<Uuid>,
    headers: MessageHeaders,
    payload: T,
}

impl<T> MessageBuilder<T> {
    /// Reuse an existing id (e.g. when rebuilding a resent message).
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(self) -> Message<T> {
        Message {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            timestamp: Utc::now(),
            headers: self.headers,
            payload: self.payload,
        }
    }
}
