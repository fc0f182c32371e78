//! Header names the adapters read and write.

/// Subject the message was delivered on
pub const SUBJECT: &str = "nats_subject";
pub const DELIVERED: &str = "nats_delivered";
pub const STREAM_SEQUENCE: &str = "nats_stream_sequence";
pub const CONSUMER_SEQUENCE: &str = "nats_consumer_sequence";
/// Broker publish time, RFC 3339
pub const TIMESTAMP: &str = "nats_timestamp";

/// Number of times an async publish has been resent
pub const RESEND_COUNT: &str = "nats_resend_count";
/// JSON array of failure descriptions accumulated across resends
pub const FAILURE_HISTORY: &str = "nats_failure_history";

/// JetStream deduplication header
pub const MSG_ID: &str = "Nats-Msg-Id";

/// Headers that describe a previous delivery and must not be forwarded on publish.
pub const INBOUND_ONLY: [&str; 5] = [
    SUBJECT,
    DELIVERED,
    STREAM_SEQUENCE,
    CONSUMER_SEQUENCE,
    TIMESTAMP,
];
