//! Configuration for consumers, containers and producers.

use core_config::{env_or_default, env_parse, env_required, ConfigError, FromEnv};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How messages reach a listener container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The container's worker fetches batches from a pull consumer.
    Pull,
    /// The broker pushes; the container's worker takes messages one poll at a time.
    PushSync,
    /// The broker pushes to a dispatcher task; the container owns no thread.
    PushAsync,
}

impl DeliveryMode {
    /// Whether containers in this mode own a dedicated worker thread.
    pub fn owns_worker(&self) -> bool {
        !matches!(self, DeliveryMode::PushAsync)
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Pull => write!(f, "pull"),
            DeliveryMode::PushSync => write!(f, "push_sync"),
            DeliveryMode::PushAsync => write!(f, "push_async"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pull" => Ok(DeliveryMode::Pull),
            "push_sync" => Ok(DeliveryMode::PushSync),
            "push_async" => Ok(DeliveryMode::PushAsync),
            other => Err(format!(
                "unknown delivery mode '{other}', expected pull, push_sync or push_async"
            )),
        }
    }
}

/// Consumer identity and polling settings, fixed once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerProperties {
    stream: String,
    subject: String,
    durable_name: Option<String>,
    queue_group: Option<String>,
    max_wait: Duration,
    ack_wait: Duration,
    max_deliver: i64,
    pull_batch_size: usize,
    bind_only: bool,
}

impl ConsumerProperties {
    pub fn new(stream: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            subject: subject.into(),
            durable_name: None,
            queue_group: None,
            max_wait: Duration::from_secs(1),
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            pull_batch_size: 50,
            bind_only: false,
        }
    }

    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Poll timeout for a single fetch.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Maximum deliveries per message; `-1` means unlimited.
    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Only bind to an existing consumer instead of creating it.
    pub fn with_bind_only(mut self, bind_only: bool) -> Self {
        self.bind_only = bind_only;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn durable_name(&self) -> Option<&str> {
        self.durable_name.as_deref()
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Broker-side consumer shared by every subscriber built from these
    /// properties: the durable name, else the queue group. `None` means each
    /// subscription gets its own ephemeral consumer.
    pub fn consumer_name(&self) -> Option<&str> {
        self.durable_name().or(self.queue_group())
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    pub fn max_deliver(&self) -> i64 {
        self.max_deliver
    }

    pub fn pull_batch_size(&self) -> usize {
        self.pull_batch_size
    }

    pub fn bind_only(&self) -> bool {
        self.bind_only
    }
}

impl FromEnv for ConsumerProperties {
    /// Requires NATS_CONSUMER_STREAM and NATS_CONSUMER_SUBJECT. Optional:
    /// NATS_CONSUMER_DURABLE, NATS_CONSUMER_QUEUE_GROUP, NATS_CONSUMER_MAX_WAIT_MS,
    /// NATS_CONSUMER_ACK_WAIT_MS, NATS_CONSUMER_MAX_DELIVER, NATS_CONSUMER_BATCH_SIZE,
    /// NATS_CONSUMER_BIND_ONLY.
    fn from_env() -> Result<Self, ConfigError> {
        let mut properties = Self::new(
            env_required("NATS_CONSUMER_STREAM")?,
            env_required("NATS_CONSUMER_SUBJECT")?,
        )
        .with_max_wait(Duration::from_millis(env_parse(
            "NATS_CONSUMER_MAX_WAIT_MS",
            1000,
        )?))
        .with_ack_wait(Duration::from_millis(env_parse(
            "NATS_CONSUMER_ACK_WAIT_MS",
            30_000,
        )?))
        .with_max_deliver(env_parse("NATS_CONSUMER_MAX_DELIVER", -1)?)
        .with_pull_batch_size(env_parse("NATS_CONSUMER_BATCH_SIZE", 50)?)
        .with_bind_only(env_parse("NATS_CONSUMER_BIND_ONLY", false)?);

        if let Some(durable) = non_empty(env_or_default("NATS_CONSUMER_DURABLE", "")) {
            properties = properties.with_durable_name(durable);
        }
        if let Some(group) = non_empty(env_or_default("NATS_CONSUMER_QUEUE_GROUP", "")) {
            properties = properties.with_queue_group(group);
        }

        Ok(properties)
    }
}

/// Settings shared by listener containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub delivery_mode: DeliveryMode,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
    pub auto_startup: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Pull,
            concurrency: 1,
            shutdown_grace: Duration::from_secs(10),
            auto_startup: true,
        }
    }
}

impl ContainerSettings {
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl FromEnv for ContainerSettings {
    /// Reads NATS_DELIVERY_MODE (default pull), NATS_CONCURRENCY (default 1)
    /// and NATS_SHUTDOWN_GRACE_MS (default 10000).
    fn from_env() -> Result<Self, ConfigError> {
        let concurrency: usize = env_parse("NATS_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::ParseError {
                key: "NATS_CONCURRENCY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            delivery_mode: env_parse("NATS_DELIVERY_MODE", DeliveryMode::Pull)?,
            concurrency,
            shutdown_grace: Duration::from_millis(env_parse("NATS_SHUTDOWN_GRACE_MS", 10_000)?),
            auto_startup: true,
        })
    }
}

/// Settings for the asynchronous outbound handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub subject: String,
    pub ack_queue_capacity: usize,
    pub ack_queue_capacity_timeout: Duration,
    pub ack_server_timeout: Duration,
    pub max_resend_count: u32,
    /// Occupancy percentage at which sends start slowing down
    pub backpressure_threshold: u8,
    pub backpressure_base_delay: Duration,
}

impl ProducerConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ack_queue_capacity: 100_000,
            ack_queue_capacity_timeout: Duration::from_secs(1),
            ack_server_timeout: Duration::from_secs(1),
            max_resend_count: 3,
            backpressure_threshold: 75,
            backpressure_base_delay: Duration::from_millis(1),
        }
    }

    pub fn with_ack_queue_capacity(mut self, capacity: usize) -> Self {
        self.ack_queue_capacity = capacity;
        self
    }

    pub fn with_ack_queue_capacity_timeout(mut self, timeout: Duration) -> Self {
        self.ack_queue_capacity_timeout = timeout;
        self
    }

    pub fn with_ack_server_timeout(mut self, timeout: Duration) -> Self {
        self.ack_server_timeout = timeout;
        self
    }

    pub fn with_max_resend_count(mut self, count: u32) -> Self {
        self.max_resend_count = count;
        self
    }

    pub fn with_backpressure(mut self, threshold: u8, base_delay: Duration) -> Self {
        self.backpressure_threshold = threshold.min(100);
        self.backpressure_base_delay = base_delay;
        self
    }
}

impl FromEnv for ProducerConfig {
    /// Requires NATS_PRODUCER_SUBJECT. Optional: NATS_ACK_QUEUE_CAPACITY,
    /// NATS_ACK_QUEUE_CAPACITY_TIMEOUT_MS, NATS_ACK_SERVER_TIMEOUT_MS,
    /// NATS_MAX_ACK_FULL_QUEUE_RESEND_COUNT.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(env_required("NATS_PRODUCER_SUBJECT")?);

        let capacity: usize = env_parse("NATS_ACK_QUEUE_CAPACITY", defaults.ack_queue_capacity)?;
        if capacity == 0 {
            return Err(ConfigError::ParseError {
                key: "NATS_ACK_QUEUE_CAPACITY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            ack_queue_capacity: capacity,
            ack_queue_capacity_timeout: Duration::from_millis(env_parse(
                "NATS_ACK_QUEUE_CAPACITY_TIMEOUT_MS",
                1000,
            )?),
            ack_server_timeout: Duration::from_millis(env_parse(
                "NATS_ACK_SERVER_TIMEOUT_MS",
                1000,
            )?),
            max_resend_count: env_parse(
                "NATS_MAX_ACK_FULL_QUEUE_RESEND_COUNT",
                defaults.max_resend_count,
            )?,
            ..defaults
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
