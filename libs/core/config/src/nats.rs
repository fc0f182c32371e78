use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// NATS connection configuration
#[derive(Clone, Debug)]
pub struct NatsConfig {
    pub url: String,
    pub client_name: String,
    pub connect_timeout: Duration,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }
}

impl FromEnv for NatsConfig {
    /// Reads from environment variables with defaults:
    /// - NATS_URL: defaults to nats://localhost:4222
    /// - NATS_CLIENT_NAME: defaults to nats-adapter
    /// - NATS_CONNECT_TIMEOUT_MS: defaults to 5000
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_or_default("NATS_URL", "nats://localhost:4222"),
            client_name: env_or_default("NATS_CLIENT_NAME", "nats-adapter"),
            connect_timeout: Duration::from_millis(env_parse("NATS_CONNECT_TIMEOUT_MS", 5000)?),
        })
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "nats-adapter".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
