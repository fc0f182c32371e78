//! Throwaway JetStream server for adapter integration tests.

use async_nats::jetstream::{self, stream};
use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

const CLIENT_PORT: u16 = 4222;

/// A `nats-server -js` container plus a connected client.
///
/// The container lives as long as this value. Streams are created on demand
/// with [`TestNats::create_stream`], so tests pick their own names (see
/// [`crate::TestDataBuilder`]) and never share state.
pub struct TestNats {
    _container: ContainerAsync<Nats>,
    client: Client,
    connection_string: String,
}

impl TestNats {
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag("latest")
            .with_cmd(["-js"])
            .start()
            .await
            .expect("Failed to start JetStream container");
        let port = container
            .get_host_port_ipv4(CLIENT_PORT)
            .await
            .expect("JetStream container exposes no client port");

        let connection_string = format!("nats://127.0.0.1:{port}");
        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to JetStream container");
        tracing::info!(%connection_string, "JetStream test server ready");

        Self {
            _container: container,
            client,
            connection_string,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    /// URL for adapters that open their own connection.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Create a stream capturing `subjects`, panicking if the server refuses.
    pub async fn create_stream(&self, name: &str, subjects: &[&str]) {
        self.jetstream()
            .create_stream(stream::Config {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .unwrap_or_else(|e| panic!("Failed to create stream '{name}': {e}"));
    }

    /// Messages currently stored in `stream`.
    pub async fn stream_messages(&self, stream: &str) -> u64 {
        let mut handle = self
            .jetstream()
            .get_stream(stream)
            .await
            .unwrap_or_else(|e| panic!("Stream '{stream}' not found: {e}"));
        handle
            .info()
            .await
            .unwrap_or_else(|e| panic!("No info for stream '{stream}': {e}"))
            .state
            .messages
    }
}
