//! Shared test utilities for the NATS adapter crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic stream, subject and consumer names (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_jetstream_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_jetstream_test");
//!
//!     let subject = names.subject("orders", "created");
//!     nats.create_stream(&names.stream("orders"), &[&names.subject("orders", ">")]).await;
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test names with deterministic randomization
///
/// Tests sharing one broker stay isolated as long as each derives its names
/// from its own test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_round_trip");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic message id
    pub fn message_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Stream name, upper case as JetStream convention has it
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.stream("orders"), "TEST_ORDERS_7");
    /// ```
    pub fn stream(&self, prefix: &str) -> String {
        format!("TEST_{}_{}", prefix.to_uppercase(), self.seed)
    }

    /// Subject under this test's namespace, e.g. `test.7.orders.created`
    pub fn subject(&self, prefix: &str, suffix: &str) -> String {
        format!("test.{}.{}.{}", self.seed, prefix, suffix)
    }

    /// Durable consumer name
    pub fn durable(&self, prefix: &str) -> String {
        format!("test-{}-{}", prefix, self.seed)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::{Duration, Instant};

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 10ms until it holds, panicking after `timeout`
    pub async fn eventually(timeout: Duration, context: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !check() {
            if Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
