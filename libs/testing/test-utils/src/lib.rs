//! Shared test utilities for queue engine testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestRabbitMq`: RabbitMQ container with the management API (feature: "rabbitmq")
//! - `TestDataBuilder`: deterministic queue/namespace naming (always available)
//!
//! # Features
//!
//! - `redis` (default): Enables Redis test infrastructure
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables everything
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["all"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestDataBuilder::from_test_name("my_queue_test");
//!     let namespace = names.namespace();
//!     // ...
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;
#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic naming
///
/// Seeding from the test name keeps keys stable across runs while keeping
/// tests that share a container from colliding.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_enqueue");
    /// assert_eq!(builder.namespace(), TestDataBuilder::from_test_name("test_enqueue").namespace());
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic UUID derived from the seed
    pub fn id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Namespace unique to this test, e.g. `test-1234`
    pub fn namespace(&self) -> String {
        format!("test-{}", self.seed)
    }

    /// Queue name unique to this test, e.g. `test-1234-emails`
    pub fn queue_name(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.id(), builder2.id());
        assert_eq!(builder1.queue_name("jobs"), builder2.queue_name("jobs"));
        assert_eq!(builder1.namespace(), "test-42");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.id(), builder2.id());
        assert_ne!(builder1.namespace(), builder2.namespace());
    }
}
