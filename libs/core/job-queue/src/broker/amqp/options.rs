//! Tuning for the AMQP engine.

use crate::error::{QueueError, QueueResult};
use std::collections::BTreeMap;
use std::time::Duration;

/// Options for [`Amqp`](super::Amqp)
#[derive(Debug, Clone)]
pub struct AmqpOptions {
    /// Heartbeat in seconds; 0 disables it
    pub heartbeat: u16,

    pub connect_timeout: Duration,

    /// Limit on each topology declaration and channel operation
    pub read_write_timeout: Duration,

    /// How long a publish waits for the broker's confirm
    pub ack_timeout: Duration,

    /// Publish attempts when confirms are required
    pub max_enqueue_attempts: u32,

    /// Enable publisher confirms and wait for them on enqueue
    pub require_ack: bool,

    /// Extra arguments for both exchanges
    pub exchange_arguments: BTreeMap<String, String>,

    /// Extra arguments for the working and dead-letter queues
    pub queue_arguments: BTreeMap<String, String>,

    /// Extra `basic.consume` arguments
    pub consumer_arguments: BTreeMap<String, String>,
}

impl AmqpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, heartbeat: u16) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_enqueue_attempts(mut self, attempts: u32) -> Self {
        self.max_enqueue_attempts = attempts;
        self
    }

    pub fn with_require_ack(mut self, require_ack: bool) -> Self {
        self.require_ack = require_ack;
        self
    }

    pub fn with_exchange_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exchange_arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_queue_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queue_arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_consumer_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.consumer_arguments.insert(key.into(), value.into());
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if self.ack_timeout.is_zero() {
            return Err(QueueError::config("ack timeout must be positive"));
        }
        if self.connect_timeout.is_zero() || self.read_write_timeout.is_zero() {
            return Err(QueueError::config("connection timeouts must be positive"));
        }
        if self.max_enqueue_attempts == 0 {
            return Err(QueueError::config("max enqueue attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            heartbeat: 0,
            connect_timeout: Duration::from_secs(3),
            read_write_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(5),
            max_enqueue_attempts: 3,
            require_ack: false,
            exchange_arguments: BTreeMap::new(),
            queue_arguments: BTreeMap::new(),
            consumer_arguments: BTreeMap::new(),
        }
    }
}
