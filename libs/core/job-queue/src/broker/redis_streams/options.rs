//! Tuning for the Redis Streams engine.

use crate::error::{QueueError, QueueResult};
use redis::aio::ConnectionManagerConfig;
use std::time::Duration;
use uuid::Uuid;

/// Headroom of the client response timeout over `block_timeout`
const RESPONSE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Options for [`RedisStreams`](super::RedisStreams)
#[derive(Debug, Clone)]
pub struct RedisStreamsOptions {
    /// Exact `MAXLEN` applied on every append; `None` disables trimming
    pub max_stream_length: Option<usize>,

    /// Redeliveries of a retryable failure before it is dead-lettered
    pub max_retries: u32,

    /// Minimum idle time before another consumer may claim a pending entry
    pub claim_idle: Duration,

    /// Entries claimed per consume iteration
    pub claim_batch: usize,

    /// `BLOCK` timeout of the group read
    pub block_timeout: Duration,

    /// Minimum time between two delayed/scheduled promotion passes
    pub promotion_interval: Duration,

    /// Due delayed entries or schedules promoted per pass
    pub promotion_batch: usize,

    /// Consumer name within the group
    pub consumer_id: String,
}

impl RedisStreamsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stream_length(mut self, max_stream_length: Option<usize>) -> Self {
        self.max_stream_length = max_stream_length;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    pub fn with_claim_batch(mut self, claim_batch: usize) -> Self {
        self.claim_batch = claim_batch;
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_promotion_interval(mut self, promotion_interval: Duration) -> Self {
        self.promotion_interval = promotion_interval;
        self
    }

    pub fn with_promotion_batch(mut self, promotion_batch: usize) -> Self {
        self.promotion_batch = promotion_batch;
        self
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    /// Client response timeout; a blocked group read must not outlive it
    pub fn response_timeout(&self) -> Duration {
        self.block_timeout.saturating_add(RESPONSE_TIMEOUT_MARGIN)
    }

    /// Connection manager settings matching these options
    pub fn connection_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new().set_response_timeout(Some(self.response_timeout()))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_stream_length == Some(0) {
            return Err(QueueError::config("max stream length must be positive or unset"));
        }
        if self.claim_batch == 0 {
            return Err(QueueError::config("claim batch must be at least 1"));
        }
        if self.promotion_batch == 0 {
            return Err(QueueError::config("promotion batch must be at least 1"));
        }
        if self.block_timeout.is_zero() {
            // BLOCK 0 waits forever and would never observe close()
            return Err(QueueError::config("block timeout must be positive"));
        }
        if self.consumer_id.trim().is_empty() {
            return Err(QueueError::config("consumer id must not be empty"));
        }
        Ok(())
    }
}

impl Default for RedisStreamsOptions {
    fn default() -> Self {
        Self {
            max_stream_length: Some(10_000),
            max_retries: 3,
            claim_idle: Duration::from_millis(30_000),
            claim_batch: 10,
            block_timeout: Duration::from_millis(2_000),
            promotion_interval: Duration::from_millis(1_000),
            promotion_batch: 100,
            consumer_id: format!("worker-{}", Uuid::new_v4().simple()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RedisStreamsOptions::default();
        assert_eq!(options.max_stream_length, Some(10_000));
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.claim_idle, Duration::from_secs(30));
        assert_eq!(options.block_timeout, Duration::from_secs(2));
        assert!(options.consumer_id.starts_with("worker-"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_response_timeout_outlasts_block() {
        let options = RedisStreamsOptions::default();
        assert_eq!(options.response_timeout(), Duration::from_secs(7));

        let long = RedisStreamsOptions::new().with_block_timeout(Duration::from_secs(60));
        assert!(long.response_timeout() > long.block_timeout);
    }

    #[test]
    fn test_builder() {
        let options = RedisStreamsOptions::new()
            .with_max_stream_length(None)
            .with_max_retries(0)
            .with_consumer_id("worker-1");

        assert_eq!(options.max_stream_length, None);
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.consumer_id, "worker-1");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        assert!(RedisStreamsOptions::new().with_max_stream_length(Some(0)).validate().is_err());
        assert!(RedisStreamsOptions::new().with_claim_batch(0).validate().is_err());
        assert!(RedisStreamsOptions::new().with_block_timeout(Duration::ZERO).validate().is_err());
        assert!(RedisStreamsOptions::new().with_consumer_id(" ").validate().is_err());
    }
}
