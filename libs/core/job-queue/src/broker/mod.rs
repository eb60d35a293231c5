//! Broker engines behind one producer/consumer contract.
//!
//! - [`RedisStreams`]: consumer groups on Redis Streams, with claim-based crash
//!   recovery, delayed and scheduled jobs, and a DLQ stream
//! - [`Amqp`]: exchange/queue topology on an AMQP 0-9-1 broker with publisher
//!   confirms and broker-native dead-lettering
//! - [`Pool`]: borrows an engine from a connection pool for every call

mod amqp;
mod pool;
mod redis_streams;

pub use amqp::{Amqp, AmqpOptions};
pub use pool::{BrokerManager, Pool};
pub use redis_streams::{
    ConsumerInfo, GroupInfo, QueueStats, RedisStreams, RedisStreamsOptions, StreamInfo, StreamKeys,
};

use crate::error::QueueResult;
use crate::handler::MessageHandler;
use crate::queue::Queue;
use async_trait::async_trait;
use serde_json::Value;

/// Producer-facing half of an engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Persist a new message carrying `payload`; returns whether the broker accepted it
    async fn enqueue(&self, queue: &Queue, payload: Value) -> QueueResult<bool>;

    /// Move up to `limit` dead-lettered messages back onto the queue (all when `None`)
    async fn retry(&self, queue: &Queue, limit: Option<usize>) -> QueueResult<()>;

    /// Number of waiting messages, or of dead-lettered ones when `failed` is set
    async fn get_queue_size(&self, queue: &Queue, failed: bool) -> QueueResult<u64>;

    /// Whether the broker is reachable
    async fn ping(&self) -> QueueResult<bool>;
}

/// Worker-facing half of an engine
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Deliver messages from `queue` to `handler` until [`close`](Consumer::close) is called.
    ///
    /// Returns `Ok(())` once closed; transport failures are returned as errors.
    async fn consume(&self, queue: &Queue, handler: &dyn MessageHandler) -> QueueResult<()>;

    /// Stop accepting new work; a message already being handled runs to completion
    async fn close(&self) -> QueueResult<()>;
}
