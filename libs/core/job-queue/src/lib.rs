//! Job Queue
//!
//! A message-queue abstraction for background jobs with interchangeable broker
//! engines.
//!
//! ## Features
//!
//! - **One contract**: [`Publisher`] and [`Consumer`] over every engine
//! - **Redis Streams**: consumer groups, crash recovery by claiming idle
//!   entries, bounded retries, a dead-letter stream, delayed and scheduled jobs
//! - **AMQP**: topic exchanges with broker-native dead-lettering and publisher
//!   confirms
//! - **Pooling**: [`Pool`] borrows an engine per call from a `bb8` pool
//! - **Concurrency limits**: per-key admission with [`ConcurrencyManager`]
//! - **Workers**: [`WorkerPool`] runs consume loops with restart and graceful stop
//! - **Observability**: Prometheus metrics and Axum health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{Ack, JobRunner, Queue, RedisStreams, RedisStreamsOptions, WorkerPool, job_fn};
//!
//! let engine = Arc::new(RedisStreams::connect(&redis_url, RedisStreamsOptions::default()).await?);
//! let queue = Queue::with_namespace("emails", "app")?;
//!
//! engine.enqueue(&queue, json!({"to": "ada@example.com"})).await?;
//!
//! let runner = JobRunner::new(queue.clone(), job_fn(|message| async move {
//!     send_email(message.payload()).await?;
//!     Ok(Ack::Ack)
//! }));
//!
//! let pool = WorkerPool::shared(queue, engine.clone(), engine, Arc::new(runner), 4)?;
//! pool.start().await?;
//! ```

pub mod broker;
pub mod concurrency;
mod error;
pub mod handler;
pub mod health;
mod message;
pub mod metrics;
mod queue;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod worker;

pub use broker::{
    Amqp, AmqpOptions, BrokerManager, Consumer, ConsumerInfo, GroupInfo, Pool, Publisher, QueueStats,
    RedisStreams, RedisStreamsOptions, StreamInfo, StreamKeys,
};
pub use concurrency::{ConcurrencyKey, ConcurrencyManager, CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use error::{ErrorCategory, JobError, QueueError, QueueResult, ScheduleError};
pub use handler::{Ack, JobResult, MessageHandler};
pub use health::{HealthState, health_router};
pub use message::Message;
pub use metrics::{QueueMetrics, init_metrics};
pub use queue::{DEFAULT_NAMESPACE, Queue};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use runner::{Job, JobRunner, job_fn};
pub use schedule::{CronExpression, Schedule};
pub use worker::WorkerPool;
