//! Redis Streams engine.
//!
//! Per queue the engine keeps a main stream read through one consumer group, a
//! dead-letter stream, a delayed sorted set and the two schedule structures
//! (see [`StreamKeys`]). Every consume iteration runs, in order:
//!
//! 1. promote due schedules (rate limited)
//! 2. promote due delayed entries (rate limited)
//! 3. claim entries idle past `claim_idle` from stalled consumers
//! 4. block-read one new entry for this consumer
//!
//! Entries from steps 3 and 4 go through the same processing path: stats are
//! bumped, the handler runs, the entry is acknowledged whatever the outcome,
//! and a failure is re-appended with a higher retry count or dead-lettered.

mod entry;
mod inspect;
mod keys;
mod options;
mod processing;
mod schedules;

pub use inspect::{ConsumerInfo, GroupInfo, QueueStats, StreamInfo};
pub use keys::StreamKeys;
pub use options::RedisStreamsOptions;

use crate::broker::{Consumer, Publisher};
use crate::error::{QueueError, QueueResult};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::queue::Queue;
use async_trait::async_trait;
use chrono::Utc;
use entry::EntryFields;
use processing::PromotionClock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Batch size used by an unbounded [`Publisher::retry`]
const RETRY_BATCH: usize = 100;

/// Idle pause between passes of [`RedisStreams::consume_multiple`]
const MULTI_QUEUE_IDLE: Duration = Duration::from_millis(10);

/// Sorted-set score in milliseconds for a time in seconds
fn score_ms(seconds: i64) -> QueueResult<i64> {
    seconds
        .checked_mul(1000)
        .ok_or_else(|| QueueError::config(format!("time {} seconds is out of range", seconds)))
}

/// Queue engine on Redis Streams consumer groups
///
/// A blocking read occupies the engine's connection until it returns, so
/// concurrent consume loops should each get their own engine.
pub struct RedisStreams {
    redis: ConnectionManager,
    options: RedisStreamsOptions,
    closed: AtomicBool,
    promotions: PromotionClock,
}

impl RedisStreams {
    /// Create an engine on an existing connection.
    ///
    /// The manager's response timeout must exceed `options.block_timeout`,
    /// otherwise blocked reads are cut short by the client; build it with
    /// [`RedisStreamsOptions::connection_config`]. Fails if `options` does not
    /// validate.
    pub fn new(redis: ConnectionManager, options: RedisStreamsOptions) -> QueueResult<Self> {
        options.validate()?;

        Ok(Self {
            redis,
            options,
            closed: AtomicBool::new(false),
            promotions: PromotionClock::default(),
        })
    }

    /// Open a connection to `url` and create an engine on it
    pub async fn connect(url: &str, options: RedisStreamsOptions) -> QueueResult<Self> {
        options.validate()?;

        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new_with_config(client, options.connection_config()).await?;
        info!(consumer_id = %options.consumer_id, "Connected to Redis");

        Self::new(redis, options)
    }

    pub fn options(&self) -> &RedisStreamsOptions {
        &self.options
    }

    /// Consumer name used in the group
    pub fn consumer_id(&self) -> &str {
        &self.options.consumer_id
    }

    pub fn set_consumer_id(&mut self, consumer_id: impl Into<String>) -> QueueResult<()> {
        let consumer_id = consumer_id.into();
        if consumer_id.trim().is_empty() {
            return Err(QueueError::config("consumer id must not be empty"));
        }
        self.options.consumer_id = consumer_id;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a message that becomes visible after `delay_seconds`
    pub async fn enqueue_delayed(&self, queue: &Queue, payload: Value, delay_seconds: i64) -> QueueResult<bool> {
        if delay_seconds < 0 {
            return Err(QueueError::config("delay seconds must be non-negative"));
        }

        let keys = StreamKeys::new(queue);
        let message = Message::new(queue, payload);
        let member = EntryFields::new(&message)?.to_json()?;
        let due_ms = Utc::now()
            .timestamp_millis()
            .checked_add(score_ms(delay_seconds)?)
            .ok_or_else(|| QueueError::config("delay is out of range"))?;

        let mut conn = self.redis.clone();
        let _: i64 = conn.zadd(&keys.delayed, &member, due_ms).await?;

        debug!(
            queue = %queue,
            pid = %message.pid(),
            delay_seconds,
            "Enqueued delayed message"
        );
        Ok(true)
    }

    /// Enqueue a message that becomes visible at `unix_time`; a past time means now
    pub async fn enqueue_at(&self, queue: &Queue, payload: Value, unix_time: i64) -> QueueResult<bool> {
        let delay_seconds = unix_time.saturating_sub(Utc::now().timestamp()).max(0);
        self.enqueue_delayed(queue, payload, delay_seconds).await
    }

    /// Consume several queues in one loop.
    ///
    /// Reads do not block so that no queue starves the others; the loop pauses
    /// briefly after every pass.
    pub async fn consume_multiple(&self, queues: &[Queue], handler: &dyn MessageHandler) -> QueueResult<()> {
        let targets: Vec<(&Queue, StreamKeys)> = queues.iter().map(|q| (q, StreamKeys::new(q))).collect();

        for (_, keys) in &targets {
            self.ensure_group(&keys.stream, &keys.group).await?;
            self.ensure_group(&keys.dlq, &keys.group).await?;
        }

        info!(
            queues = targets.len(),
            consumer_id = %self.consumer_id(),
            "Consuming multiple queues"
        );

        while !self.is_closed() {
            let pass = async {
                for (queue, keys) in &targets {
                    self.maintain(queue, keys, handler).await?;
                }
                for (queue, keys) in &targets {
                    for entry in self.read_group(keys, None).await? {
                        self.process_entry(queue, keys, entry, handler).await?;
                    }
                }
                Ok::<_, QueueError>(())
            };

            match pass.await {
                Ok(()) => tokio::time::sleep(MULTI_QUEUE_IDLE).await,
                Err(e) if self.is_closed() => {
                    debug!(error = %e, "Error after close, stopping");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(consumer_id = %self.consumer_id(), "Stopped consuming");
        Ok(())
    }

    /// Create the consumer group, and the stream with it; an existing group is fine
    pub(crate) async fn ensure_group(&self, stream: &str, group: &str) -> QueueResult<()> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Append an entry, trimming to the configured length
    pub(crate) async fn append(&self, stream: &str, fields: &EntryFields) -> QueueResult<String> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = self.options.max_stream_length {
            cmd.arg("MAXLEN").arg(max_len);
        }
        cmd.arg("*");
        for (name, value) in fields.pairs() {
            cmd.arg(name).arg(value);
        }

        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl Publisher for RedisStreams {
    async fn enqueue(&self, queue: &Queue, payload: Value) -> QueueResult<bool> {
        let keys = StreamKeys::new(queue);
        self.ensure_group(&keys.stream, &keys.group).await?;

        let message = Message::new(queue, payload);
        let stream_id = self.append(&keys.stream, &EntryFields::new(&message)?).await?;

        debug!(
            queue = %queue,
            pid = %message.pid(),
            stream_id = %stream_id,
            "Enqueued message"
        );
        Ok(true)
    }

    async fn retry(&self, queue: &Queue, limit: Option<usize>) -> QueueResult<()> {
        let keys = StreamKeys::new(queue);
        self.ensure_group(&keys.stream, &keys.group).await?;

        let mut conn = self.redis.clone();
        let mut moved = 0usize;

        loop {
            let batch = match limit {
                Some(limit) if moved >= limit => break,
                Some(limit) => (limit - moved).min(RETRY_BATCH),
                None => RETRY_BATCH,
            };

            let reply: redis::streams::StreamRangeReply =
                conn.xrange_count(&keys.dlq, "-", "+", batch).await?;
            if reply.ids.is_empty() {
                break;
            }

            for entry in &reply.ids {
                match EntryFields::from_stream_id(entry) {
                    Some(fields) => {
                        // Append before delete: a crash in between duplicates, never loses
                        self.append(&keys.stream, &fields.revived()).await?;
                    }
                    None => warn!(stream_id = %entry.id, "Dropping dead-lettered entry without data"),
                }
                let _: i64 = conn.xdel(&keys.dlq, &[entry.id.as_str()]).await?;
                moved += 1;
            }
        }

        info!(queue = %queue, moved, "Retried dead-lettered messages");
        Ok(())
    }

    async fn get_queue_size(&self, queue: &Queue, failed: bool) -> QueueResult<u64> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        if failed {
            return Ok(conn.xlen(&keys.dlq).await?);
        }

        // Acknowledged entries stay in the stream, so waiting work is what the
        // group has not delivered yet plus what it has not acknowledged
        let waiting = match self.get_group_info(queue).await? {
            Some(GroupInfo { lag: Some(lag), pending, .. }) => (lag + pending) as u64,
            // Lag is unknown after deletions past the last delivered entry
            Some(_) | None => conn.xlen(&keys.stream).await?,
        };
        let delayed: u64 = conn.zcard(&keys.delayed).await?;
        Ok(waiting + delayed)
    }

    async fn ping(&self) -> QueueResult<bool> {
        let mut conn = self.redis.clone();
        let reply: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;

        match reply {
            Ok(pong) => Ok(pong == "PONG"),
            Err(e) => {
                debug!(error = %e, "Redis ping failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Consumer for RedisStreams {
    async fn consume(&self, queue: &Queue, handler: &dyn MessageHandler) -> QueueResult<()> {
        let keys = StreamKeys::new(queue);
        self.ensure_group(&keys.stream, &keys.group).await?;
        self.ensure_group(&keys.dlq, &keys.group).await?;

        info!(
            queue = %queue,
            stream = %keys.stream,
            group = %keys.group,
            consumer_id = %self.consumer_id(),
            "Consuming"
        );

        let block = Some(self.options.block_timeout);

        while !self.is_closed() {
            let iteration = async {
                self.maintain(queue, &keys, handler).await?;
                for entry in self.read_group(&keys, block).await? {
                    self.process_entry(queue, &keys, entry, handler).await?;
                }
                Ok::<_, QueueError>(())
            };

            match iteration.await {
                Ok(()) => {}
                Err(e) if self.is_closed() => {
                    debug!(error = %e, "Error after close, stopping");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(queue = %queue, consumer_id = %self.consumer_id(), "Stopped consuming");
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(consumer_id = %self.consumer_id(), "Closed");
        Ok(())
    }
}
