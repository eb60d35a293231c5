//! The delivery path of the Redis Streams engine.

use super::entry::EntryFields;
use super::keys::{Stat, StreamKeys};
use super::RedisStreams;
use crate::error::{JobError, QueueResult};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::queue::Queue;
use crate::schedule::Schedule;
use chrono::Utc;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Last promotion pass per structure, for rate limiting
#[derive(Debug, Default)]
pub(super) struct PromotionClock {
    last: Mutex<HashMap<String, Instant>>,
}

impl PromotionClock {
    /// Whether a pass over `key` is due, recording it as done if so
    fn due(&self, key: &str, interval: Duration) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        match last.get(key) {
            Some(previous) if now.duration_since(*previous) < interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl RedisStreams {
    /// Steps run before every read: schedule and delayed promotion, then claiming
    pub(super) async fn maintain(
        &self,
        queue: &Queue,
        keys: &StreamKeys,
        handler: &dyn MessageHandler,
    ) -> QueueResult<()> {
        self.promote_schedules(queue, keys).await?;
        self.promote_delayed(queue, keys).await?;
        self.claim_abandoned(queue, keys, handler).await
    }

    /// Read one new entry for this consumer; `None` means a non-blocking read
    pub(super) async fn read_group(
        &self,
        keys: &StreamKeys,
        block: Option<Duration>,
    ) -> QueueResult<Vec<StreamId>> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&keys.group)
            .arg(self.consumer_id())
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&keys.stream).arg(">");

        // BLOCK returns nil when it expires with nothing to read
        let reply: RedisResult<Option<StreamReadReply>> = cmd.query_async(&mut conn).await;

        match reply {
            Ok(Some(reply)) => Ok(reply.keys.into_iter().flat_map(|key| key.ids).collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(stream = %keys.stream, group = %keys.group, "Consumer group missing, recreating");
                self.ensure_group(&keys.stream, &keys.group).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take over entries idle longer than `claim_idle` and process them
    async fn claim_abandoned(
        &self,
        queue: &Queue,
        keys: &StreamKeys,
        handler: &dyn MessageHandler,
    ) -> QueueResult<()> {
        let mut conn = self.redis.clone();

        let reply: RedisResult<StreamAutoClaimReply> = redis::cmd("XAUTOCLAIM")
            .arg(&keys.stream)
            .arg(&keys.group)
            .arg(self.consumer_id())
            .arg(self.options.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.options.claim_batch)
            .query_async(&mut conn)
            .await;

        let claimed = reply?.claimed;

        if claimed.is_empty() {
            return Ok(());
        }

        warn!(
            queue = %queue,
            count = claimed.len(),
            consumer_id = %self.consumer_id(),
            "Claimed abandoned messages"
        );
        QueueMetrics::new(queue.name()).messages_claimed(claimed.len());

        for entry in claimed {
            self.process_entry(queue, keys, entry, handler).await?;
        }
        Ok(())
    }

    /// Move due delayed entries onto the stream.
    ///
    /// An entry leaves the delayed set only after it was appended.
    async fn promote_delayed(&self, queue: &Queue, keys: &StreamKeys) -> QueueResult<()> {
        if !self.promotions.due(&keys.delayed, self.options.promotion_interval) {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&keys.delayed, 0, now_ms, 0, self.options.promotion_batch as isize)
            .await?;

        let mut promoted = 0;
        for member in due {
            let fields = match EntryFields::from_json(&member) {
                Ok(fields) => fields,
                Err(e) => {
                    // Left in place, matching the append-before-remove rule
                    warn!(queue = %queue, error = %e, "Skipping undecodable delayed entry");
                    continue;
                }
            };

            self.append(&keys.stream, &fields).await?;
            let _: i64 = conn.zrem(&keys.delayed, &member).await?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!(queue = %queue, promoted, "Promoted delayed messages");
            QueueMetrics::new(queue.name()).jobs_promoted("delayed", promoted);
        }
        Ok(())
    }

    /// Fire due schedules.
    ///
    /// Removing the id from the next-run set is the claim: when several
    /// consumers see the same due schedule only the one whose removal
    /// succeeds fires it.
    async fn promote_schedules(&self, queue: &Queue, keys: &StreamKeys) -> QueueResult<()> {
        if !self.promotions.due(&keys.schedule_next, self.options.promotion_interval) {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&keys.schedule_next, 0, now_ms, 0, self.options.promotion_batch as isize)
            .await?;

        let mut fired = 0;
        for schedule_id in due {
            let raw: Option<String> = conn.hget(&keys.schedules, &schedule_id).await?;

            let schedule = match raw.as_deref().map(serde_json::from_str::<Schedule>) {
                Some(Ok(schedule)) => schedule,
                Some(Err(e)) => {
                    warn!(queue = %queue, schedule_id = %schedule_id, error = %e, "Dropping corrupted schedule from next-run set");
                    let _: i64 = conn.zrem(&keys.schedule_next, &schedule_id).await?;
                    continue;
                }
                None => {
                    let _: i64 = conn.zrem(&keys.schedule_next, &schedule_id).await?;
                    continue;
                }
            };

            let removed: i64 = conn.zrem(&keys.schedule_next, &schedule_id).await?;
            if removed == 0 {
                debug!(schedule_id = %schedule_id, "Schedule fired by another consumer");
                continue;
            }

            if !schedule.is_active() {
                debug!(schedule_id = %schedule_id, "Skipping inactive schedule");
                continue;
            }

            let message = Message::scheduled(queue, schedule.payload().clone(), schedule.id());
            self.append(&keys.stream, &EntryFields::new(&message)?).await?;

            let updated = schedule.increment_run_count();
            let _: i64 = conn
                .hset(&keys.schedules, &schedule_id, serde_json::to_string(&updated)?)
                .await?;

            let now = Utc::now().timestamp();
            if updated.is_active() {
                match updated.next_run_time(Some(now)).map(super::score_ms) {
                    Some(Ok(next_run_ms)) => {
                        let _: i64 = conn.zadd(&keys.schedule_next, &schedule_id, next_run_ms).await?;
                    }
                    Some(Err(e)) => warn!(schedule_id = %schedule_id, error = %e, "Retiring schedule"),
                    None => {}
                }
            }

            info!(
                queue = %queue,
                schedule_id = %schedule_id,
                run_count = updated.run_count(),
                "Fired schedule"
            );
            fired += 1;
        }

        if fired > 0 {
            QueueMetrics::new(queue.name()).jobs_promoted("schedule", fired);
        }
        Ok(())
    }

    /// Run the handler for one entry and settle it.
    ///
    /// The `processing` counter is decremented whatever happens in between.
    pub(super) async fn process_entry(
        &self,
        queue: &Queue,
        keys: &StreamKeys,
        entry: StreamId,
        handler: &dyn MessageHandler,
    ) -> QueueResult<()> {
        self.bump(keys, Stat::Total, 1).await?;
        self.bump(keys, Stat::Processing, 1).await?;

        let result = self.settle(queue, keys, &entry, handler).await;

        if let Err(e) = self.bump(keys, Stat::Processing, -1).await {
            error!(queue = %queue, stream_id = %entry.id, error = %e, "Failed to decrement processing counter");
        }
        result
    }

    async fn settle(
        &self,
        queue: &Queue,
        keys: &StreamKeys,
        entry: &StreamId,
        handler: &dyn MessageHandler,
    ) -> QueueResult<()> {
        let Some(fields) = EntryFields::from_stream_id(entry) else {
            warn!(queue = %queue, stream_id = %entry.id, "Entry has no data field, dropping");
            self.ack(keys, &entry.id).await?;
            self.bump(keys, Stat::Failed, 1).await?;
            handler
                .on_error(None, &JobError::terminal("entry has no data field"))
                .await;
            return Ok(());
        };

        let message = match fields.message(&entry.id) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %queue, stream_id = %entry.id, error = %e, "Undecodable entry, dead-lettering");
                self.ack(keys, &entry.id).await?;
                self.dead_letter(queue, keys, &fields, &e.to_string()).await?;
                handler.on_error(None, &JobError::terminal(e.to_string())).await;
                return Ok(());
            }
        };

        let started = Instant::now();
        let outcome = handler.handle(&message).await;

        // Acknowledge regardless of outcome so the entry leaves the pending list
        self.ack(keys, &entry.id).await?;

        match outcome {
            Ok(_) => {
                self.bump(keys, Stat::Success, 1).await?;
                debug!(
                    queue = %queue,
                    pid = %message.pid(),
                    stream_id = %entry.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Message processed"
                );
                handler.on_success(&message).await;
            }
            Err(job_error) => {
                let retry_count = fields.retry_count();

                if job_error.is_retryable() && retry_count < self.options.max_retries {
                    self.append(&keys.stream, &fields.retried()).await?;
                    QueueMetrics::new(queue.name()).job_retried(retry_count + 1);
                    warn!(
                        queue = %queue,
                        pid = %message.pid(),
                        stream_id = %entry.id,
                        retry_count = retry_count + 1,
                        max_retries = self.options.max_retries,
                        error = %job_error,
                        "Message failed, redelivering"
                    );
                } else {
                    self.dead_letter(queue, keys, &fields, job_error.message()).await?;
                    warn!(
                        queue = %queue,
                        pid = %message.pid(),
                        stream_id = %entry.id,
                        retry_count,
                        error = %job_error,
                        "Message failed, dead-lettered"
                    );
                }

                handler.on_error(Some(&message), &job_error).await;
            }
        }

        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &Queue,
        keys: &StreamKeys,
        fields: &EntryFields,
        reason: &str,
    ) -> QueueResult<()> {
        let dead = fields.dead_lettered(reason, Utc::now().timestamp());
        self.append(&keys.dlq, &dead).await?;
        self.bump(keys, Stat::Failed, 1).await?;
        QueueMetrics::new(queue.name()).job_dead_lettered();
        Ok(())
    }

    async fn ack(&self, keys: &StreamKeys, stream_id: &str) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.xack(&keys.stream, &keys.group, &[stream_id]).await?;
        Ok(())
    }

    async fn bump(&self, keys: &StreamKeys, stat: Stat, delta: i64) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.incr(keys.stat(stat), delta).await?;
        Ok(())
    }
}
