//! Recurring schedule storage.
//!
//! Definitions live in the schedules hash; the next-run sorted set holds only
//! schedules that should fire, scored by next run in milliseconds.

use super::{RedisStreams, score_ms};
use super::keys::StreamKeys;
use crate::error::QueueResult;
use crate::queue::Queue;
use crate::schedule::Schedule;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{info, warn};

impl RedisStreams {
    /// Register or replace a schedule.
    ///
    /// A schedule with no upcoming run is stored but never fires.
    pub async fn schedule(&self, queue: &Queue, schedule: &Schedule) -> QueueResult<bool> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let next_run = schedule.next_run_time(None).map(score_ms).transpose()?;

        let encoded = serde_json::to_string(schedule)?;
        let _: i64 = conn.hset(&keys.schedules, schedule.id(), encoded).await?;

        match next_run {
            Some(next_run_ms) => {
                let _: i64 = conn.zadd(&keys.schedule_next, schedule.id(), next_run_ms).await?;
            }
            None => {
                let _: i64 = conn.zrem(&keys.schedule_next, schedule.id()).await?;
            }
        }

        info!(
            queue = %queue,
            schedule_id = %schedule.id(),
            description = %schedule.description(),
            "Registered schedule"
        );
        Ok(true)
    }

    /// Remove a schedule; returns whether it existed
    pub async fn unschedule(&self, queue: &Queue, schedule_id: &str) -> QueueResult<bool> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = conn.hdel(&keys.schedules, schedule_id).await?;
        let _: i64 = conn.zrem(&keys.schedule_next, schedule_id).await?;

        info!(queue = %queue, schedule_id = %schedule_id, "Removed schedule");
        Ok(removed > 0)
    }

    /// Look up one schedule; a corrupted definition reads as missing
    pub async fn get_schedule(&self, queue: &Queue, schedule_id: &str) -> QueueResult<Option<Schedule>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let raw: Option<String> = conn.hget(&keys.schedules, schedule_id).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(schedule) => Ok(Some(schedule)),
            Err(e) => {
                warn!(queue = %queue, schedule_id = %schedule_id, error = %e, "Ignoring corrupted schedule");
                Ok(None)
            }
        }
    }

    /// All schedules of a queue by id; corrupted definitions are skipped
    pub async fn get_schedules(&self, queue: &Queue) -> QueueResult<HashMap<String, Schedule>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let all: HashMap<String, String> = conn.hgetall(&keys.schedules).await?;

        let mut schedules = HashMap::with_capacity(all.len());
        for (id, raw) in all {
            match serde_json::from_str::<Schedule>(&raw) {
                Ok(schedule) => {
                    schedules.insert(id, schedule);
                }
                Err(e) => warn!(queue = %queue, schedule_id = %id, error = %e, "Skipping corrupted schedule"),
            }
        }
        Ok(schedules)
    }

    /// Pause a schedule; returns `false` if it does not exist
    pub async fn pause_schedule(&self, queue: &Queue, schedule_id: &str) -> QueueResult<bool> {
        let Some(schedule) = self.get_schedule(queue, schedule_id).await? else {
            return Ok(false);
        };

        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let paused = schedule.pause();
        let _: i64 = conn
            .hset(&keys.schedules, schedule_id, serde_json::to_string(&paused)?)
            .await?;
        let _: i64 = conn.zrem(&keys.schedule_next, schedule_id).await?;

        info!(queue = %queue, schedule_id = %schedule_id, "Paused schedule");
        Ok(true)
    }

    /// Resume a paused schedule; returns `false` if it does not exist
    pub async fn resume_schedule(&self, queue: &Queue, schedule_id: &str) -> QueueResult<bool> {
        let Some(schedule) = self.get_schedule(queue, schedule_id).await? else {
            return Ok(false);
        };

        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let resumed = schedule.resume();
        let next_run = resumed.next_run_time(None).map(score_ms).transpose()?;
        let _: i64 = conn
            .hset(&keys.schedules, schedule_id, serde_json::to_string(&resumed)?)
            .await?;

        if let Some(next_run_ms) = next_run {
            let _: i64 = conn.zadd(&keys.schedule_next, schedule_id, next_run_ms).await?;
        }

        info!(queue = %queue, schedule_id = %schedule_id, "Resumed schedule");
        Ok(true)
    }
}
