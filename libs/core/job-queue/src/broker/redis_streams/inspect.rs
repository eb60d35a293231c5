//! Read and maintenance side channels.
//!
//! None of these change delivery state except `trim_stream` and
//! `delete_consumer`, which are destructive by intent.

use super::RedisStreams;
use super::entry::EntryFields;
use super::keys::{Stat, StreamKeys};
use crate::error::QueueResult;
use crate::message::Message;
use crate::queue::Queue;
use redis::streams::{StreamId, StreamInfoStreamReply, StreamPendingReply, StreamRangeReply};
use redis::{AsyncCommands, RedisError, RedisResult, Value};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// Summary of the main stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub length: usize,
    pub first_entry_id: Option<String>,
    pub last_entry_id: Option<String>,
    pub last_generated_id: String,
    pub groups: usize,
}

/// The queue's consumer group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    /// Delivered but unacknowledged entries
    pub pending: usize,
    pub last_delivered_id: String,
    /// Entries not yet delivered to the group; unknown after some trims or deletions
    pub lag: Option<usize>,
}

/// One consumer of the queue's group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: usize,
    pub idle_ms: u64,
}

/// Processing counters kept by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub processing: i64,
}

/// Missing stream or group, reported by Redis as an error
fn is_missing(e: &RedisError) -> bool {
    let text = e.to_string();
    text.contains("no such key") || text.contains("NOGROUP")
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        Value::Int(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(number) => u64::try_from(*number).ok(),
        Value::BulkString(_) | Value::SimpleString(_) => value_string(value)?.parse().ok(),
        _ => None,
    }
}

fn non_empty(id: String) -> Option<String> {
    if id.is_empty() { None } else { Some(id) }
}

impl GroupInfo {
    fn from_fields(fields: &HashMap<String, Value>) -> Option<Self> {
        let count = |name: &str| fields.get(name).and_then(value_u64).unwrap_or(0) as usize;

        Some(Self {
            name: fields.get("name").and_then(value_string)?,
            consumers: count("consumers"),
            pending: count("pending"),
            last_delivered_id: fields
                .get("last-delivered-id")
                .and_then(value_string)
                .unwrap_or_default(),
            lag: fields.get("lag").and_then(value_u64).map(|lag| lag as usize),
        })
    }
}

impl ConsumerInfo {
    fn from_fields(fields: &HashMap<String, Value>) -> Option<Self> {
        Some(Self {
            name: fields.get("name").and_then(value_string)?,
            pending: fields.get("pending").and_then(value_u64).unwrap_or(0) as usize,
            idle_ms: fields.get("idle").and_then(value_u64).unwrap_or(0),
        })
    }
}

impl RedisStreams {
    /// `None` when the stream does not exist yet
    pub async fn get_stream_info(&self, queue: &Queue) -> QueueResult<Option<StreamInfo>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: RedisResult<StreamInfoStreamReply> = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(&keys.stream)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(info) => Ok(Some(StreamInfo {
                length: info.length,
                first_entry_id: non_empty(info.first_entry.id),
                last_entry_id: non_empty(info.last_entry.id),
                last_generated_id: info.last_generated_id,
                groups: info.groups,
            })),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The queue's own consumer group, `None` if it was never created
    pub async fn get_group_info(&self, queue: &Queue) -> QueueResult<Option<GroupInfo>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: RedisResult<Vec<HashMap<String, Value>>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&keys.stream)
            .query_async(&mut conn)
            .await;

        let groups = match reply {
            Ok(groups) => groups,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(groups
            .iter()
            .filter_map(GroupInfo::from_fields)
            .find(|group| group.name == keys.group))
    }

    pub async fn get_consumers_info(&self, queue: &Queue) -> QueueResult<Vec<ConsumerInfo>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: RedisResult<Vec<HashMap<String, Value>>> = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&keys.stream)
            .arg(&keys.group)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(consumers) => Ok(consumers.iter().filter_map(ConsumerInfo::from_fields).collect()),
            Err(e) if is_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Entries not yet delivered to the group
    pub async fn get_lag(&self, queue: &Queue) -> QueueResult<u64> {
        Ok(self
            .get_group_info(queue)
            .await?
            .and_then(|group| group.lag)
            .unwrap_or(0) as u64)
    }

    /// Entries delivered but not yet acknowledged
    pub async fn get_pending_count(&self, queue: &Queue) -> QueueResult<u64> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: RedisResult<StreamPendingReply> = conn.xpending(&keys.stream, &keys.group).await;
        match reply {
            Ok(pending) => Ok(pending.count() as u64),
            Err(e) if is_missing(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_delayed_count(&self, queue: &Queue) -> QueueResult<u64> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();
        Ok(conn.zcard(&keys.delayed).await?)
    }

    /// Messages between two entry ids (`-` and `+` for the ends), for replay.
    ///
    /// Entries that do not decode are skipped.
    pub async fn get_messages(
        &self,
        queue: &Queue,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> QueueResult<Vec<Message>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = match count {
            Some(count) => conn.xrange_count(&keys.stream, start, end, count).await?,
            None => conn.xrange(&keys.stream, start, end).await?,
        };

        Ok(reply
            .ids
            .iter()
            .filter_map(|entry| match decode(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(queue = %queue, stream_id = %entry.id, error = %e, "Skipping corrupted entry");
                    None
                }
            })
            .collect())
    }

    /// One message by entry id; a corrupted entry is an error
    pub async fn get_message(&self, queue: &Queue, stream_id: &str) -> QueueResult<Option<Message>> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = conn.xrange_count(&keys.stream, stream_id, stream_id, 1).await?;
        reply.ids.first().map(decode).transpose()
    }

    /// Trim the stream to exactly `max_len` entries; returns how many were removed
    pub async fn trim_stream(&self, queue: &Queue, max_len: usize) -> QueueResult<u64> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let removed: u64 = redis::cmd("XTRIM")
            .arg(&keys.stream)
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;

        info!(queue = %queue, max_len, removed, "Trimmed stream");
        Ok(removed)
    }

    /// Remove a consumer from the group; returns the pending entries it owned
    pub async fn delete_consumer(&self, queue: &Queue, consumer_id: &str) -> QueueResult<u64> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let pending: u64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&keys.stream)
            .arg(&keys.group)
            .arg(consumer_id)
            .query_async(&mut conn)
            .await?;

        info!(queue = %queue, consumer_id = %consumer_id, pending, "Deleted consumer");
        Ok(pending)
    }

    pub async fn get_stats(&self, queue: &Queue) -> QueueResult<QueueStats> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let names: Vec<String> = Stat::ALL.iter().map(|stat| keys.stat(*stat)).collect();
        let values: Vec<Option<i64>> = conn.mget(&names).await?;
        let value = |index: usize| values.get(index).copied().flatten().unwrap_or(0);

        Ok(QueueStats {
            total: value(0),
            success: value(1),
            failed: value(2),
            processing: value(3),
        })
    }

    pub async fn reset_stats(&self, queue: &Queue) -> QueueResult<()> {
        let keys = StreamKeys::new(queue);
        let mut conn = self.redis.clone();

        let names: Vec<String> = Stat::ALL.iter().map(|stat| keys.stat(*stat)).collect();
        let _: i64 = conn.del(&names).await?;
        Ok(())
    }
}

fn decode(entry: &StreamId) -> QueueResult<Message> {
    match EntryFields::from_stream_id(entry) {
        Some(fields) => fields.message(&entry.id),
        None => Err(crate::error::QueueError::Serialization(format!(
            "entry {} has no data field",
            entry.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    #[test]
    fn test_group_info_from_fields() {
        let group = GroupInfo::from_fields(&fields(&[
            ("name", bulk("app.group.emails")),
            ("consumers", Value::Int(2)),
            ("pending", Value::Int(1)),
            ("last-delivered-id", bulk("5-0")),
            ("lag", Value::Nil),
        ]))
        .unwrap();

        assert_eq!(group.name, "app.group.emails");
        assert_eq!(group.consumers, 2);
        assert_eq!(group.pending, 1);
        assert_eq!(group.last_delivered_id, "5-0");
        assert_eq!(group.lag, None);
    }

    #[test]
    fn test_consumer_info_requires_name() {
        assert!(ConsumerInfo::from_fields(&fields(&[("pending", Value::Int(1))])).is_none());

        let consumer = ConsumerInfo::from_fields(&fields(&[
            ("name", bulk("worker-1")),
            ("pending", Value::Int(3)),
            ("idle", Value::Int(1500)),
        ]))
        .unwrap();
        assert_eq!(consumer.pending, 3);
        assert_eq!(consumer.idle_ms, 1500);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(value_u64(&bulk("42")), Some(42));
        assert_eq!(value_u64(&Value::Int(-1)), None);
        assert_eq!(value_string(&Value::Nil), None);
        assert_eq!(non_empty(String::new()), None);
    }
}
