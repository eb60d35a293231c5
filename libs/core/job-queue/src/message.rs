//! The unit of work carried by every engine.
//!
//! On the wire a message is the JSON envelope
//! `{"pid": "...", "queue": "...", "timestamp": 1700000000, "payload": ...}`.
//! Scheduled messages also carry `schedule_id`, and messages read back from a
//! stream for replay carry their `streamId`.

use crate::error::{JobError, QueueResult};
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// An enqueued job.
///
/// The `pid` and `timestamp` are assigned by the engine at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pid: String,
    queue: String,
    timestamp: i64,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schedule_id: Option<String>,
    #[serde(rename = "streamId", default, skip_serializing_if = "Option::is_none")]
    stream_id: Option<String>,
}

impl Message {
    /// Build a fresh envelope for `queue` with a new pid and the current time.
    pub fn new(queue: &Queue, payload: Value) -> Self {
        Self {
            pid: Uuid::now_v7().simple().to_string(),
            queue: queue.name().to_string(),
            timestamp: Utc::now().timestamp(),
            payload,
            schedule_id: None,
            stream_id: None,
        }
    }

    /// Build an envelope fired by the schedule `schedule_id`.
    pub fn scheduled(queue: &Queue, payload: Value, schedule_id: impl Into<String>) -> Self {
        Self {
            schedule_id: Some(schedule_id.into()),
            ..Self::new(queue, payload)
        }
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Name of the queue the message was enqueued on
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enqueue time, unix seconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into a typed job.
    ///
    /// A payload that does not fit `T` can never succeed, so the error is terminal.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(JobError::from)
    }

    pub fn schedule_id(&self) -> Option<&str> {
        self.schedule_id.as_deref()
    }

    /// Stream entry id, set on messages read back from a Redis stream
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub(crate) fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Enqueue time as a UTC datetime
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Time between enqueue and `now`, zero if the clock went backwards
    pub fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        let waited = now.timestamp() - self.timestamp;
        Duration::from_secs(waited.max(0) as u64)
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_slice(raw: &[u8]) -> QueueResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new("emails").unwrap()
    }

    #[test]
    fn test_new_message_assigns_pid_and_timestamp() {
        let before = Utc::now().timestamp();
        let message = Message::new(&queue(), json!({"to": "a@example.com"}));

        assert_eq!(message.pid().len(), 32);
        assert_eq!(message.queue(), "emails");
        assert!(message.timestamp() >= before);
        assert_eq!(message.payload()["to"], "a@example.com");
        assert!(message.schedule_id().is_none());
        assert!(message.stream_id().is_none());
    }

    #[test]
    fn test_pids_are_unique() {
        let a = Message::new(&queue(), json!(1));
        let b = Message::new(&queue(), json!(1));
        assert_ne!(a.pid(), b.pid());
    }

    #[test]
    fn test_envelope_wire_format() {
        let message = Message::new(&queue(), json!({"n": 1}));
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert!(object["pid"].is_string());
        assert_eq!(object["queue"], "emails");
        assert!(object["timestamp"].is_i64());
        assert_eq!(object["payload"]["n"], 1);
    }

    #[test]
    fn test_scheduled_message_carries_schedule_id() {
        let message = Message::scheduled(&queue(), json!({}), "nightly");
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["schedule_id"], "nightly");
        assert_eq!(message.schedule_id(), Some("nightly"));
    }

    #[test]
    fn test_decode_external_envelope() {
        let raw = r#"{"pid":"abc","queue":"emails","timestamp":1700000000,"payload":{"id":7}}"#;
        let message = Message::from_json(raw).unwrap().with_stream_id("1700000000000-0");

        assert_eq!(message.pid(), "abc");
        assert_eq!(message.timestamp(), 1_700_000_000);
        assert_eq!(message.stream_id(), Some("1700000000000-0"));
        assert!(Message::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_payload_as() {
        #[derive(Debug, Deserialize)]
        struct Job {
            id: u32,
        }

        let message = Message::new(&queue(), json!({"id": 7}));
        assert_eq!(message.payload_as::<Job>().unwrap().id, 7);

        let message = Message::new(&queue(), json!("oops"));
        assert!(!message.payload_as::<Job>().unwrap_err().is_retryable());
    }

    #[test]
    fn test_wait_time() {
        let message = Message::new(&queue(), json!(null));
        let later = message.enqueued_at().unwrap() + chrono::Duration::seconds(5);
        assert_eq!(message.wait_time(later), Duration::from_secs(5));

        let earlier = message.enqueued_at().unwrap() - chrono::Duration::seconds(5);
        assert_eq!(message.wait_time(earlier), Duration::ZERO);
    }
}
