//! Field layout of a stream entry.
//!
//! Every entry carries the JSON envelope in `data` and its redelivery count in
//! `retry_count`. Dead-lettered entries add `error` and `failed_at`. The same
//! fields, serialized as JSON, form the members of the delayed sorted set.

use crate::error::QueueResult;
use crate::message::Message;
use redis::Value;
use redis::streams::StreamId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EntryFields {
    pub data: String,
    #[serde(default = "zero")]
    pub retry_count: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

fn zero() -> String {
    "0".to_string()
}

impl EntryFields {
    pub fn new(message: &Message) -> QueueResult<Self> {
        Ok(Self {
            data: message.to_json()?,
            retry_count: zero(),
            error: None,
            failed_at: None,
        })
    }

    /// Read the fields of a stream entry; `None` if it has no `data` field
    pub fn from_stream_id(entry: &StreamId) -> Option<Self> {
        Some(Self {
            data: field(entry, "data")?,
            retry_count: field(entry, "retry_count").unwrap_or_else(zero),
            error: field(entry, "error"),
            failed_at: field(entry, "failed_at"),
        })
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.parse().unwrap_or(0)
    }

    /// Copy for redelivery with the retry count bumped
    pub fn retried(&self) -> Self {
        Self {
            retry_count: (self.retry_count() + 1).to_string(),
            ..self.clone()
        }
    }

    /// Copy for the dead-letter stream
    pub fn dead_lettered(&self, error: &str, failed_at: i64) -> Self {
        Self {
            error: Some(error.to_string()),
            failed_at: Some(failed_at.to_string()),
            ..self.clone()
        }
    }

    /// Copy replayed from the dead-letter stream: counter reset, failure metadata stripped
    pub fn revived(&self) -> Self {
        Self {
            data: self.data.clone(),
            retry_count: zero(),
            error: None,
            failed_at: None,
        }
    }

    /// Decode the envelope, tagging it with the entry id
    pub fn message(&self, stream_id: &str) -> QueueResult<Message> {
        Ok(Message::from_json(&self.data)?.with_stream_id(stream_id))
    }

    /// Field/value pairs in XADD order
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("data", self.data.as_str()), ("retry_count", self.retry_count.as_str())];
        if let Some(error) = &self.error {
            pairs.push(("error", error.as_str()));
        }
        if let Some(failed_at) = &self.failed_at {
            pairs.push(("failed_at", failed_at.as_str()));
        }
        pairs
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn field(entry: &StreamId, name: &str) -> Option<String> {
    match entry.map.get(name)? {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        Value::Int(number) => Some(number.to_string()),
        _ => None,
    }
}
