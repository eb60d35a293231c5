//! Queue error types and failure classification
//!
//! Failures are grouped by how the system reacts to them:
//! - **Transient**: transport trouble (timeouts, dropped connections), retried with a fresh connection
//! - **Retryable**: the handler asked for the message to be delivered again
//! - **Terminal**: the message goes to the dead-letter queue
//! - **Configuration**: rejected at construction, never at runtime

use strum::{AsRefStr, Display};
use thiserror::Error;

/// Category of a failure, used for retry decisions and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection or timeout error; retry a bounded number of times
    Transient,
    /// Job asked to be redelivered
    Retryable,
    /// Job failed for good; dead-letter it
    Terminal,
    /// Invalid configuration; fail fast
    Configuration,
}

/// Errors raised by queue engines and their collaborators
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// AMQP connection, channel or protocol error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Management API request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Management API answered with an unexpected status
    #[error("Management API returned {status}: {body}")]
    Management { status: u16, body: String },

    /// Envelope or schedule (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid engine or queue configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid schedule definition
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Could not reach the broker
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not confirm a published message
    #[error("Publish not confirmed: {0}")]
    Unconfirmed(String),

    /// Could not borrow a broker from the pool
    #[error("Pool error: {0}")]
    Pool(String),

    /// The engine was closed
    #[error("Broker closed")]
    Closed,
}

impl QueueError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        QueueError::Config(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Redis(e) => {
                if e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Terminal
                }
            }
            QueueError::Amqp(_) => ErrorCategory::Transient,
            QueueError::Http(_) => ErrorCategory::Transient,
            QueueError::Management { status, .. } if *status >= 500 => ErrorCategory::Transient,
            QueueError::Management { .. } => ErrorCategory::Terminal,
            QueueError::Serialization(_) => ErrorCategory::Terminal,
            QueueError::Config(_) => ErrorCategory::Configuration,
            QueueError::Schedule(_) => ErrorCategory::Configuration,
            QueueError::Connection(_) => ErrorCategory::Transient,
            QueueError::Unconfirmed(_) => ErrorCategory::Transient,
            QueueError::Pool(_) => ErrorCategory::Transient,
            QueueError::Closed => ErrorCategory::Terminal,
        }
    }

    /// Whether retrying with a fresh connection or channel may succeed
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type QueueResult<T> = Result<T, QueueError>;

/// Schedule validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Either cron or interval must be specified")]
    MissingTrigger,

    #[error("Cannot specify both cron and interval")]
    ConflictingTrigger,

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Interval must be greater than 0")]
    InvalidInterval,
}

/// Failure returned by a job handler
///
/// The variant decides what happens to the message: `Retryable` asks for
/// redelivery, `Terminal` sends it to the dead-letter queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("{0}")]
    Terminal(String),
}

impl JobError {
    /// Create a failure that asks for redelivery
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable(message.into())
    }

    /// Create a failure that dead-letters the message
    pub fn terminal(message: impl Into<String>) -> Self {
        JobError::Terminal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    /// The failure text without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(message) | JobError::Terminal(message) => message,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Retryable(_) => ErrorCategory::Retryable,
            JobError::Terminal(_) => ErrorCategory::Terminal,
        }
    }
}

impl From<QueueError> for JobError {
    /// Transport trouble inside a handler is worth another delivery; anything else is not
    fn from(err: QueueError) -> Self {
        if err.is_transient() {
            JobError::Retryable(err.to_string())
        } else {
            JobError::Terminal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Terminal(err.to_string())
    }
}
