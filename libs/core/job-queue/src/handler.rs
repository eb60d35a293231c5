//! The callback contract between an engine's consume loop and job code.

use crate::error::JobError;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// How a successfully handled message should be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ack {
    /// Acknowledge this delivery
    #[default]
    Ack,
    /// Leave the delivery unacknowledged until a later `Commit` on the same channel
    Defer,
    /// Acknowledge this delivery and every earlier one on the same channel
    Commit,
}

/// Outcome of handling one message
pub type JobResult = Result<Ack, JobError>;

/// Receives messages from [`Consumer::consume`](crate::broker::Consumer::consume).
///
/// `on_success` and `on_error` run after the delivery outcome is settled and
/// cannot change it. `on_error` receives `None` when the envelope itself could
/// not be decoded.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> JobResult;

    async fn on_success(&self, _message: &Message) {}

    async fn on_error(&self, _message: Option<&Message>, _error: &JobError) {}
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> JobResult {
        (**self).handle(message).await
    }

    async fn on_success(&self, message: &Message) {
        (**self).on_success(message).await
    }

    async fn on_error(&self, message: Option<&Message>, error: &JobError) {
        (**self).on_error(message, error).await
    }
}
