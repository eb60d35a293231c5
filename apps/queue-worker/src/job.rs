//! The job run by the worker service.

use async_trait::async_trait;
use job_queue::{Ack, Job, JobError, JobResult, Message};
use tracing::info;

/// Logs every payload.
///
/// A payload carrying `"fail": "retryable"` or `"fail": "terminal"` fails with
/// that category, which makes the retry and dead-letter paths easy to exercise
/// against a running deployment.
pub struct EchoJob;

#[async_trait]
impl Job for EchoJob {
    async fn run(&self, message: &Message) -> JobResult {
        match message.payload().get("fail").and_then(|v| v.as_str()) {
            Some("retryable") => return Err(JobError::retryable("requested retryable failure")),
            Some("terminal") => return Err(JobError::terminal("requested terminal failure")),
            _ => {}
        }

        info!(
            pid = %message.pid(),
            queue = %message.queue(),
            schedule_id = message.schedule_id().unwrap_or("-"),
            payload = %message.payload(),
            "Processed message"
        );
        Ok(Ack::Ack)
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}
