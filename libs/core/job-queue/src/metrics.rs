//! Prometheus metrics for queue engines and workers.
//!
//! Metric names follow the OpenTelemetry messaging conventions where one exists.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup; later calls return the installed handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format, empty before [`init_metrics`]
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// A handler picked up a message that waited `wait` since enqueue
    pub fn job_started(&self, wait: Duration) {
        counter!(
            "messaging_client_consumed_messages_total",
            "messaging.destination.name" => self.queue.clone()
        )
        .increment(1);

        histogram!(
            "messaging_process_wait_duration_seconds",
            "messaging.destination.name" => self.queue.clone()
        )
        .record(wait.as_secs_f64());
    }

    pub fn job_succeeded(&self, duration: Duration) {
        self.record_outcome("success", duration);
    }

    pub fn job_failed(&self, category: &str, duration: Duration) {
        self.record_outcome("failed", duration);

        counter!(
            "messaging_process_errors_total",
            "messaging.destination.name" => self.queue.clone(),
            "error.type" => category.to_string()
        )
        .increment(1);
    }

    /// The message was pushed back because its concurrency key was at the limit
    pub fn job_deferred(&self) {
        counter!(
            "messaging_process_deferred_total",
            "messaging.destination.name" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn job_retried(&self, attempt: u32) {
        counter!(
            "messaging_process_retries_total",
            "messaging.destination.name" => self.queue.clone(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    pub fn job_dead_lettered(&self) {
        counter!(
            "messaging_process_dead_lettered_total",
            "messaging.destination.name" => self.queue.clone()
        )
        .increment(1);
    }

    /// Entries taken over from stalled consumers
    pub fn messages_claimed(&self, count: usize) {
        counter!(
            "messaging_claimed_messages_total",
            "messaging.destination.name" => self.queue.clone()
        )
        .increment(count as u64);
    }

    /// Delayed or scheduled jobs moved onto the stream; `source` is `delayed` or `schedule`
    pub fn jobs_promoted(&self, source: &'static str, count: usize) {
        counter!(
            "messaging_promoted_messages_total",
            "messaging.destination.name" => self.queue.clone(),
            "source" => source
        )
        .increment(count as u64);
    }

    pub fn active_workers(&self, count: usize) {
        gauge!(
            "messaging_active_workers",
            "messaging.destination.name" => self.queue.clone()
        )
        .set(count as f64);
    }

    fn record_outcome(&self, status: &'static str, duration: Duration) {
        counter!(
            "messaging_process_messages_total",
            "messaging.destination.name" => self.queue.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "messaging_process_duration_seconds",
            "messaging.destination.name" => self.queue.clone(),
            "status" => status
        )
        .record(duration.as_secs_f64());
    }
}
