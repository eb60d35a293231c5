//! Job execution context.
//!
//! A [`JobRunner`] bundles everything a worker needs to run one kind of job:
//! the job itself, its hooks, an optional concurrency gate and metrics. It is
//! assembled once with the builder methods and shared read-only by every
//! worker afterwards.

use crate::broker::Publisher;
use crate::concurrency::ConcurrencyManager;
use crate::error::JobError;
use crate::handler::{Ack, JobResult, MessageHandler};
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::queue::Queue;
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Work performed for every message of a queue.
///
/// # Example
///
/// ```rust,ignore
/// struct SendEmail { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl Job for SendEmail {
///     async fn run(&self, message: &Message) -> JobResult {
///         let email: Email = message.payload_as()?;
///         self.mailer.send(&email).await.map_err(|e| JobError::retryable(e.to_string()))?;
///         Ok(Ack::Ack)
///     }
///
///     fn name(&self) -> &'static str {
///         "send_email"
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, message: &Message) -> JobResult;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "job"
    }
}

/// [`Job`] backed by an async closure, see [`job_fn`]
pub struct FnJob<F> {
    name: &'static str,
    f: F,
}

impl<F> FnJob<F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Wrap an async closure as a [`Job`]
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnJob { name: "job", f }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn run(&self, message: &Message) -> JobResult {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Runs before the job; an error fails the message without running the job
pub type InitHook = Arc<dyn Fn(&Message) -> Result<(), JobError> + Send + Sync>;

/// Runs after the job succeeded
pub type ShutdownHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Runs after the job or its envelope failed
pub type ErrorHook = Arc<dyn Fn(Option<&Message>, &JobError) + Send + Sync>;

/// Admission control: messages over the limit go back onto the queue
struct Gate {
    manager: ConcurrencyManager,
    requeue: Arc<dyn Publisher>,
}

/// Job, hooks and concurrency gate for one queue
pub struct JobRunner {
    queue: Queue,
    job: Arc<dyn Job>,
    init_hooks: Vec<InitHook>,
    shutdown_hooks: Vec<ShutdownHook>,
    error_hooks: Vec<ErrorHook>,
    gate: Option<Gate>,
    metrics: QueueMetrics,
}

impl JobRunner {
    pub fn new(queue: Queue, job: impl Job + 'static) -> Self {
        Self::from_arc(queue, Arc::new(job))
    }

    pub fn from_arc(queue: Queue, job: Arc<dyn Job>) -> Self {
        Self {
            metrics: QueueMetrics::new(queue.name()),
            queue,
            job,
            init_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            error_hooks: Vec::new(),
            gate: None,
        }
    }

    pub fn with_init_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&Message) -> Result<(), JobError> + Send + Sync + 'static,
    {
        self.init_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_shutdown_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&Message) + Send + Sync + 'static,
    {
        self.shutdown_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_error_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(Option<&Message>, &JobError) + Send + Sync + 'static,
    {
        self.error_hooks.push(Arc::new(hook));
        self
    }

    /// Limit concurrent jobs per key; messages over the limit are re-enqueued through `requeue`
    pub fn with_concurrency(mut self, manager: ConcurrencyManager, requeue: Arc<dyn Publisher>) -> Self {
        self.gate = Some(Gate { manager, requeue });
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn job_name(&self) -> &'static str {
        self.job.name()
    }

    async fn execute(&self, message: &Message) -> JobResult {
        for hook in &self.init_hooks {
            hook(message)?;
        }
        self.job.run(message).await
    }

    async fn run_measured(&self, message: &Message) -> JobResult {
        self.metrics.job_started(message.wait_time(Utc::now()));
        let started = Instant::now();

        let result = self.execute(message).await;

        match &result {
            Ok(_) => self.metrics.job_succeeded(started.elapsed()),
            Err(e) => self.metrics.job_failed(e.category().as_ref(), started.elapsed()),
        }
        result
    }
}

#[async_trait]
impl MessageHandler for JobRunner {
    async fn handle(&self, message: &Message) -> JobResult {
        info!(job = %self.job.name(), pid = %message.pid(), "Received job");

        let Some(gate) = &self.gate else {
            return self.run_measured(message).await;
        };

        if !gate.manager.try_start_job(message).await? {
            gate.requeue
                .enqueue(&self.queue, message.payload().clone())
                .await?;
            self.metrics.job_deferred();
            info!(
                pid = %message.pid(),
                key = %gate.manager.key_for(message),
                "Re-queued job due to concurrency limit"
            );
            return Ok(Ack::Ack);
        }

        let result = self.run_measured(message).await;

        if let Err(e) = gate.manager.finish_job(message).await {
            error!(pid = %message.pid(), error = %e, "Failed to release concurrency slot");
        }
        result
    }

    async fn on_success(&self, message: &Message) {
        for hook in &self.shutdown_hooks {
            hook(message);
        }
        debug!(pid = %message.pid(), "Job ran successfully");
    }

    async fn on_error(&self, message: Option<&Message>, error: &JobError) {
        warn!(
            job = %self.job.name(),
            pid = message.map(Message::pid).unwrap_or("unknown"),
            error = %error,
            "Job failed"
        );
        for hook in &self.error_hooks {
            hook(message, error);
        }
    }
}
