//! Worker pool.
//!
//! Runs N consume loops for one queue on tokio tasks. Before starting it waits
//! for the broker to answer a ping. A loop that fails is restarted after an
//! exponential backoff; a loop that returns cleanly (its consumer was closed)
//! ends the worker.

use crate::broker::{Consumer, Publisher};
use crate::error::{QueueError, QueueResult};
use crate::handler::MessageHandler;
use crate::metrics::QueueMetrics;
use crate::queue::Queue;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Called with the worker's index when it starts or stops
pub type WorkerHook = Arc<dyn Fn(usize) + Send + Sync>;

const PING_ATTEMPTS: u32 = 30;
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// N consume loops sharing one handler
pub struct WorkerPool {
    queue: Queue,
    consumers: Vec<Arc<dyn Consumer>>,
    publisher: Arc<dyn Publisher>,
    handler: Arc<dyn MessageHandler>,
    workers: usize,
    start_hooks: Vec<WorkerHook>,
    stop_hooks: Vec<WorkerHook>,
    ping_attempts: u32,
    ping_interval: Duration,
    restart: RetryPolicy,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    metrics: QueueMetrics,
}

/// What one worker task needs
struct WorkerContext {
    worker_id: usize,
    queue: Queue,
    consumer: Arc<dyn Consumer>,
    handler: Arc<dyn MessageHandler>,
    start_hooks: Vec<WorkerHook>,
    stop_hooks: Vec<WorkerHook>,
    restart: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    /// `workers` loops consuming through one shared consumer
    pub fn shared(
        queue: Queue,
        consumer: Arc<dyn Consumer>,
        publisher: Arc<dyn Publisher>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
    ) -> QueueResult<Self> {
        if workers == 0 {
            return Err(QueueError::config("worker count must be at least 1"));
        }
        Ok(Self::build(queue, vec![consumer], publisher, handler, workers))
    }

    /// One loop per consumer
    pub fn per_worker(
        queue: Queue,
        consumers: Vec<Arc<dyn Consumer>>,
        publisher: Arc<dyn Publisher>,
        handler: Arc<dyn MessageHandler>,
    ) -> QueueResult<Self> {
        if consumers.is_empty() {
            return Err(QueueError::config("worker count must be at least 1"));
        }
        let workers = consumers.len();
        Ok(Self::build(queue, consumers, publisher, handler, workers))
    }

    fn build(
        queue: Queue,
        consumers: Vec<Arc<dyn Consumer>>,
        publisher: Arc<dyn Publisher>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
    ) -> Self {
        Self {
            metrics: QueueMetrics::new(queue.name()),
            queue,
            consumers,
            publisher,
            handler,
            workers,
            start_hooks: Vec::new(),
            stop_hooks: Vec::new(),
            ping_attempts: PING_ATTEMPTS,
            ping_interval: PING_INTERVAL,
            restart: RetryPolicy::new()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            shutdown: watch::Sender::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn on_worker_start<H>(mut self, hook: H) -> Self
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        self.start_hooks.push(Arc::new(hook));
        self
    }

    pub fn on_worker_stop<H>(mut self, hook: H) -> Self
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        self.stop_hooks.push(Arc::new(hook));
        self
    }

    /// Broker readiness check before start: `attempts` pings, `interval` apart
    pub fn with_ping(mut self, attempts: u32, interval: Duration) -> Self {
        self.ping_attempts = attempts.max(1);
        self.ping_interval = interval;
        self
    }

    /// Backoff between restarts of a failed consume loop
    pub fn with_restart_policy(mut self, policy: RetryPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Wait for the broker, then spawn the workers
    pub async fn start(&self) -> QueueResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(QueueError::config("worker pool is already running"));
        }

        self.wait_for_broker().await?;

        for worker_id in 0..self.workers {
            let context = WorkerContext {
                worker_id,
                queue: self.queue.clone(),
                consumer: Arc::clone(&self.consumers[worker_id % self.consumers.len()]),
                handler: Arc::clone(&self.handler),
                start_hooks: self.start_hooks.clone(),
                stop_hooks: self.stop_hooks.clone(),
                restart: self.restart.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            tasks.spawn(run_worker(context));
        }

        self.metrics.active_workers(self.workers);
        info!(queue = %self.queue, workers = self.workers, "Worker pool started");
        Ok(())
    }

    /// Wait until every worker has ended
    pub async fn wait(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
    }

    /// Close the consumers and wait for in-flight messages to finish
    pub async fn stop(&self) -> QueueResult<()> {
        info!(queue = %self.queue, "Stopping worker pool");
        self.shutdown.send_replace(true);

        for consumer in &self.consumers {
            if let Err(e) = consumer.close().await {
                warn!(error = %e, "Failed to close consumer");
            }
        }

        self.wait().await;
        self.metrics.active_workers(0);
        info!(queue = %self.queue, "Worker pool stopped");
        Ok(())
    }

    async fn wait_for_broker(&self) -> QueueResult<()> {
        for attempt in 1..=self.ping_attempts {
            match self.publisher.ping().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Broker ping failed"),
            }

            let remaining = self.ping_attempts - attempt;
            if remaining == 0 {
                break;
            }
            warn!(
                remaining,
                retry_in_ms = self.ping_interval.as_millis() as u64,
                "Broker is not ready, retrying"
            );
            tokio::time::sleep(self.ping_interval).await;
        }

        error!(attempts = self.ping_attempts, "Broker is not ready, giving up");
        Err(QueueError::Connection(format!(
            "broker did not answer after {} pings",
            self.ping_attempts
        )))
    }
}

async fn run_worker(mut context: WorkerContext) {
    let worker_id = context.worker_id;
    for hook in &context.start_hooks {
        hook(worker_id);
    }
    info!(worker_id, queue = %context.queue, "Worker is ready");

    let mut failures: u32 = 0;

    loop {
        if *context.shutdown.borrow() {
            break;
        }

        match context.consumer.consume(&context.queue, context.handler.as_ref()).await {
            Ok(()) => break,
            Err(e) if *context.shutdown.borrow() => {
                warn!(worker_id, error = %e, "Consume loop failed during shutdown");
                break;
            }
            Err(e) => {
                failures += 1;
                let delay = context.restart.delay_for(failures);
                error!(
                    worker_id,
                    failures,
                    restart_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Consume loop failed, restarting"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = context.shutdown.changed() => break,
                }
            }
        }
    }

    for hook in &context.stop_hooks {
        hook(worker_id);
    }
    info!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockPublisher;
    use crate::handler::JobResult;
    use crate::message::Message;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails `failures` times, then consumes until closed
    #[derive(Default)]
    struct FlakyConsumer {
        failures: usize,
        calls: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Consumer for FlakyConsumer {
        async fn consume(&self, _queue: &Queue, _handler: &dyn MessageHandler) -> QueueResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(QueueError::Connection("reset".into()));
            }
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }

        async fn close(&self) -> QueueResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: &Message) -> JobResult {
            Ok(Default::default())
        }
    }

    fn reachable() -> Arc<dyn Publisher> {
        let mut publisher = MockPublisher::new();
        publisher.expect_ping().returning(|| Ok(true));
        Arc::new(publisher)
    }

    fn queue() -> Queue {
        Queue::new("emails").unwrap()
    }

    #[test]
    fn test_zero_workers_rejected() {
        let consumer: Arc<dyn Consumer> = Arc::new(FlakyConsumer::default());
        let err = WorkerPool::shared(queue(), consumer, reachable(), Arc::new(Noop), 0)
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));

        let err = WorkerPool::per_worker(queue(), Vec::new(), reachable(), Arc::new(Noop))
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop_run_hooks() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (on_start, on_stop) = (Arc::clone(&started), Arc::clone(&stopped));

        let consumer: Arc<dyn Consumer> = Arc::new(FlakyConsumer::default());
        let pool = WorkerPool::shared(queue(), consumer, reachable(), Arc::new(Noop), 3)
            .unwrap()
            .on_worker_start(move |_| {
                on_start.fetch_add(1, Ordering::SeqCst);
            })
            .on_worker_stop(move |_| {
                on_stop.fetch_add(1, Ordering::SeqCst);
            });

        pool.start().await.unwrap();
        assert!(pool.start().await.is_err());

        while started.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.stop().await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_loop_is_restarted() {
        let flaky = Arc::new(FlakyConsumer {
            failures: 2,
            ..Default::default()
        });
        let consumer: Arc<dyn Consumer> = flaky.clone();

        let pool = WorkerPool::shared(queue(), consumer, reachable(), Arc::new(Noop), 1)
            .unwrap()
            .with_restart_policy(
                RetryPolicy::new()
                    .with_initial_delay(Duration::from_millis(1))
                    .without_jitter(),
            );

        pool.start().await.unwrap();
        while flaky.calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.stop().await.unwrap();

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_start() {
        let mut publisher = MockPublisher::new();
        publisher.expect_ping().times(3).returning(|| Ok(false));

        let consumer: Arc<dyn Consumer> = Arc::new(FlakyConsumer::default());
        let pool = WorkerPool::shared(queue(), consumer, Arc::new(publisher), Arc::new(Noop), 1)
            .unwrap()
            .with_ping(3, Duration::from_millis(1));

        let err = pool.start().await.unwrap_err();
        assert!(err.is_transient());
    }
}
