//! Queue Worker Service
//!
//! A background worker that consumes one queue through the engine picked by
//! `QUEUE_BROKER`.
//!
//! ## Architecture
//!
//! ```text
//! Redis stream <namespace>.stream.<queue>   or   AMQP exchange <namespace> -> queue <queue>
//!   ↓ (consumer group / basic.consume)
//! WorkerPool (QUEUE_WORKERS consume loops)
//!   ↓
//! JobRunner<EchoJob>
//! ```
//!
//! ## Features
//!
//! - Redis Streams or AMQP behind the same worker
//! - Bounded retries with a dead-letter queue
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Health, queue info and metrics endpoints for Kubernetes probes

pub mod job;

use axum::Router;
use core_config::amqp::AmqpConfig;
use core_config::redis::RedisConfig;
use core_config::worker::{BrokerKind, WorkerConfig};
use core_config::{Environment, FromEnv, app_info};
use eyre::{Result, WrapErr};
use job_queue::{
    Amqp, AmqpOptions, Consumer, HealthState, JobRunner, Publisher, Queue, RedisStreams, RedisStreamsOptions,
    RetryPolicy, WorkerPool, health_router, init_metrics, retry_with_backoff,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::job::EchoJob;

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue monitoring: `/queue/info`, `POST /queue/retry`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Engines for one worker process
struct Engines {
    publisher: Arc<dyn Publisher>,
    consumers: Vec<Arc<dyn Consumer>>,
}

/// Connect with backoff, Redis may still be starting next to the worker
async fn connect_redis(url: &str) -> Result<RedisStreams> {
    let policy = RetryPolicy::new()
        .with_max_retries(5)
        .with_initial_delay(Duration::from_millis(500));

    retry_with_backoff(|| RedisStreams::connect(url, RedisStreamsOptions::default()), &policy)
        .await
        .wrap_err("Failed to connect to Redis")
}

/// Redis: one engine per consume loop, since a blocking read holds its connection
async fn redis_engines(workers: usize) -> Result<Engines> {
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let publisher = connect_redis(&redis_config.url).await?;

    let mut consumers: Vec<Arc<dyn Consumer>> = Vec::with_capacity(workers);
    for _ in 0..workers {
        consumers.push(Arc::new(connect_redis(&redis_config.url).await?));
    }
    info!("Connected to Redis successfully");

    Ok(Engines {
        publisher: Arc::new(publisher),
        consumers,
    })
}

/// AMQP: one engine, channels are opened per worker task
fn amqp_engines() -> Result<Engines> {
    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    info!(host = %amqp_config.host, vhost = %amqp_config.vhost, "Using AMQP broker");

    let engine = Arc::new(Amqp::new(amqp_config, AmqpOptions::default()).wrap_err("Invalid AMQP options")?);

    Ok(Engines {
        publisher: engine.clone(),
        consumers: vec![engine],
    })
}

/// Run the queue worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to the configured broker
/// 3. Starts the worker pool and the health server
/// 4. Stops the pool gracefully on a shutdown signal
///
/// # Errors
///
/// Returns an error if:
/// - Worker or broker configuration is invalid
/// - The broker is unreachable at startup
/// - The worker pool fails to stop cleanly
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();

    info!(name = %app_info.name, version = %app_info.version, "Starting queue worker service");
    info!("Environment: {:?}", environment);

    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let queue = match &worker_config.namespace {
        Some(namespace) => Queue::with_namespace(&worker_config.queue, namespace),
        None => Queue::new(&worker_config.queue),
    }
    .wrap_err("Invalid queue name")?;
    info!(
        broker = %worker_config.broker,
        queue = %queue,
        workers = worker_config.workers,
        health_port = worker_config.health_port,
        "Worker configuration loaded"
    );

    let engines = match worker_config.broker {
        BrokerKind::Redis => redis_engines(worker_config.workers).await?,
        BrokerKind::Amqp => amqp_engines()?,
    };

    let runner = JobRunner::new(queue.clone(), EchoJob);
    let pool = match worker_config.broker {
        BrokerKind::Redis => WorkerPool::per_worker(
            queue.clone(),
            engines.consumers,
            engines.publisher.clone(),
            Arc::new(runner),
        ),
        BrokerKind::Amqp => WorkerPool::shared(
            queue.clone(),
            Arc::clone(&engines.consumers[0]),
            engines.publisher.clone(),
            Arc::new(runner),
            worker_config.workers,
        ),
    }
    .wrap_err("Failed to build worker pool")?
    .on_worker_start(|worker_id| info!(worker_id, "Worker started"))
    .on_worker_stop(|worker_id| info!(worker_id, "Worker stopped"));

    let health_state = HealthState::new(engines.publisher, app_info, queue);
    let health_port = worker_config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    pool.start().await.wrap_err("Failed to start worker pool")?;

    tokio::select! {
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!("Error waiting for shutdown signal: {}", e);
            }
        }
        _ = pool.wait() => {
            info!("All workers ended");
        }
    }

    pool.stop().await.wrap_err("Failed to stop worker pool")?;

    info!("Queue worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to install Ctrl+C handler")?;
                info!("Received Ctrl+C, initiating shutdown...");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
