//! Integration tests for the AMQP engine against a real RabbitMQ

use core_config::amqp::AmqpConfig;
use job_queue::{
    Ack, Amqp, AmqpOptions, Consumer, JobError, JobResult, JobRunner, Message, Publisher, Queue, job_fn,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRabbitMq};
use tokio::task::JoinHandle;

fn engine(rabbit: &TestRabbitMq) -> Arc<Amqp> {
    let config = AmqpConfig::new(rabbit.host.clone())
        .with_port(rabbit.amqp_port)
        .with_http_port(rabbit.http_port);
    let options = AmqpOptions::new().with_require_ack(true);
    Arc::new(Amqp::new(config, options).expect("valid options"))
}

fn queue(test_name: &str) -> Queue {
    let names = TestDataBuilder::from_test_name(test_name);
    Queue::with_namespace("jobs", names.namespace()).unwrap()
}

/// Poll `check` until it holds, panicking after `timeout`
async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn spawn_consumer(engine: &Arc<Amqp>, queue: &Queue, runner: JobRunner) -> JoinHandle<()> {
    let engine = Arc::clone(engine);
    let queue = queue.clone();
    tokio::spawn(async move {
        engine.consume(&queue, &runner).await.expect("consume loop failed");
    })
}

#[tokio::test]
async fn test_confirmed_publish_and_consume() {
    let rabbit = TestRabbitMq::new().await;
    let engine = engine(&rabbit);
    let queue = queue("test_confirmed_publish_and_consume");

    assert!(engine.ping().await.unwrap());

    for i in 0..5 {
        assert!(engine.enqueue(&queue, json!({"n": i})).await.unwrap());
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&seen);
    let runner = JobRunner::new(
        queue.clone(),
        job_fn(move |message: Message| {
            let counted = Arc::clone(&counted);
            async move {
                assert!(message.payload()["n"].is_number());
                counted.fetch_add(1, Ordering::SeqCst);
                JobResult::Ok(Ack::Ack)
            }
        }),
    );
    let consumer = spawn_consumer(&engine, &queue, runner);

    eventually(Duration::from_secs(15), "5 deliveries", || async {
        seen.load(Ordering::SeqCst) == 5
    })
    .await;

    engine.close().await.unwrap();
    consumer.await.unwrap();

    assert!(engine.is_closed());
    assert!(!engine.ping().await.unwrap());
    assert!(matches!(
        engine.enqueue(&queue, json!({})).await,
        Err(job_queue::QueueError::Closed)
    ));
}

#[tokio::test]
async fn test_retryable_failure_is_redelivered() {
    let rabbit = TestRabbitMq::new().await;
    let engine = engine(&rabbit);
    let queue = queue("test_retryable_failure_is_redelivered");

    engine.enqueue(&queue, json!({"flaky": true})).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    let runner = JobRunner::new(
        queue.clone(),
        job_fn(move |_message: Message| {
            let counted = Arc::clone(&counted);
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    JobResult::Err(JobError::retryable("first attempt fails"))
                } else {
                    JobResult::Ok(Ack::Ack)
                }
            }
        }),
    );
    let consumer = spawn_consumer(&engine, &queue, runner);

    eventually(Duration::from_secs(15), "redelivery", || async {
        attempts.load(Ordering::SeqCst) == 2
    })
    .await;

    engine.close().await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn test_terminal_failure_goes_to_failed_queue() {
    let rabbit = TestRabbitMq::new().await;
    let engine = engine(&rabbit);
    let queue = queue("test_terminal_failure_goes_to_failed_queue");

    let runner = JobRunner::new(
        queue.clone(),
        job_fn(|_message: Message| async { JobResult::Err(JobError::terminal("rejected")) }),
    );
    let consumer = spawn_consumer(&engine, &queue, runner);

    // The consumer declares the failed queue; give it a moment before publishing
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.enqueue(&queue, json!({"bad": true})).await.unwrap();

    // Management statistics refresh every few seconds
    eventually(Duration::from_secs(30), "dead-lettered message", || async {
        engine.get_queue_size(&queue, true).await.unwrap_or(0) == 1
    })
    .await;

    engine.close().await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn test_close_lets_the_delivery_in_hand_settle() {
    let rabbit = TestRabbitMq::new().await;
    let engine = engine(&rabbit);
    let queue = queue("test_close_lets_the_delivery_in_hand_settle");

    engine.enqueue(&queue, json!({"slow": true})).await.unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_in_job, finished_in_job) = (Arc::clone(&started), Arc::clone(&finished));
    let runner = JobRunner::new(
        queue.clone(),
        job_fn(move |_message: Message| {
            let (started, finished) = (Arc::clone(&started_in_job), Arc::clone(&finished_in_job));
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                JobResult::Ok(Ack::Ack)
            }
        }),
    );
    let consumer = spawn_consumer(&engine, &queue, runner);

    eventually(Duration::from_secs(15), "handler started", || async {
        started.load(Ordering::SeqCst) == 1
    })
    .await;

    engine.close().await.unwrap();
    consumer.await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // The ack went through, so a fresh consumer has nothing to receive
    let next = self::engine(&rabbit);
    let redelivered = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&redelivered);
    let runner = JobRunner::new(
        queue.clone(),
        job_fn(move |_message: Message| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                JobResult::Ok(Ack::Ack)
            }
        }),
    );
    let consumer = spawn_consumer(&next, &queue, runner);
    tokio::time::sleep(Duration::from_secs(3)).await;

    next.close().await.unwrap();
    consumer.await.unwrap();
    assert_eq!(redelivered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_queue_size_from_management_api() {
    let rabbit = TestRabbitMq::new().await;
    let engine = engine(&rabbit);
    let queue = queue("test_queue_size_from_management_api");

    // Unknown queues count as empty
    assert_eq!(engine.get_queue_size(&queue, false).await.unwrap(), 0);

    for i in 0..3 {
        engine.enqueue(&queue, json!({"n": i})).await.unwrap();
    }

    eventually(Duration::from_secs(30), "3 waiting messages", || async {
        engine.get_queue_size(&queue, false).await.unwrap_or(0) == 3
    })
    .await;

    // Replaying is the broker's job; the call is accepted and changes nothing
    engine.retry(&queue, None).await.unwrap();
    engine.close().await.unwrap();
}
