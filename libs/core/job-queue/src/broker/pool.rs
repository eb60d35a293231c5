//! Connection-pooled engine.
//!
//! [`Pool`] keeps a `bb8` pool of engine instances built by a
//! [`BrokerManager`] factory and borrows one for every call. A consume loop
//! holds its instance until it returns; [`Consumer::close`] closes every
//! instance that is consuming at that moment.

use crate::broker::{Consumer, Publisher};
use crate::error::{QueueError, QueueResult};
use crate::handler::MessageHandler;
use crate::queue::Queue;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

type Factory<B> = Arc<dyn Fn() -> BoxFuture<'static, QueueResult<B>> + Send + Sync>;

/// `bb8` manager that builds engines with a factory closure
pub struct BrokerManager<B> {
    factory: Factory<B>,
}

impl<B> BrokerManager<B>
where
    B: Publisher + Consumer + 'static,
{
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<B>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || Box::pin(factory())),
        }
    }
}

impl<B> bb8::ManageConnection for BrokerManager<B>
where
    B: Publisher + Consumer + 'static,
{
    type Connection = Arc<B>;
    type Error = QueueError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let broker = (self.factory)().await?;
        debug!("Created pooled broker");
        Ok(Arc::new(broker))
    }

    async fn is_valid(&self, broker: &mut Self::Connection) -> Result<(), Self::Error> {
        if broker.ping().await? {
            Ok(())
        } else {
            Err(QueueError::Connection("pooled broker did not answer ping".into()))
        }
    }

    fn has_broken(&self, _broker: &mut Self::Connection) -> bool {
        false
    }
}

/// Publisher and consumer that delegate to pooled engine instances
pub struct Pool<B>
where
    B: Publisher + Consumer + 'static,
{
    inner: bb8::Pool<BrokerManager<B>>,
    consuming: Mutex<Vec<Arc<B>>>,
    closed: AtomicBool,
}

impl<B> Pool<B>
where
    B: Publisher + Consumer + 'static,
{
    /// Build a pool of at most `max_size` engines
    pub async fn new(manager: BrokerManager<B>, max_size: u32) -> QueueResult<Self> {
        if max_size == 0 {
            return Err(QueueError::config("pool size must be at least 1"));
        }

        let inner = bb8::Pool::builder().max_size(max_size).build(manager).await?;
        info!(max_size, "Created broker pool");

        Ok(Self::from_pool(inner))
    }

    /// Wrap an already configured `bb8` pool
    pub fn from_pool(inner: bb8::Pool<BrokerManager<B>>) -> Self {
        Self {
            inner,
            consuming: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Engines currently open, idle or borrowed
    pub fn connections(&self) -> u32 {
        self.inner.state().connections
    }

    pub fn idle_connections(&self) -> u32 {
        self.inner.state().idle_connections
    }

    async fn borrow(&self) -> QueueResult<Arc<B>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let pooled = self
            .inner
            .get()
            .await
            .map_err(|e| QueueError::Pool(e.to_string()))?;
        Ok(Arc::clone(&*pooled))
    }

    fn consuming(&self) -> std::sync::MutexGuard<'_, Vec<Arc<B>>> {
        self.consuming.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<B> Publisher for Pool<B>
where
    B: Publisher + Consumer + 'static,
{
    async fn enqueue(&self, queue: &Queue, payload: Value) -> QueueResult<bool> {
        self.borrow().await?.enqueue(queue, payload).await
    }

    async fn retry(&self, queue: &Queue, limit: Option<usize>) -> QueueResult<()> {
        self.borrow().await?.retry(queue, limit).await
    }

    async fn get_queue_size(&self, queue: &Queue, failed: bool) -> QueueResult<u64> {
        self.borrow().await?.get_queue_size(queue, failed).await
    }

    async fn ping(&self) -> QueueResult<bool> {
        match self.borrow().await {
            Ok(broker) => broker.ping().await,
            Err(e) => {
                debug!(error = %e, "Could not borrow a broker to ping");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl<B> Consumer for Pool<B>
where
    B: Publisher + Consumer + 'static,
{
    async fn consume(&self, queue: &Queue, handler: &dyn MessageHandler) -> QueueResult<()> {
        // Hold the pooled slot for the whole loop
        let pooled = self
            .inner
            .get()
            .await
            .map_err(|e| QueueError::Pool(e.to_string()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let broker = Arc::clone(&*pooled);
        self.consuming().push(Arc::clone(&broker));

        let result = broker.consume(queue, handler).await;

        self.consuming().retain(|active| !Arc::ptr_eq(active, &broker));
        result
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);

        let active: Vec<Arc<B>> = self.consuming().clone();
        for broker in &active {
            broker.close().await?;
        }

        info!(closed = active.len(), "Closed broker pool");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::JobResult;
    use crate::message::Message;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Engine that counts calls and consumes until closed
    #[derive(Default)]
    struct Fake {
        enqueued: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Publisher for Fake {
        async fn enqueue(&self, _queue: &Queue, _payload: Value) -> QueueResult<bool> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn retry(&self, _queue: &Queue, _limit: Option<usize>) -> QueueResult<()> {
            Ok(())
        }

        async fn get_queue_size(&self, _queue: &Queue, failed: bool) -> QueueResult<u64> {
            Ok(if failed { 1 } else { 7 })
        }

        async fn ping(&self) -> QueueResult<bool> {
            Ok(true)
        }
    }

    #[async_trait]
    impl Consumer for Fake {
        async fn consume(&self, _queue: &Queue, _handler: &dyn MessageHandler) -> QueueResult<()> {
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

    async fn pool(max_size: u32) -> QueueResult<Pool<Fake>> {
        Pool::new(BrokerManager::new(|| async { Ok(Fake::default()) }), max_size).await
    }

    #[tokio::test]
    async fn test_zero_size_is_rejected() {
        let err = pool(0).await.err().unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn test_publisher_calls_delegate() {
        let pool = pool(2).await.unwrap();
        let queue = Queue::new("emails").unwrap();

        assert!(pool.enqueue(&queue, json!({"to": "a@b.c"})).await.unwrap());
        assert_eq!(pool.get_queue_size(&queue, false).await.unwrap(), 7);
        assert_eq!(pool.get_queue_size(&queue, true).await.unwrap(), 1);
        assert!(pool.ping().await.unwrap());
        assert!(pool.connections() >= 1);
    }

    #[tokio::test]
    async fn test_close_stops_active_consumers() {
        let pool = Arc::new(pool(2).await.unwrap());
        let queue = Queue::new("emails").unwrap();

        let consuming = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.consume(&queue, &Noop).await })
        };

        while pool.consuming().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.close().await.unwrap();
        consuming.await.unwrap().unwrap();

        assert!(pool.consuming().is_empty());
        assert!(!pool.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_factory_errors_surface() {
        let manager = BrokerManager::<Fake>::new(|| async { Err(QueueError::Connection("down".into())) });
        let inner = bb8::Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_millis(100))
            .build_unchecked(manager);
        let pool = Pool::from_pool(inner);

        let queue = Queue::new("emails").unwrap();
        let err = pool.enqueue(&queue, json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::Pool(_)));
    }
}
