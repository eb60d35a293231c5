//! Exchange and queue layout for one [`Queue`].
//!
//! ```text
//! {namespace}         topic exchange ──{name}──> {name}         (dlx = {namespace}.failed)
//! {namespace}.failed  topic exchange ──{name}──> {name}.failed
//! ```
//!
//! Declarations are idempotent, so every consumer and confirmed publisher
//! declares before use.

use super::AmqpOptions;
use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, ExchangeKind};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Names derived from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Topology {
    pub exchange: String,
    pub failed_exchange: String,
    pub queue: String,
    pub failed_queue: String,
    pub routing_key: String,
}

impl Topology {
    pub fn new(queue: &Queue) -> Self {
        Self {
            exchange: queue.namespace().to_string(),
            failed_exchange: format!("{}.failed", queue.namespace()),
            queue: queue.name().to_string(),
            failed_queue: format!("{}.failed", queue.name()),
            routing_key: queue.name().to_string(),
        }
    }

    /// Working queue arguments: the configured ones plus the dead-letter exchange
    pub fn working_queue_arguments(&self, options: &AmqpOptions) -> FieldTable {
        let mut arguments = field_table(&options.queue_arguments);
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.failed_exchange.clone())),
        );
        arguments
    }

    /// Declare both exchanges and the working queue with its binding
    pub async fn declare_working(&self, channel: &Channel, options: &AmqpOptions) -> QueueResult<()> {
        let timeout = options.read_write_timeout;

        for exchange in [&self.exchange, &self.failed_exchange] {
            bounded(
                timeout,
                channel.exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    field_table(&options.exchange_arguments),
                ),
            )
            .await?;
        }

        bounded(
            timeout,
            channel.queue_declare(&self.queue, durable_queue(), self.working_queue_arguments(options)),
        )
        .await?;
        bounded(
            timeout,
            channel.queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
        )
        .await?;

        Ok(())
    }

    /// Declare the full layout, dead-letter queue included
    pub async fn declare(&self, channel: &Channel, options: &AmqpOptions) -> QueueResult<()> {
        self.declare_working(channel, options).await?;

        let timeout = options.read_write_timeout;
        bounded(
            timeout,
            channel.queue_declare(
                &self.failed_queue,
                durable_queue(),
                field_table(&options.queue_arguments),
            ),
        )
        .await?;
        bounded(
            timeout,
            channel.queue_bind(
                &self.failed_queue,
                &self.failed_exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
        )
        .await?;

        Ok(())
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// String arguments as an AMQP field table
pub(crate) fn field_table(arguments: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

/// Run a channel operation under a timeout
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: F) -> QueueResult<T>
where
    F: Future<Output = lapin::Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(QueueError::Connection(format!(
            "AMQP operation timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_names() {
        let queue = Queue::with_namespace("emails", "app").unwrap();
        let topology = Topology::new(&queue);

        assert_eq!(topology.exchange, "app");
        assert_eq!(topology.failed_exchange, "app.failed");
        assert_eq!(topology.queue, "emails");
        assert_eq!(topology.failed_queue, "emails.failed");
        assert_eq!(topology.routing_key, "emails");
    }

    #[test]
    fn test_working_queue_arguments_add_dead_letter_exchange() {
        let queue = Queue::with_namespace("emails", "app").unwrap();
        let options = AmqpOptions::new().with_queue_argument("x-queue-type", "quorum");

        let arguments = Topology::new(&queue).working_queue_arguments(&options);
        let inner = arguments.inner();

        assert_eq!(inner.len(), 2);
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("app.failed".to_string())))
        );
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let pending = std::future::pending::<lapin::Result<()>>();
        let err = bounded(Duration::from_millis(10), pending).await.unwrap_err();
        assert!(err.is_transient());
    }
}
