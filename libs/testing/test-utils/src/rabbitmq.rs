//! RabbitMQ test infrastructure
//!
//! Provides a `TestRabbitMq` helper that starts a RabbitMQ container with the
//! management plugin enabled, so both the AMQP port and the HTTP API are reachable.

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;

const AMQP_PORT: u16 = 5672;
const MANAGEMENT_PORT: u16 = 15672;

/// Test RabbitMQ wrapper; the container is removed when dropped
pub struct TestRabbitMq {
    #[allow(dead_code)]
    container: ContainerAsync<RabbitMq>,
    pub host: String,
    pub amqp_port: u16,
    pub http_port: u16,
}

impl TestRabbitMq {
    /// Start a RabbitMQ management image and wait for broker startup.
    ///
    /// Credentials are the image defaults (`guest`/`guest`, vhost `/`).
    pub async fn new() -> Self {
        let container = RabbitMq::default()
            .start()
            .await
            .expect("Failed to start RabbitMQ container");

        let amqp_port = container
            .get_host_port_ipv4(AMQP_PORT)
            .await
            .expect("Failed to get AMQP port");
        let http_port = container
            .get_host_port_ipv4(MANAGEMENT_PORT)
            .await
            .expect("Failed to get management port");

        tracing::info!(amqp_port, http_port, "Test RabbitMQ ready");

        Self {
            container,
            host: "127.0.0.1".to_string(),
            amqp_port,
            http_port,
        }
    }

    /// AMQP URI with default credentials and vhost
    pub fn uri(&self) -> String {
        format!("amqp://guest:guest@{}:{}/%2f", self.host, self.amqp_port)
    }
}

impl Drop for TestRabbitMq {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test RabbitMQ container");
    }
}
