//! Queue depth through the RabbitMQ management HTTP API.

use crate::error::{QueueError, QueueResult};
use core_config::amqp::AmqpConfig;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct QueueDetails {
    #[serde(default)]
    messages: u64,
}

/// Client for `GET /api/queues/{vhost}/{queue}`
#[derive(Debug, Clone)]
pub(crate) struct Management {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    vhost: String,
}

impl Management {
    pub fn new(config: &AmqpConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.management_url(),
            user: config.user.clone(),
            password: config.password.clone(),
            vhost: config.encoded_vhost(),
        }
    }

    pub fn queue_url(&self, queue: &str) -> String {
        format!("{}/queues/{}/{}", self.base_url, self.vhost, queue)
    }

    /// Ready plus unacknowledged messages; a queue that does not exist yet has none
    pub async fn queue_messages(&self, queue: &str) -> QueueResult<u64> {
        let url = self.queue_url(queue);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(queue = %queue, "Queue not declared yet");
            return Ok(0);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Management { status, body });
        }

        let details: QueueDetails = response.json().await?;
        Ok(details.messages)
    }
}
