//! Queue Worker Service Entry Point
//!
//! Background worker that consumes one queue from Redis Streams or AMQP.

use core_config::tracing::install_color_eyre;
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    queue_worker::run().await
}
