use crate::{env_or_default, env_parse, env_required, ConfigError, FromEnv};
use strum::{AsRefStr, Display, EnumString};

/// Broker engine selected for a worker process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BrokerKind {
    Redis,
    Amqp,
}

/// Worker process settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub broker: BrokerKind,
    pub queue: String,
    pub namespace: Option<String>,
    pub workers: usize,
    pub health_port: u16,
}

impl FromEnv for WorkerConfig {
    /// Environment variables:
    /// - `QUEUE_BROKER`: `redis` or `amqp` (default: redis)
    /// - `QUEUE_NAME`: required
    /// - `QUEUE_NAMESPACE`: optional
    /// - `QUEUE_WORKERS`: default 1, must be at least 1
    /// - `HEALTH_PORT`: default 8082
    fn from_env() -> Result<Self, ConfigError> {
        let raw_broker = env_or_default("QUEUE_BROKER", "redis");
        let broker = raw_broker
            .parse::<BrokerKind>()
            .map_err(|e| ConfigError::ParseError {
                key: "QUEUE_BROKER".to_string(),
                details: format!("{}: {}", raw_broker, e),
            })?;

        let queue = env_required("QUEUE_NAME")?;
        if queue.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_NAME".to_string(),
                details: "must not be empty".to_string(),
            });
        }

        let workers = env_parse("QUEUE_WORKERS", 1usize)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_WORKERS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            broker,
            queue,
            namespace: std::env::var("QUEUE_NAMESPACE").ok(),
            workers,
            health_port: env_parse("HEALTH_PORT", 8082)?,
        })
    }
}
