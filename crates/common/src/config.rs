use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Redis connection string (status cache and delay queue)
    pub redis_url: String,

    /// Interface the HTTP server binds to
    pub http_host: String,

    /// Port the HTTP server listens on
    pub http_port: u16,

    /// Directory holding the browser UI (`index.html` plus `static/`)
    pub web_dir: String,

    /// Telegram bot token used by the delivery adapter
    pub telegram_bot_token: String,

    /// Telegram Bot API base URL (overridable for testing against a stub)
    pub telegram_api_url: String,

    /// Name of the delayed exchange notifications are published to
    pub publisher_exchange: String,

    /// Routing key binding the delayed exchange to the consumer queue
    pub routing_key: String,

    /// Main queue drained by the dispatcher
    pub consumer_queue: String,

    /// Dead-letter queue receiving rejected deliveries
    pub dlq_name: String,

    /// Number of concurrent dispatcher workers (default: 1)
    pub dispatcher_workers: usize,

    /// Consumer tag prefix; worker `i` consumes as `<name>-<i>`. Must be
    /// stable across restarts so unacked deliveries can be recovered.
    pub consumer_name: String,

    /// How long an idle dispatcher / promoter waits before polling again
    pub queue_poll_interval_ms: u64,

    /// Broker operation retry: total attempts (default: 3)
    pub broker_retry_attempts: u32,

    /// Broker operation retry: delay before the second attempt (default: 3000)
    pub broker_retry_delay_ms: u64,

    /// Broker operation retry: multiplicative backoff factor (default: 2)
    pub broker_retry_backoff: u32,

    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            http_host: std::env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: parse_var("HTTP_PORT", 8080)?,
            web_dir: std::env::var("WEB_DIR").unwrap_or_else(|_| "web".to_string()),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").map_err(|_| {
                anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required")
            })?,
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            publisher_exchange: std::env::var("PUBLISHER_EXCHANGE")
                .unwrap_or_else(|_| "notifications.delayed".to_string()),
            routing_key: std::env::var("ROUTING_KEY")
                .unwrap_or_else(|_| "notification".to_string()),
            consumer_queue: std::env::var("CONSUMER_QUEUE")
                .unwrap_or_else(|_| "notifications".to_string()),
            dlq_name: std::env::var("DLQ_NAME")
                .unwrap_or_else(|_| "notifications.dlq".to_string()),
            dispatcher_workers: parse_var("DISPATCHER_WORKERS", 1)?,
            consumer_name: std::env::var("CONSUMER_NAME")
                .unwrap_or_else(|_| "dispatcher".to_string()),
            queue_poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", 500)?,
            broker_retry_attempts: parse_var("BROKER_RETRY_ATTEMPTS", 3)?,
            broker_retry_delay_ms: parse_var("BROKER_RETRY_DELAY_MS", 3000)?,
            broker_retry_backoff: parse_var("BROKER_RETRY_BACKOFF", 2)?,
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    /// Connection-level retry policy for broker operations.
    pub fn broker_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.broker_retry_attempts,
            Duration::from_millis(self.broker_retry_delay_ms),
            self.broker_retry_backoff,
        )
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
