use std::str::FromStr;
use std::time::Duration;

use crate::types::{BackoffPolicy, JobOptions};

/// Broker endpoint settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 6379, password: None }
    }
}

/// Environment-driven service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP control plane listens on
    pub bind_addr: String,

    pub broker: BrokerConfig,

    /// Worker slots per channel-sync binding
    pub sync_concurrency: usize,

    /// Worker slots per analysis binding
    pub analysis_concurrency: usize,

    /// Worker slots per message-ingest binding
    pub ingest_concurrency: usize,

    pub default_max_attempts: u32,
    pub default_backoff_base_ms: u64,
    pub shutdown_grace: Duration,

    /// Base URL of the chat-platform gateway jobs fetch messages from
    pub chat_service_url: String,

    /// Base URL of the language-model analysis service
    pub ai_service_url: String,

    /// Base URL of the task persistence service (best-effort writes)
    pub task_service_url: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("QUEUE_BIND_ADDR", "127.0.0.1:3004"),
            broker: BrokerConfig {
                host: env_or("QUEUE_BROKER_HOST", "127.0.0.1"),
                port: env_parse("QUEUE_BROKER_PORT", 6379),
                password: std::env::var("QUEUE_BROKER_PASSWORD").ok(),
            },
            sync_concurrency: env_parse("QUEUE_SYNC_CONCURRENCY", 2),
            analysis_concurrency: env_parse("QUEUE_ANALYSIS_CONCURRENCY", 2),
            ingest_concurrency: env_parse("QUEUE_INGEST_CONCURRENCY", 2),
            default_max_attempts: env_parse("QUEUE_DEFAULT_MAX_ATTEMPTS", 3),
            default_backoff_base_ms: env_parse("QUEUE_DEFAULT_BACKOFF_BASE_MS", 1_000),
            shutdown_grace: Duration::from_secs(env_parse("QUEUE_SHUTDOWN_GRACE_SECS", 30)),
            chat_service_url: env_or("CHAT_SERVICE_URL", "http://localhost:3001"),
            ai_service_url: env_or("AI_SERVICE_URL", "http://localhost:3002"),
            task_service_url: env_or("TASK_SERVICE_URL", "http://localhost:3003"),
        }
    }

    /// Job options applied to queues that carry no explicit defaults
    pub fn default_job_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.default_max_attempts.max(1),
            backoff: BackoffPolicy::Exponential { base_delay_ms: self.default_backoff_base_ms },
            ..JobOptions::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|value| value.parse().ok()).unwrap_or(default)
}
