//! Process configuration, read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{DEFAULT_SWEEP_BATCH_SIZE, EngineConfig};
use crate::outbox::Topics;
use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Connection settings for the Postgres ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    /// Overrides the individual fields when set.
    pub url: Option<String>,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    pub log_level: String,
    pub log_text: bool,
    /// In-memory ledger and bus instead of Postgres + Redis.
    pub in_memory: bool,
    pub database: DatabaseConfig,
    pub redis_url: String,
    /// Prepended to every topic to form the Redis channel name.
    pub redis_channel_prefix: String,
    pub topics: Topics,
    pub sweep_batch_size: u32,
    pub outbox_poll_interval: Duration,
    pub startup_retry: RetryPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and empty values take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let sweep_batch_size = parse(&get, "SWEEP_BATCH_SIZE", DEFAULT_SWEEP_BATCH_SIZE)?;
        if sweep_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            port: parse(&get, "PORT", 8080)?,
            log_level: text("LOG_LEVEL", "info"),
            log_text: flag(&get, "LOG_TEXT")?,
            in_memory: flag(&get, "IN_MEMORY")?,
            database: DatabaseConfig {
                host: text("DB_HOST", "localhost"),
                port: parse(&get, "DB_PORT", 5432)?,
                user: text("DB_USER", "postgres"),
                password: text("DB_PASS", "postgres"),
                name: text("DB_NAME", "inventory"),
                url: get("DATABASE_URL"),
            },
            redis_url: text("REDIS_URL", "redis://localhost:6379"),
            redis_channel_prefix: text("REDIS_CHANNEL_PREFIX", ""),
            topics: Topics {
                inventory: text("INVENTORY_TOPIC", "inventory.product"),
                reservation: text("RESERVATION_TOPIC", "inventory.reservation"),
            },
            sweep_batch_size,
            outbox_poll_interval: Duration::from_millis(parse(&get, "OUTBOX_POLL_MS", 1000)?),
            startup_retry: RetryPolicy::startup(),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            sweep_batch_size: self.sweep_batch_size,
            topics: self.topics.clone(),
            ..EngineConfig::default()
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn flag<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}
