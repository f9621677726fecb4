// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use statemachine_core::retry::EntityRetryConfig;

/// Where entities are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local maps; state is lost on restart.
    InMemory,
    /// SQLite connection URL (`sqlite:...`).
    Sqlite(String),
    /// PostgreSQL connection URL (`postgres://...`).
    Postgres(String),
}

impl StoreBackend {
    /// Select a backend from an optional connection URL.
    pub fn from_url(url: Option<&str>) -> Result<Self, ConfigError> {
        match url.map(str::trim) {
            None | Some("") => Ok(Self::InMemory),
            Some(url) if url.starts_with("sqlite:") => Ok(Self::Sqlite(url.to_string())),
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                Ok(Self::Postgres(url.to_string()))
            }
            Some(_) => Err(ConfigError::Invalid(
                "CONNECTOR_DATABASE_URL",
                "must start with sqlite: or postgres://",
            )),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InMemory => "memory",
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }
}

/// Settings for one process loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLoopConfig {
    /// Entities leased per processor per cycle.
    pub batch_size: usize,
    /// Sleep after an idle cycle.
    pub iteration_wait: Duration,
}

impl Default for ProcessLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            iteration_wait: Duration::from_millis(1000),
        }
    }
}

/// Connector configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Lease owner identity of this connector instance
    pub connector_id: String,
    /// Entity store backend
    pub store: StoreBackend,
    /// Lease validity window
    pub lease_duration: Duration,
    /// Bound on how long each loop's `stop()` waits
    pub shutdown_timeout: Duration,
    /// Transfer process loop settings
    pub transfer: ProcessLoopConfig,
    /// Contract negotiation loop settings
    pub negotiation: ProcessLoopConfig,
    /// Retry policy for outbound protocol messages
    pub send_retry: EntityRetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connector_id: uuid::Uuid::new_v4().to_string(),
            store: StoreBackend::InMemory,
            lease_duration: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_millis(10_000),
            transfer: ProcessLoopConfig::default(),
            negotiation: ProcessLoopConfig::default(),
            send_retry: EntityRetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `CONNECTOR_ID`: lease owner identity (default: random UUID)
    /// - `CONNECTOR_DATABASE_URL`: `sqlite:` or `postgres://` URL (default: in-memory)
    /// - `CONNECTOR_LEASE_DURATION_MS` (default: 60000)
    /// - `CONNECTOR_SHUTDOWN_TIMEOUT_MS` (default: 10000)
    /// - `CONNECTOR_TRANSFER_BATCH_SIZE` (default: 20)
    /// - `CONNECTOR_TRANSFER_ITERATION_WAIT_MS` (default: 1000)
    /// - `CONNECTOR_NEGOTIATION_BATCH_SIZE` (default: 20)
    /// - `CONNECTOR_NEGOTIATION_ITERATION_WAIT_MS` (default: 1000)
    /// - `CONNECTOR_SEND_RETRY_LIMIT` (default: 7)
    /// - `CONNECTOR_SEND_RETRY_BASE_DELAY_MS` (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let connector_id = std::env::var("CONNECTOR_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let store = StoreBackend::from_url(std::env::var("CONNECTOR_DATABASE_URL").ok().as_deref())?;

        let lease_duration = millis_var("CONNECTOR_LEASE_DURATION_MS", 60_000)?;
        if lease_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "CONNECTOR_LEASE_DURATION_MS",
                "must be greater than zero",
            ));
        }

        let transfer = ProcessLoopConfig {
            batch_size: batch_size_var("CONNECTOR_TRANSFER_BATCH_SIZE")?,
            iteration_wait: millis_var("CONNECTOR_TRANSFER_ITERATION_WAIT_MS", 1000)?,
        };
        let negotiation = ProcessLoopConfig {
            batch_size: batch_size_var("CONNECTOR_NEGOTIATION_BATCH_SIZE")?,
            iteration_wait: millis_var("CONNECTOR_NEGOTIATION_ITERATION_WAIT_MS", 1000)?,
        };

        let send_retry = EntityRetryConfig {
            retry_limit: parse_var(
                "CONNECTOR_SEND_RETRY_LIMIT",
                7u32,
                "must be a non-negative integer",
            )?,
            base_delay: millis_var("CONNECTOR_SEND_RETRY_BASE_DELAY_MS", 1000)?,
        };

        Ok(Self {
            connector_id,
            store,
            lease_duration,
            shutdown_timeout: millis_var("CONNECTOR_SHUTDOWN_TIMEOUT_MS", 10_000)?,
            transfer,
            negotiation,
            send_retry,
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default_ms, "must be a duration in milliseconds").map(Duration::from_millis)
}

fn batch_size_var(name: &'static str) -> Result<usize, ConfigError> {
    let size: usize = parse_var(name, 20, "must be a positive integer")?;
    if size == 0 {
        return Err(ConfigError::Invalid(name, "must be a positive integer"));
    }
    Ok(size)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
