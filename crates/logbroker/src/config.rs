// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use core::time::Duration;
use std::env;
use std::path::PathBuf;

const DEFAULT_CLICKHOUSE_HOST: &str = "127.0.0.1";
const DEFAULT_CLICKHOUSE_PORT: u16 = 8123;
const DEFAULT_CLICKHOUSE_USER: &str = "default";
const DEFAULT_CLICKHOUSE_TABLE: &str = "default.logs";
const DEFAULT_BUFFER_PATH: &str = "/var/lib/logbroker/buffer.log";
const DEFAULT_FLUSH_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Maximum number of send attempts per flush.
pub const FLUSH_RETRY_COUNT: u32 = 5;
/// Attempt `n` is followed by a wait of `n` times this base.
pub const FLUSH_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024; // 10MB in Bytes

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct Config {
    pub clickhouse_host: String,
    pub clickhouse_port: u16,
    pub clickhouse_user: String,
    /// Sent even when empty
    pub clickhouse_password: String,
    /// Fully qualified destination table, e.g. `default.logs`
    pub clickhouse_table: String,
    pub buffer_path: PathBuf,
    /// how often to flush the buffer
    pub flush_interval: Duration,
    pub listen_host: String,
    pub listen_port: u16,
    pub log_level: String,
    /// timeout for a single insert request
    pub request_timeout: Duration,
    pub max_request_content_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clickhouse_host: DEFAULT_CLICKHOUSE_HOST.to_string(),
            clickhouse_port: DEFAULT_CLICKHOUSE_PORT,
            clickhouse_user: DEFAULT_CLICKHOUSE_USER.to_string(),
            clickhouse_password: String::new(),
            clickhouse_table: DEFAULT_CLICKHOUSE_TABLE.to_string(),
            buffer_path: PathBuf::from(DEFAULT_BUFFER_PATH),
            flush_interval: Duration::from_secs_f64(DEFAULT_FLUSH_INTERVAL_SECS),
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            request_timeout: REQUEST_TIMEOUT,
            max_request_content_length: MAX_REQUEST_CONTENT_LENGTH,
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let flush_interval_secs = env::var("FLUSH_INTERVAL_SEC")
            .ok()
            .and_then(|val| val.trim().parse::<f64>().ok())
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS);
        if !flush_interval_secs.is_finite() || flush_interval_secs <= 0.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "FLUSH_INTERVAL_SEC must be a positive number of seconds, got {flush_interval_secs}"
            )));
        }
        let flush_interval = Duration::try_from_secs_f64(flush_interval_secs).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "FLUSH_INTERVAL_SEC {flush_interval_secs} is not a usable interval: {e}"
            ))
        })?;

        let config = Self {
            clickhouse_host: env::var("CLICKHOUSE_HOST").unwrap_or(defaults.clickhouse_host),
            clickhouse_port: env::var("CLICKHOUSE_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(DEFAULT_CLICKHOUSE_PORT),
            clickhouse_user: env::var("CLICKHOUSE_USER").unwrap_or(defaults.clickhouse_user),
            clickhouse_password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            clickhouse_table: env::var("CLICKHOUSE_TABLE").unwrap_or(defaults.clickhouse_table),
            buffer_path: env::var("BUFFER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.buffer_path),
            flush_interval,
            listen_host: env::var("LOGBROKER_HOST").unwrap_or(defaults.listen_host),
            listen_port: env::var("LOGBROKER_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(DEFAULT_LISTEN_PORT),
            log_level: env::var("LOGBROKER_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clickhouse_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "CLICKHOUSE_PORT must be greater than 0".to_string(),
            ));
        }

        if self.clickhouse_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "CLICKHOUSE_HOST cannot be empty".to_string(),
            ));
        }

        if self.clickhouse_table.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "CLICKHOUSE_TABLE cannot be empty".to_string(),
            ));
        }

        if self.buffer_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "BUFFER_PATH cannot be empty".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "FLUSH_INTERVAL_SEC must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn clickhouse_url(&self) -> String {
        format!("http://{}:{}/", self.clickhouse_host, self.clickhouse_port)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}
