// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use reqwest::StatusCode;

/// Errors raised by the durable buffer file.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Failed to {operation} buffer file {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blocking buffer task failed: {0}")]
    Join(String),
}

impl BufferError {
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Failure of a single batch insert against the destination.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Failed to reach {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Destination rejected batch with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Errors returned by a single flush.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to deliver {records} records after {attempts} attempts: {last}")]
    Exhausted {
        records: usize,
        attempts: u32,
        #[source]
        last: TransportError,
    },
}

/// Errors raised while running the ingestion gateway.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::InvalidConfig("port must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: port must be greater than 0"
        );
    }

    #[test]
    fn test_exhausted_display_includes_last_error() {
        let error = FlushError::Exhausted {
            records: 3,
            attempts: 5,
            last: TransportError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "busy".to_string(),
            },
        };
        let message = error.to_string();
        assert!(message.contains("3 records"));
        assert!(message.contains("5 attempts"));
        assert!(message.contains("503"));
    }

    #[test]
    fn test_buffer_io_display_includes_path() {
        let error = BufferError::io(
            "open",
            "/tmp/buffer.log",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(error.to_string().contains("/tmp/buffer.log"));
        assert!(error.to_string().contains("open"));
    }
}
