// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use core::time::Duration;
use std::time::Instant;
use tracing::debug;

use crate::codec::{self, BufferRecord};
use crate::config::Config;
use crate::error::TransportError;
use crate::http_utils::build_client;

/// Ships one batch to the destination. Implementations do not retry,
/// retries belong to the [`crate::flusher::Flusher`].
#[async_trait]
pub trait BatchSender {
    async fn send(&self, records: &[BufferRecord]) -> Result<(), TransportError>;
}

/// Sends batches to the ClickHouse HTTP interface as `TabSeparated` inserts.
#[derive(Debug, Clone)]
pub struct ClickHouseSender {
    client: reqwest::Client,
    url: String,
    query: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl ClickHouseSender {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let client = build_client(config.request_timeout).map_err(TransportError::Client)?;
        Ok(ClickHouseSender {
            client,
            url: config.clickhouse_url(),
            query: insert_query(&config.clickhouse_table),
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
            timeout: config.request_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn create_request(&self, body: String) -> reqwest::RequestBuilder {
        // ClickHouse rejects anonymous requests on recent images even when the
        // password is empty, so both credentials always travel in the query string.
        self.client
            .post(&self.url)
            .query(&[
                ("query", self.query.as_str()),
                ("user", self.user.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(self.timeout)
            .body(body)
    }
}

pub fn insert_query(table: &str) -> String {
    format!("INSERT INTO {table} (ts, message) FORMAT TabSeparated")
}

#[async_trait]
impl BatchSender for ClickHouseSender {
    async fn send(&self, records: &[BufferRecord]) -> Result<(), TransportError> {
        if records.is_empty() {
            return Ok(());
        }
        let body = codec::encode_batch(records);
        let time = Instant::now();

        let resp = self.create_request(body).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    url: self.url.clone(),
                }
            } else {
                TransportError::Request {
                    url: self.url.clone(),
                    source: e,
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            // Don't read response body unless needed
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        debug!(
            "SENDER | Inserted {} records in {} ms",
            records.len(),
            time.elapsed().as_millis()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn config_for(server: &Server) -> Config {
        let host_port = server.host_with_port();
        let (host, port) = host_port.rsplit_once(':').unwrap();
        Config {
            clickhouse_host: host.to_string(),
            clickhouse_port: port.parse().unwrap(),
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn records() -> Vec<BufferRecord> {
        vec![
            BufferRecord::new("2024-01-01 00:00:00", "first\tline"),
            BufferRecord::new("2024-01-01 00:00:01", "second\nline"),
        ]
    }

    #[tokio::test]
    async fn test_send_posts_tab_separated_batch_with_credentials() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "query".into(),
                    "INSERT INTO default.logs (ts, message) FORMAT TabSeparated".into(),
                ),
                Matcher::UrlEncoded("user".into(), "default".into()),
                Matcher::UrlEncoded("password".into(), "".into()),
            ]))
            .match_body(
                "2024-01-01 00:00:00\tfirst\\tline\n2024-01-01 00:00:01\tsecond\\nline\n",
            )
            .with_status(200)
            .create_async()
            .await;

        let sender = ClickHouseSender::new(&config_for(&server)).unwrap();
        sender.send(&records()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_uses_configured_table_and_credentials() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "query".into(),
                    "INSERT INTO analytics.app_logs (ts, message) FORMAT TabSeparated".into(),
                ),
                Matcher::UrlEncoded("user".into(), "writer".into()),
                Matcher::UrlEncoded("password".into(), "s3cret".into()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let config = Config {
            clickhouse_table: "analytics.app_logs".to_string(),
            clickhouse_user: "writer".to_string(),
            clickhouse_password: "s3cret".to_string(),
            ..config_for(&server)
        };
        ClickHouseSender::new(&config)
            .unwrap()
            .send(&records())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_empty_batch_makes_no_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .expect(0)
            .create_async()
            .await;

        let sender = ClickHouseSender::new(&config_for(&server)).unwrap();
        sender.send(&[]).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_non_success_status_is_transport_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("Code: 60. DB::Exception: Table default.logs doesn't exist")
            .create_async()
            .await;

        let sender = ClickHouseSender::new(&config_for(&server)).unwrap();
        let err = sender.send(&records()).await.unwrap_err();

        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status.as_u16(), 500);
                assert!(body.contains("doesn't exist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_unreachable_destination_is_transport_error() {
        // Nothing listens on the discard port of localhost in the test environment
        let config = Config {
            clickhouse_host: "127.0.0.1".to_string(),
            clickhouse_port: 9,
            request_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let err = ClickHouseSender::new(&config)
            .unwrap()
            .send(&records())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Request { .. } | TransportError::Timeout { .. }
        ));
    }

    #[test]
    fn test_new_builds_sender_for_configured_destination() {
        let config = Config {
            clickhouse_host: "clickhouse".to_string(),
            clickhouse_port: 18123,
            ..Config::default()
        };
        let sender = ClickHouseSender::new(&config).unwrap();
        assert_eq!(sender.url(), "http://clickhouse:18123/");
    }

    #[test]
    fn test_client_error_display() {
        let source = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        let err = TransportError::Client(source);
        assert!(err.to_string().starts_with("Failed to build HTTP client: "));
    }

    #[test]
    fn test_insert_query() {
        assert_eq!(
            insert_query("default.logs"),
            "INSERT INTO default.logs (ts, message) FORMAT TabSeparated"
        );
    }
}
