// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP ingestion gateway.
//!
//! `POST /write_log` takes a plain-text body, one log line per line, and
//! answers only once the lines are fsynced to the buffer. Delivery to the
//! destination happens later and never affects the response.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffer::DurableStore;
use crate::error::{BufferError, ServeError};
use crate::http_utils::{
    create_http_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};

pub const WRITE_LOG_ENDPOINT_PATH: &str = "/write_log";
pub const HEALTH_ENDPOINT_PATH: &str = "/health";
pub const PING_ENDPOINT_PATH: &str = "/ping";

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
}

/// How long open connections get to finish their current request on shutdown.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Splits a request body into log lines. Invalid UTF-8 is replaced, blank
/// and whitespace-only lines are dropped.
pub fn split_log_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect()
}

/// Durably appends every non-blank line of `body` and returns how many were
/// written. An empty body is a successful no-op.
pub async fn accept_log_text(
    store: &Arc<DurableStore>,
    body: &[u8],
) -> Result<usize, BufferError> {
    let lines = split_log_lines(body);
    if lines.is_empty() {
        return Ok(0);
    }
    let count = lines.len();
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.append(&lines))
        .await
        .map_err(|e| BufferError::Join(e.to_string()))??;
    Ok(count)
}

#[derive(Debug, Clone)]
pub struct IngestServer {
    store: Arc<DurableStore>,
    max_request_content_length: usize,
}

impl IngestServer {
    pub fn new(store: Arc<DurableStore>, max_request_content_length: usize) -> Self {
        Self {
            store,
            max_request_content_length,
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
        TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Accepts connections until `cancel_token` is cancelled, then gives open
    /// connections a short grace period to finish their in-flight requests.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), ServeError> {
        if let Ok(addr) = listener.local_addr() {
            info!("INGEST | Listening on {addr}");
        }
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();

        loop {
            let (conn, peer) = tokio::select! {
                () = cancel_token.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("INGEST | Server error: {e}");
                        return Err(ServeError::Accept(e));
                    }
                    Ok(accepted) => accepted,
                },
                Some(finished) = joinset.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            // Don't kill server on panic - log and continue
                            error!("INGEST | Connection handler panicked: {e:?}");
                        }
                    }
                    continue;
                },
            };

            let io = TokioIo::new(conn);
            let server = server.clone();
            let ingest = self.clone();
            let cancel_token = cancel_token.clone();
            joinset.spawn(async move {
                ingest.serve_connection(server, io, peer, cancel_token).await;
            });
        }

        info!("INGEST | Stopped accepting connections");
        let drain = async { while joinset.join_next().await.is_some() {} };
        if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, drain).await.is_err() {
            error!("INGEST | Connections still open after shutdown grace period, aborting them");
            joinset.shutdown().await;
        }
        Ok(())
    }

    async fn serve_connection(
        self,
        server: hyper::server::conn::http1::Builder,
        io: TokioIo<tokio::net::TcpStream>,
        peer: SocketAddr,
        cancel_token: CancellationToken,
    ) {
        let ingest = self;
        let service = service_fn(move |req| {
            let ingest = ingest.clone();
            async move { ingest.endpoint_handler(req).await }
        });

        let conn = server.serve_connection(io, service);
        let mut conn = std::pin::pin!(conn);
        let mut shutting_down = false;
        loop {
            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!("INGEST | Connection error from {peer}: {e}");
                    }
                    break;
                }
                () = cancel_token.cancelled(), if !shutting_down => {
                    conn.as_mut().graceful_shutdown();
                    shutting_down = true;
                }
            }
        }
    }

    async fn endpoint_handler(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, WRITE_LOG_ENDPOINT_PATH) => self.handle_write_log(req).await,
            (&Method::GET, HEALTH_ENDPOINT_PATH) => health_response(),
            (&Method::GET, PING_ENDPOINT_PATH) => create_http_response(StatusCode::OK, ""),
            (_, path) => log_and_create_http_response(
                &format!("Endpoint {path} not found"),
                StatusCode::NOT_FOUND,
            ),
        }
    }

    async fn handle_write_log(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        if let Some(response) = verify_request_content_length(
            req.headers(),
            self.max_request_content_length,
            "Error processing logs",
        ) {
            return response;
        }

        let body = match Limited::new(req.into_body(), self.max_request_content_length)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.is::<http_body_util::LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                return log_and_create_http_response(
                    &format!("Error processing logs: unable to read request body: {e}"),
                    status,
                );
            }
        };

        let time = Instant::now();
        match accept_log_text(&self.store, &body).await {
            Ok(count) => {
                debug!(
                    "INGEST | Buffered {count} lines in {} ms",
                    time.elapsed().as_millis()
                );
                create_http_response(StatusCode::OK, Bytes::new())
            }
            Err(e) => log_and_create_http_response(
                &format!("Error processing logs: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }
}

fn health_response() -> http::Result<HttpResponse> {
    match serde_json::to_vec(&HealthStatus { status: "ok" }) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body))),
        Err(e) => log_and_create_http_response(
            &format!("Unable to serialize health status: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_log_lines_drops_blank_lines() {
        let lines = split_log_lines(b"first\n\n   \n\tsecond with indent\r\n\t \nthird");
        assert_eq!(lines, vec!["first", "\tsecond with indent", "third"]);
    }

    #[test]
    fn test_split_log_lines_replaces_invalid_utf8() {
        let lines = split_log_lines(b"ok\nbad \xff\xfe bytes\n");
        assert_eq!(lines, vec!["ok", "bad \u{fffd}\u{fffd} bytes"]);
    }

    #[test]
    fn test_split_log_lines_empty_body() {
        assert!(split_log_lines(b"").is_empty());
        assert!(split_log_lines(b"\n \r\n\t").is_empty());
    }

    #[tokio::test]
    async fn test_health_response_body() {
        let response = health_response().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"{\"status\":\"ok\"}"));
    }

    #[tokio::test]
    async fn test_accept_log_text_appends_lines() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path().join("buffer.log")));

        let count = accept_log_text(&store, b"one\ntwo\n\nthree\n").await.unwrap();

        assert_eq!(count, 3);
        let messages: Vec<_> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_accept_log_text_blank_body_does_not_create_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let store = Arc::new(DurableStore::new(&path));

        assert_eq!(accept_log_text(&store, b"  \n\n").await.unwrap(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_accept_log_text_reports_append_failure() {
        let dir = tempdir().unwrap();
        // a directory where the buffer file should be makes the open fail
        let path = dir.path().join("buffer.log");
        std::fs::create_dir(&path).unwrap();
        let store = Arc::new(DurableStore::new(&path));

        assert!(accept_log_text(&store, b"line").await.is_err());
    }
}
