// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logbroker::{
    config::Config,
    flusher::{Flusher, RetryStrategy},
    ingest::IngestServer,
    scheduler::Scheduler,
    sender::ClickHouseSender,
    DurableStore,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // logging is not set up yet
            eprintln!("Error creating config on logbroker startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", config.log_level);
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Could not parse log level in configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");
    info!(
        "Starting logbroker: buffer {}, destination {} table {}, flushing every {} ms",
        config.buffer_path.display(),
        config.clickhouse_url(),
        config.clickhouse_table,
        config.flush_interval.as_millis()
    );

    let store = Arc::new(DurableStore::new(&config.buffer_path));
    let sender = match ClickHouseSender::new(&config) {
        Ok(sender) => Arc::new(sender),
        Err(e) => {
            error!("Error creating ClickHouse sender on logbroker startup: {e}");
            return ExitCode::FAILURE;
        }
    };
    let flusher = Arc::new(Flusher::new(
        Arc::clone(&store),
        sender,
        RetryStrategy::default(),
    ));

    let listener = match IngestServer::bind(&config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error starting logbroker ingestion gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel_token = CancellationToken::new();
    let scheduler = Scheduler::new(flusher, config.flush_interval).start(cancel_token.clone());

    let server = IngestServer::new(store, config.max_request_content_length);
    let server_cancel_token = cancel_token.clone();
    let server_task = tokio::spawn(async move {
        let res = server.serve(listener, server_cancel_token.clone()).await;
        if res.is_err() {
            // take the flush loop down with the gateway
            server_cancel_token.cancel();
        }
        res
    });

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received, draining"),
        () = cancel_token.cancelled() => {}
    }
    cancel_token.cancel();

    let mut exit_code = ExitCode::SUCCESS;
    match server_task.await {
        Ok(Ok(())) => debug!("Ingestion gateway stopped"),
        Ok(Err(e)) => {
            error!("Ingestion gateway failed: {e}");
            exit_code = ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Ingestion gateway task terminated abnormally: {e}");
            exit_code = ExitCode::FAILURE;
        }
    }

    scheduler.shutdown().await;
    info!("Logbroker stopped");
    exit_code
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
