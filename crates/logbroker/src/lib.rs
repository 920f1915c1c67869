// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logbroker
//!
//! A durable, at-least-once log forwarder. Lines posted over HTTP are fsynced
//! to an append-only buffer file before the request is acknowledged, and a
//! periodic flusher ships the backlog to ClickHouse in TabSeparated batches.
//!
//! ## Architecture
//!
//! - [`ingest`]: HTTP gateway that turns request bodies into buffered records
//! - [`buffer`]: the on-disk store, one escaped `timestamp<TAB>message` per line
//! - [`codec`]: TabSeparated escaping and record encoding
//! - [`sender`]: batch delivery to the ClickHouse HTTP interface
//! - [`flusher`]: snapshot, send with retries, clear what was delivered
//! - [`scheduler`]: runs the flusher on a period and drains on shutdown
//!
//! Records leave the buffer only after the destination accepted them, so a
//! crash or a retry may deliver a line twice but never loses an acknowledged one.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod flusher;
pub mod http_utils;
pub mod ingest;
pub mod scheduler;
pub mod sender;

pub use buffer::{BufferSnapshot, DurableStore};
pub use codec::BufferRecord;
pub use config::Config;
pub use error::{BufferError, ConfigError, FlushError, ServeError, TransportError};
pub use flusher::{Flusher, RetryStrategy};
pub use ingest::{accept_log_text, IngestServer};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerState};
pub use sender::{BatchSender, ClickHouseSender};
