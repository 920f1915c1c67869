// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivers the buffer backlog to the destination.
//!
//! A flush reads a snapshot of the buffer, hands it to the [`BatchSender`]
//! with bounded retries and clears exactly that snapshot once a send
//! succeeds. Records stay on disk until the destination has accepted them.
//!
//! ```text
//!   DurableStore ── snapshot ──> BatchSender ── Ok ──> clear_snapshot
//!                                    │
//!                                   Err ──> wait n * base ──> retry (n < attempts)
//! ```

use std::sync::Arc;
use std::time::Instant;

use core::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::buffer::DurableStore;
use crate::config::{FLUSH_RETRY_BACKOFF_BASE, FLUSH_RETRY_COUNT};
use crate::error::{BufferError, FlushError, TransportError};
use crate::sender::BatchSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, no wait in between
    Immediate(u32),
    /// Number of attempts and the base delay; failed attempt `n` is followed by `n * base`
    LinearBackoff(u32, Duration),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(FLUSH_RETRY_COUNT, FLUSH_RETRY_BACKOFF_BASE)
    }
}

impl RetryStrategy {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                (*attempts).max(1)
            }
        }
    }

    /// Wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, base) => base.saturating_mul(attempt),
        }
    }
}

pub struct Flusher {
    store: Arc<DurableStore>,
    sender: Arc<dyn BatchSender + Send + Sync>,
    retry_strategy: RetryStrategy,
    // serializes flushes so two snapshots of the same bytes are never in flight
    flush_lock: Mutex<()>,
}

impl Flusher {
    pub fn new(
        store: Arc<DurableStore>,
        sender: Arc<dyn BatchSender + Send + Sync>,
        retry_strategy: RetryStrategy,
    ) -> Self {
        Flusher {
            store,
            sender,
            retry_strategy,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// Ships the current backlog.
    ///
    /// Returns `Ok(false)` when there was nothing to send and `Ok(true)` once
    /// the backlog read at the start has been delivered and removed. When every
    /// attempt fails the last transport error is returned and the buffer is
    /// left untouched.
    pub async fn flush_once(&self) -> Result<bool, FlushError> {
        let _flush_guard = self.flush_lock.lock().await;

        let snapshot = self.with_store(|store| store.snapshot()).await?;
        if snapshot.is_empty() {
            return Ok(false);
        }
        let n_records = snapshot.records.len();
        debug!("FLUSHER | Flushing {n_records} records");

        let attempts = self.retry_strategy.attempts();
        let time = Instant::now();
        let mut last_error: Option<TransportError> = None;

        for attempt in 1..=attempts {
            match self.sender.send(&snapshot.records).await {
                Ok(()) => {
                    self.with_store(move |store| store.clear_snapshot(&snapshot))
                        .await?;
                    debug!(
                        "FLUSHER | Delivered {n_records} records in {} ms after {attempt} attempt(s)",
                        time.elapsed().as_millis()
                    );
                    return Ok(true);
                }
                Err(e) => {
                    warn!("FLUSHER | Attempt {attempt}/{attempts} failed: {e}");
                    last_error = Some(e);
                    // every failed attempt waits, the last one included
                    let delay = self.retry_strategy.delay_after(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        match last_error {
            Some(last) => {
                error!(
                    "FLUSHER | Failed to deliver {n_records} records after {attempts} attempts, keeping them buffered"
                );
                Err(FlushError::Exhausted {
                    records: n_records,
                    attempts,
                    last,
                })
            }
            // attempts() is never zero
            None => Ok(false),
        }
    }

    /// Runs a blocking store operation off the async worker threads.
    async fn with_store<T, F>(&self, op: F) -> Result<T, BufferError>
    where
        F: FnOnce(&DurableStore) -> Result<T, BufferError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| BufferError::Join(e.to_string()))?
    }
}
