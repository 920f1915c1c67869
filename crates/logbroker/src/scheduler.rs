// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use core::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::flusher::Flusher;

/// State of the periodic flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Flushing on every tick.
    Running,
    /// Shutdown was requested; the loop exits at its next wait.
    Stopping,
}

/// Shortest period the flush loop runs with.
pub const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Drives a [`Flusher`] on a fixed period.
pub struct Scheduler {
    flusher: Arc<Flusher>,
    period: Duration,
}

impl Scheduler {
    /// A period below [`MIN_FLUSH_PERIOD`] is raised to it.
    pub fn new(flusher: Arc<Flusher>, period: Duration) -> Self {
        let period = if period < MIN_FLUSH_PERIOD {
            warn!(
                "SCHEDULER | Flush period of {} ns is too short, using {} ms",
                period.as_nanos(),
                MIN_FLUSH_PERIOD.as_millis()
            );
            MIN_FLUSH_PERIOD
        } else {
            period
        };
        Self { flusher, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawns the flush loop. Cancelling `cancel_token` stops the loop at its
    /// next wait; [`SchedulerHandle::shutdown`] cancels it too and then drains.
    pub fn start(self, cancel_token: CancellationToken) -> SchedulerHandle {
        let flusher = Arc::clone(&self.flusher);
        let task = tokio::spawn(run(
            Arc::clone(&self.flusher),
            self.period,
            cancel_token.clone(),
        ));
        debug!("SCHEDULER | Flushing every {} ms", self.period.as_millis());
        SchedulerHandle {
            flusher,
            cancel_token,
            task,
        }
    }
}

async fn run(flusher: Arc<Flusher>, period: Duration, cancel_token: CancellationToken) {
    let mut flush_interval = interval(period);
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        // Cancellation is only observed here, never while a flush is running
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            _ = flush_interval.tick() => {}
        }

        match flusher.flush_once().await {
            Ok(true) => debug!("SCHEDULER | Flushed buffer"),
            Ok(false) => {}
            Err(e) => error!("SCHEDULER | Flush failed, will retry on next tick: {e}"),
        }
    }
    debug!("SCHEDULER | Flush loop stopped");
}

/// Owned by the composition root and passed to shutdown explicitly.
pub struct SchedulerHandle {
    flusher: Arc<Flusher>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        if self.cancel_token.is_cancelled() {
            SchedulerState::Stopping
        } else {
            SchedulerState::Running
        }
    }

    /// Stops the loop, waits for any in-progress flush to finish, then runs
    /// one final flush. A failed final flush is logged; its records stay on
    /// disk for the next start.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            error!("SCHEDULER | Flush loop terminated abnormally: {e}");
        }

        match self.flusher.flush_once().await {
            Ok(true) => info!("SCHEDULER | Final flush on shutdown done"),
            Ok(false) => info!("SCHEDULER | Nothing to flush on shutdown"),
            Err(e) => error!("SCHEDULER | Final flush failed, records stay buffered: {e}"),
        }
    }
}
