// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Run a cycle on a fixed cadence until cancelled.
//!
//! Cycles are strictly serial: the next one never starts before the
//! previous future resolves. Cancellation is only observed between
//! cycles, so an in-flight cycle always completes. Deadlines that pass
//! while a cycle is running are skipped, not caught up.

use core::fmt::Display;
use core::future::Future;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct Poller {
    name: &'static str,
    interval: Duration,
    log: Logger,
}

/// The first deadline after `now` on the grid `start + k * interval`,
/// and how many grid points were missed on the way.
fn next_deadline(start: Instant, now: Instant, interval: Duration) -> (Instant, u32) {
    let elapsed = now.saturating_duration_since(start);
    let periods = (elapsed.as_nanos() / interval.as_nanos()) as u32 + 1;
    (start + interval * periods, periods - 1)
}

impl Poller {
    pub fn new(name: &'static str, interval: Duration, log: &Logger) -> Self {
        Self {
            name,
            interval: interval.max(MIN_INTERVAL),
            log: log.new(o!("poller" => name)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `cycle` immediately and then every `interval` until `cancel`
    /// fires. Cycle errors are logged; the next cycle is the retry.
    pub async fn run<F, Fut, E>(self, cancel: CancellationToken, mut cycle: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        info!(self.log, "starting"; "interval" => ?self.interval);

        loop {
            let start = Instant::now();
            if let Err(e) = cycle().await {
                error!(self.log, "cycle failed"; "error" => %e);
            }

            let (wake, missed) = next_deadline(start, Instant::now(), self.interval);
            if missed > 0 {
                debug!(self.log, "cycle overran its interval"; "skipped" => missed);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        info!(self.log, "stopped");
    }
}
