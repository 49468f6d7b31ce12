// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Process metrics.
//!
//! Everything is a plain atomic so the convergers can record without
//! coordination; [`Metrics::snapshot`] produces the JSON served on the
//! debug port and logged by the emitter.

use crate::iptables::FILTER;
use crate::iptables::Iptables;
use crate::poller::Poller;
use core::future::Future;
use serde::Serialize;
use slog::Logger;
use slog::info;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The last observed duration of something.
#[derive(Debug, Default)]
pub struct Timing(AtomicU64);

impl Timing {
    pub fn set(&self, d: Duration) {
        self.0.store(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }

    /// Await `f`, recording how long it took.
    pub async fn time<T>(&self, f: impl Future<Output = T>) -> T {
        let start = Instant::now();
        let out = f.await;
        self.set(start.elapsed());
        out
    }
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    pub iptables_rule_count: Counter,
    pub policy_poll_time: Timing,
    pub policy_enforce_time: Timing,
    pub asg_poll_time: Timing,
    pub asg_enforce_time: Timing,
    pub asg_cleanup_time: Timing,
    pub vxlan_poll_time: Timing,
    pub policy_errors: Counter,
    pub asg_errors: Counter,
    pub vxlan_errors: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            iptables_rule_count: Counter::default(),
            policy_poll_time: Timing::default(),
            policy_enforce_time: Timing::default(),
            asg_poll_time: Timing::default(),
            asg_enforce_time: Timing::default(),
            asg_cleanup_time: Timing::default(),
            vxlan_poll_time: Timing::default(),
            policy_errors: Counter::default(),
            asg_errors: Counter::default(),
            vxlan_errors: Counter::default(),
        }
    }
}

/// Durations are in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub uptime_seconds: u64,
    pub iptables_rule_count: u64,
    pub policy_poll_time: f64,
    pub policy_enforce_time: f64,
    pub asg_poll_time: f64,
    pub asg_enforce_time: f64,
    pub asg_cleanup_time: f64,
    pub vxlan_poll_time: f64,
    pub policy_errors: u64,
    pub asg_errors: u64,
    pub vxlan_errors: u64,
}

fn ms(t: &Timing) -> f64 {
    t.get().as_secs_f64() * 1000.0
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            uptime_seconds: self.uptime().as_secs(),
            iptables_rule_count: self.iptables_rule_count.get(),
            policy_poll_time: ms(&self.policy_poll_time),
            policy_enforce_time: ms(&self.policy_enforce_time),
            asg_poll_time: ms(&self.asg_poll_time),
            asg_enforce_time: ms(&self.asg_enforce_time),
            asg_cleanup_time: ms(&self.asg_cleanup_time),
            vxlan_poll_time: ms(&self.vxlan_poll_time),
            policy_errors: self.policy_errors.get(),
            asg_errors: self.asg_errors.get(),
            vxlan_errors: self.vxlan_errors.get(),
        }
    }

    /// Refresh the filter table's rule count and log a snapshot every
    /// `interval` until cancelled.
    pub async fn run_emitter(
        self: Arc<Self>,
        iptables: Arc<dyn Iptables>,
        interval: Duration,
        cancel: CancellationToken,
        log: Logger,
    ) {
        let poller = Poller::new("metrics", interval, &log);
        poller
            .run(cancel, || {
                let metrics = self.clone();
                let iptables = iptables.clone();
                let log = log.clone();
                async move {
                    let n = iptables.rule_count(FILTER).await?;
                    metrics.iptables_rule_count.set(n as u64);
                    let snap = metrics.snapshot();
                    info!(log, "metrics";
                        "uptime_seconds" => snap.uptime_seconds,
                        "iptables_rule_count" => snap.iptables_rule_count,
                        "policy_poll_time_ms" => snap.policy_poll_time,
                        "policy_enforce_time_ms" => snap.policy_enforce_time,
                        "asg_poll_time_ms" => snap.asg_poll_time,
                        "asg_enforce_time_ms" => snap.asg_enforce_time,
                        "vxlan_poll_time_ms" => snap.vxlan_poll_time,
                        "policy_errors" => snap.policy_errors,
                        "asg_errors" => snap.asg_errors,
                        "vxlan_errors" => snap.vxlan_errors
                    );
                    Ok::<_, crate::iptables::IptablesError>(())
                }
            })
            .await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_reports_ms() {
        let m = Metrics::new();
        m.policy_poll_time.set(Duration::from_micros(1500));
        m.vxlan_errors.incr();
        m.vxlan_errors.incr();
        m.iptables_rule_count.set(42);

        let snap = m.snapshot();
        assert_eq!(snap.policy_poll_time, 1.5);
        assert_eq!(snap.vxlan_errors, 2);
        assert_eq!(snap.iptables_rule_count, 42);
        assert_eq!(snap.asg_errors, 0);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["iptables_rule_count"], 42);
    }

    #[tokio::test]
    async fn time_records_duration() {
        let t = Timing::default();
        let v = t.time(async { 7 }).await;
        assert_eq!(v, 7);
        assert!(t.get() < Duration::from_secs(5));
    }
}
