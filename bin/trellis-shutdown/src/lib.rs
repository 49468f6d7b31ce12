// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Drain a cell and stop its daemon.
//!
//! 1. Wait for the container datastore to empty, up to a deadline.
//! 2. Send SIGTERM to the daemon and ping its health endpoint until it
//!    stops answering, at most [`MAX_PINGS`] times.
//! 3. Remove the ingress chain, if there is one.

#![deny(unused_must_use)]

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use reqwest::Client;
use reqwest::Url;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use trellis::datastore::Store;
use trellis::iptables::FILTER;
use trellis::iptables::Iptables;
use trellis::iptables::IptablesError;
use trellis::iptables::IptablesRule;
use trellis::iptables::ignore_absent;

/// How many times the health endpoint is pinged after SIGTERM.
pub const MAX_PINGS: u32 = 5;

/// The chain holding ingress-proxy rules, jumped to from `OUTPUT`.
pub const INGRESS_CHAIN: &str = "trellis-ingress";

const PING_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("reading pid file {path}: {msg}")]
    PidFile { path: PathBuf, msg: String },

    #[error("invalid daemon url {url:?}: {msg}")]
    Url { url: String, msg: String },

    #[error("building http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("daemon still answering after {0} pings")]
    StillUp(u32),

    #[error("removing ingress chain: {0}")]
    Iptables(#[from] IptablesError),
}

/// Poll `store` every `interval` until it holds no containers. Returns
/// whether it emptied before `timeout`.
pub async fn wait_for_empty(
    store: &Arc<Store>,
    interval: Duration,
    timeout: Duration,
    log: &Logger,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match store.read_all_async().await {
            Ok(c) if c.is_empty() => {
                info!(log, "datastore is empty"; "path" => %store.path().display());
                return true;
            }
            Ok(c) => debug!(log, "containers remain"; "count" => c.len()),
            Err(e) => debug!(log, "reading datastore"; "error" => %e),
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn read_pid(path: &Path) -> Result<Pid, ShutdownError> {
    let err = |msg: String| ShutdownError::PidFile { path: path.to_path_buf(), msg };
    let raw = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    let pid: i32 = raw.trim().parse().map_err(|e: std::num::ParseIntError| err(e.to_string()))?;
    if pid <= 0 {
        return Err(err(format!("bad pid {pid}")));
    }
    Ok(Pid::from_raw(pid))
}

/// Ask the daemon to stop. A daemon that is already gone is fine.
pub fn terminate(pid: Pid, log: &Logger) {
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => info!(log, "sent SIGTERM"; "pid" => pid.as_raw()),
        Err(e) => warn!(log, "signalling daemon"; "pid" => pid.as_raw(), "error" => %e),
    }
}

/// Is something answering at `url`? Timeouts count as up, so a daemon
/// busy finishing its last cycle is not mistaken for a stopped one.
async fn is_up(client: &Client, url: &Url, log: &Logger) -> bool {
    match client.get(url.clone()).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) if e.is_timeout() => {
            debug!(log, "ping timed out");
            true
        }
        Err(e) => {
            debug!(log, "ping failed, server is down"; "error" => %e);
            false
        }
    }
}

/// Ping `url` every `interval`, at most [`MAX_PINGS`] times or until
/// `timeout`, and fail if it still answers.
pub async fn wait_for_server_down(
    url: &str,
    interval: Duration,
    timeout: Duration,
    log: &Logger,
) -> Result<(), ShutdownError> {
    let parsed = Url::parse(url)
        .map_err(|e| ShutdownError::Url { url: url.to_string(), msg: e.to_string() })?;
    let client = Client::builder()
        .timeout(PING_REQUEST_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()?;

    let pings = async {
        for _ in 0..MAX_PINGS {
            tokio::time::sleep(interval).await;
            if !is_up(&client, &parsed, log).await {
                return true;
            }
        }
        false
    };

    match tokio::time::timeout(timeout, pings).await {
        Ok(true) => {
            info!(log, "daemon has stopped");
            Ok(())
        }
        _ => Err(ShutdownError::StillUp(MAX_PINGS)),
    }
}

/// Unhook and remove the ingress chain. A missing chain is success.
pub async fn teardown_ingress(ipt: &dyn Iptables, log: &Logger) -> Result<(), ShutdownError> {
    let jump = IptablesRule::new(["--jump", INGRESS_CHAIN]);
    if ipt.exists(FILTER, "OUTPUT", &jump).await? {
        ignore_absent(ipt.delete(FILTER, "OUTPUT", &jump).await)?;
    }
    ignore_absent(ipt.clear_chain(FILTER, INGRESS_CHAIN).await)?;
    ignore_absent(ipt.delete_chain(FILTER, INGRESS_CHAIN).await)?;
    info!(log, "removed ingress chain"; "chain" => INGRESS_CHAIN);
    Ok(())
}
