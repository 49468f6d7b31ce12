// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use slog::info;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trellis::datastore::Store;
use trellis::iptables::IptablesCmd;
use trellis::iptables::LockedIptables;
use trellis::log::cli_logger;
use trellis_shutdown::read_pid;
use trellis_shutdown::teardown_ingress;
use trellis_shutdown::terminate;
use trellis_shutdown::wait_for_empty;
use trellis_shutdown::wait_for_server_down;

/// Wait for a cell to drain, then stop trellisd and remove the ingress
/// chain.
#[derive(Debug, Parser)]
#[command(version = trellis::pkg_version())]
struct Args {
    /// The container datastore to watch.
    #[arg(long)]
    datastore: PathBuf,

    /// Seconds between datastore checks.
    #[arg(long, default_value_t = 5)]
    check_interval: u64,

    /// Give up waiting for the datastore to empty after this many
    /// seconds and continue.
    #[arg(long, default_value_t = 600)]
    check_timeout: u64,

    /// The daemon's health endpoint.
    #[arg(long)]
    daemon_url: String,

    /// Seconds between health pings.
    #[arg(long, default_value_t = 2)]
    ping_interval: u64,

    /// Overall deadline for the daemon to stop, in seconds.
    #[arg(long, default_value_t = 600)]
    ping_timeout: u64,

    /// Where trellisd wrote its pid.
    #[arg(long)]
    pid_file: PathBuf,

    #[arg(long)]
    iptables_lock_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = cli_logger();

    let dir = args
        .datastore
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::metadata(dir).with_context(|| format!("datastore directory {}", dir.display()))?;

    let store = Arc::new(Store::new(&args.datastore));
    let drained = wait_for_empty(
        &store,
        Duration::from_secs(args.check_interval.max(1)),
        Duration::from_secs(args.check_timeout),
        &log,
    )
    .await;
    if !drained {
        info!(log, "datastore not empty at deadline, continuing");
    }

    let pid = read_pid(&args.pid_file)?;
    terminate(pid, &log);
    wait_for_server_down(
        &args.daemon_url,
        Duration::from_secs(args.ping_interval),
        Duration::from_secs(args.ping_timeout),
        &log,
    )
    .await?;

    let ipt = LockedIptables::new(IptablesCmd::default(), &args.iptables_lock_file);
    teardown_ingress(&ipt, &log).await?;
    Ok(())
}
