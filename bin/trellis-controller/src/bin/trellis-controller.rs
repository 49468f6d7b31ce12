// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use slog::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use trellis::config::Config;
use trellis::config::ControllerConfig;
use trellis::leaser::CidrPool;
use trellis::leaser::LeaseStore;
use trellis::log::daemon_logger;
use trellis_controller::Controller;
use trellis_controller::router;
use trellis_controller::run_sweeper;
use trellis_controller::tags::TagStore;

/// Serve overlay subnet leases, policy-group tags, and policies.
#[derive(Debug, Parser)]
#[command(version = trellis::pkg_version())]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = ControllerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let (log, _level) = daemon_logger("trellis-controller", cfg.level());

    let pool = CidrPool::new(cfg.overlay_network, cfg.subnet_prefix_length)
        .context("building subnet pool")?;
    info!(log, "subnet pool";
        "network" => %cfg.overlay_network,
        "blocks" => pool.block_pool_size(),
        "singles" => pool.single_pool_size());

    let leases = Arc::new(
        LeaseStore::open(&cfg.database_path, pool, cfg.lease_expiration(), &log)
            .context("opening lease database")?,
    );
    let tags = Arc::new(
        TagStore::open(&cfg.database_path, cfg.tag_length).context("opening tag table")?,
    );

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        leases.clone(),
        cfg.staleness_sweep_interval(),
        cancel.clone(),
        log.clone(),
    ));

    let ctl = Arc::new(Controller {
        leases,
        tags,
        policy_file: cfg.policy_file.clone(),
        log: log.clone(),
    });
    let listener = TcpListener::bind(cfg.listen_address)
        .await
        .with_context(|| format!("binding {}", cfg.listen_address))?;
    info!(log, "listening"; "addr" => %cfg.listen_address);

    axum::serve(listener, router(ctl))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    cancel.cancel();
    sweeper.await.context("joining sweeper")?;
    info!(log, "stopped");
    Ok(())
}
