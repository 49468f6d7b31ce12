// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use slog::Logger;
use slog::error;
use slog::info;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trellis::client::ControllerClient;
use trellis::config::Config;
use trellis::config::DaemonConfig;
use trellis::datastore::Store;
use trellis::iptables::Iptables;
use trellis::iptables::IptablesCmd;
use trellis::iptables::LockedIptables;
use trellis::log::daemon_logger;
use trellis::metrics::Metrics;
use trellis::netlink::IpRoute2;
use trellis::netlink::Netlink;
use trellis::policy::Enforcer;
use trellis::policy::Planner;
use trellis::policy::PolicyConverger;
use trellis::poller::Poller;
use trellis::vxlan::VtepFactory;
use trellis::vxlan::VxlanConverger;
use trellis::vxlan::VxlanError;
use trellisd::bootstrap::Bootstrap;
use trellisd::server::DebugState;
use trellisd::server::debug_router;
use trellisd::server::health_router;
use trellisd::server::serve;
use trellisd::shutdown_signal;

/// Run the overlay network agent of this cell.
#[derive(Debug, Parser)]
#[command(version = trellis::pkg_version())]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

struct PidFile(PathBuf);

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn bind(port: u16, ip: Ipv4Addr, what: &str) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from((ip, port));
    TcpListener::bind(addr).await.with_context(|| format!("binding {what} server to {addr}"))
}

fn spawn_server(
    listener: TcpListener,
    app: axum::Router,
    cancel: CancellationToken,
    name: &'static str,
    log: &Logger,
) -> JoinHandle<()> {
    let log = log.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, app, cancel).await {
            error!(log, "server failed"; "server" => name, "error" => %e);
        }
    })
}

async fn run(cfg: DaemonConfig, log: Logger, level: trellis::log::LevelHandle) -> anyhow::Result<()> {
    let _pid = cfg.pid_file.as_deref().map(PidFile::create).transpose()?;

    let client = Arc::new(
        ControllerClient::new(&cfg.controller_url, &cfg.tls_files(), cfg.client_timeout())
            .context("building controller client")?,
    );
    let netlink: Arc<dyn Netlink> = Arc::new(IpRoute2::default());
    let factory = VtepFactory::new(netlink.clone(), &log);

    let underlay_device = match &cfg.underlay_interface {
        Some(name) => name.clone(),
        None => factory
            .locate_underlay_device(cfg.underlay_ip)
            .await
            .context("locating underlay device")?,
    };

    let mut store = Store::new(&cfg.datastore);
    if let (Some(user), Some(group)) = (&cfg.datastore_file_owner, &cfg.datastore_file_group) {
        store = store.with_owner(user, group).context("resolving datastore owner")?;
    }
    let store = Arc::new(store);

    let lease = Bootstrap {
        cfg: &cfg,
        underlay_device: &underlay_device,
        factory: &factory,
        leases: client.as_ref(),
        store: &store,
        log: &log,
    }
    .run()
    .await
    .context("lease bootstrap")?;
    info!(log, "running with lease"; "lease" => %lease, "underlay_device" => &underlay_device);

    let pollers = CancellationToken::new();
    let servers = CancellationToken::new();

    let health = bind(cfg.health_check_port, Ipv4Addr::UNSPECIFIED, "health").await?;
    let mut server_tasks =
        vec![spawn_server(health, health_router(lease), servers.clone(), "health", &log)];

    let iptables: Arc<dyn Iptables> =
        Arc::new(LockedIptables::new(IptablesCmd::default(), &cfg.iptables_lock_file));
    let metrics = Metrics::new();
    let c2c_logging = Arc::new(AtomicBool::new(cfg.iptables_c2c_logging));

    let vxlan = Arc::new(VxlanConverger::new(
        netlink,
        client.clone(),
        &cfg.vtep_name,
        cfg.overlay_network,
        lease,
        metrics.clone(),
        &log,
    ));
    let converger = Arc::new(PolicyConverger::new(
        Planner::new(cfg.planner_config(&underlay_device), c2c_logging.clone(), &log),
        Enforcer::new(iptables.clone(), &log),
        store,
        client,
        metrics.clone(),
        &log,
    ));

    // Fired when the cell can no longer keep its lease.
    let fatal = CancellationToken::new();

    let mut poller_tasks = vec![];
    {
        let vxlan = vxlan.clone();
        let fatal = fatal.clone();
        let p = Poller::new("vxlan", cfg.poll_interval(), &log);
        poller_tasks.push(tokio::spawn(p.run(pollers.clone(), move || {
            let vxlan = vxlan.clone();
            let fatal = fatal.clone();
            async move {
                let res = vxlan.poll().await;
                if res.as_ref().is_err_and(VxlanError::is_fatal) {
                    fatal.cancel();
                }
                res.map(|_| ())
            }
        })));
    }
    {
        let converger = converger.clone();
        let p = Poller::new("policy", cfg.poll_interval(), &log);
        poller_tasks.push(tokio::spawn(p.run(pollers.clone(), move || {
            let converger = converger.clone();
            async move { converger.poll_policies().await }
        })));
    }
    if cfg.enable_asg_syncing {
        let converger = converger.clone();
        let p = Poller::new("asg", cfg.asg_poll_interval(), &log);
        poller_tasks.push(tokio::spawn(p.run(pollers.clone(), move || {
            let converger = converger.clone();
            async move { converger.poll_asgs().await }
        })));
    } else {
        info!(log, "egress syncing disabled");
    }
    poller_tasks.push(tokio::spawn(metrics.clone().run_emitter(
        iptables,
        cfg.metrics_emit_interval(),
        pollers.clone(),
        log.clone(),
    )));

    let debug = bind(cfg.debug_server_port, Ipv4Addr::LOCALHOST, "debug").await?;
    let state = Arc::new(DebugState {
        level,
        c2c_logging,
        converger,
        metrics,
        log: log.clone(),
    });
    server_tasks.push(spawn_server(debug, debug_router(state), servers.clone(), "debug", &log));

    info!(log, "started");
    let lost = tokio::select! {
        _ = shutdown_signal(&log) => false,
        _ = fatal.cancelled() => true,
    };

    pollers.cancel();
    for t in poller_tasks {
        if let Err(e) = t.await {
            error!(log, "poller task"; "error" => %e);
        }
    }
    servers.cancel();
    for t in server_tasks {
        if let Err(e) = t.await {
            error!(log, "server task"; "error" => %e);
        }
    }
    if lost {
        anyhow::bail!("lease {lease} was lost, the overlay subnet may be reassigned");
    }
    info!(log, "stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = DaemonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let (log, level) = daemon_logger("trellisd", cfg.level());
    info!(log, "starting"; "version" => trellis::pkg_version());

    let res = run(cfg, log.clone(), level).await;
    if let Err(e) = &res {
        error!(log, "exiting"; "error" => format!("{e:#}"));
    }
    res
}
