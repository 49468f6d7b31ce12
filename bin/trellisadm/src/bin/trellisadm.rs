// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use clap::Parser;

use trellis::client::ControllerClient;
use trellis::client::LeaseSource;
use trellis::client::TlsFiles;
use trellis::config::Config;
use trellis::config::ControllerConfig;
use trellis::datastore::Store;
use trellis::iptables::Iptables;
use trellis::iptables::IptablesCmd;
use trellis::iptables::LockedIptables;
use trellis::iptables::FILTER;
use trellis::leaser::CidrPool;
use trellis::leaser::LeaseStore;
use trellis::log::cli_logger;
use trellis::print::print_chains;
use trellis::print::print_containers;
use trellis::print::print_lease_records_into;
use trellis::print::print_leases;
use trellis_api::LeasesResp;
use trellis_api::Metadata;
use trellisadm::managed_chains;
use trellisadm::reset_iptables;
use trellisadm::RESET_ATTEMPTS;

/// Administer a trellis overlay network.
#[derive(Debug, Parser)]
#[command(version = trellis::pkg_version())]
enum Command {
    /// List the leases the controller considers routable.
    ListLeases {
        #[command(flatten)]
        controller: ControllerOpts,
    },

    /// List every lease row of a controller database, with renewal
    /// times and pins.
    ListLeaseRecords {
        /// The controller's configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Give up the lease held by an underlay address.
    ReleaseLease {
        #[command(flatten)]
        controller: ControllerOpts,
        underlay_ip: Ipv4Addr,
    },

    /// Exempt a lease from expiry, or with `--unpin` make it subject
    /// to expiry again.
    PinLease {
        #[command(flatten)]
        controller: ControllerOpts,
        underlay_ip: Ipv4Addr,
        #[arg(long)]
        unpin: bool,
    },

    /// Dump the container datastore.
    DumpDatastore {
        #[arg(short, long)]
        datastore: PathBuf,
    },

    /// Record a container in the datastore.
    AddContainer {
        #[arg(short, long)]
        datastore: PathBuf,
        handle: String,
        ip: Ipv4Addr,
        /// Metadata as a JSON object.
        #[arg(short, long, default_value = "{}")]
        metadata: String,
    },

    /// Remove a container from the datastore.
    DeleteContainer {
        #[arg(short, long)]
        datastore: PathBuf,
        handle: String,
    },

    /// Show the rules of the chains managed by trellisd.
    ListChains {
        #[arg(short, long)]
        lock_file: PathBuf,
        /// Only chains starting with this prefix.
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Flush `filter` and `nat` back to empty built-in chains.
    ResetIptables {
        #[arg(short, long)]
        lock_file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ControllerOpts {
    /// Base URL of the controller.
    #[arg(long)]
    controller_url: String,

    /// CA certificate; with the client certificate and key, talk TLS.
    #[arg(long, requires_all = ["client_cert", "client_key"])]
    ca_cert: Option<PathBuf>,

    #[arg(long)]
    client_cert: Option<PathBuf>,

    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

impl ControllerOpts {
    fn client(&self) -> anyhow::Result<ControllerClient> {
        let timeout = Duration::from_secs(self.timeout);
        let client = match (&self.ca_cert, &self.client_cert, &self.client_key) {
            (Some(ca), Some(cert), Some(key)) => {
                let tls = TlsFiles {
                    ca_cert: ca.clone(),
                    client_cert: cert.clone(),
                    client_key: key.clone(),
                };
                ControllerClient::new(&self.controller_url, &tls, timeout)?
            }
            _ => ControllerClient::plain(&self.controller_url, timeout)?,
        };
        Ok(client)
    }
}

fn locked_iptables(lock_file: PathBuf) -> Arc<dyn Iptables> {
    Arc::new(LockedIptables::new(IptablesCmd::default(), lock_file))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = cli_logger();

    match cmd {
        Command::ListLeases { controller } => {
            let leases = controller.client()?.routable_leases().await?;
            print_leases(&LeasesResp { leases })?;
        }

        Command::ListLeaseRecords { config } => {
            let cfg = ControllerConfig::load(&config)?;
            let pool = CidrPool::new(cfg.overlay_network, cfg.subnet_prefix_length)?;
            let store =
                LeaseStore::open(&cfg.database_path, pool, cfg.lease_expiration(), &log)?;
            print_lease_records_into(&mut std::io::stdout(), &store.records()?)?;
        }

        Command::ReleaseLease { controller, underlay_ip } => {
            controller.client()?.release_lease(underlay_ip).await?;
        }

        Command::PinLease { controller, underlay_ip, unpin } => {
            controller.client()?.pin_lease(underlay_ip, !unpin).await?;
        }

        Command::DumpDatastore { datastore } => {
            print_containers(&Store::new(datastore).read_all()?)?;
        }

        Command::AddContainer { datastore, handle, ip, metadata } => {
            let metadata: Metadata =
                serde_json::from_str(&metadata).context("metadata must be a JSON object")?;
            Store::new(datastore).add(&handle, ip, metadata)?;
        }

        Command::DeleteContainer { datastore, handle } => {
            Store::new(datastore).delete(&handle)?;
        }

        Command::ListChains { lock_file, prefix } => {
            let ipt = locked_iptables(lock_file);
            let chains = managed_chains(ipt.as_ref(), prefix.as_deref()).await?;
            print_chains(FILTER, &chains)?;
        }

        Command::ResetIptables { lock_file } => {
            let ipt = locked_iptables(lock_file);
            reset_iptables(ipt.as_ref(), RESET_ATTEMPTS, Duration::from_secs(1), &log)
                .await
                .with_context(|| {
                    format!("reset failed after {RESET_ATTEMPTS} attempts, giving up")
                })?;
        }
    }

    Ok(())
}
