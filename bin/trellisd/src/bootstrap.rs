// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Settle which subnet this cell owns before anything else runs.
//!
//! A VTEP left behind by a previous run carries the lease in its address
//! and MAC. If the controller still agrees, keep it. If not, the device
//! is only replaced when no container holds an address from the old
//! subnet.

use ipnetwork::Ipv4Network;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::Arc;
use thiserror::Error;
use trellis::client::ClientError;
use trellis::client::LeaseSource;
use trellis::config::DaemonConfig;
use trellis::datastore::DatastoreError;
use trellis::datastore::Store;
use trellis::vxlan::VtepConfig;
use trellis::vxlan::VtepFactory;
use trellis::vxlan::VxlanError;
use trellis_api::Lease;
use trellis_api::normalize;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("vtep: {0}")]
    Vtep(#[from] VxlanError),

    #[error("controller: {0}")]
    Client(#[from] ClientError),

    #[error("datastore: {0}")]
    Datastore(#[from] DatastoreError),

    #[error(
        "lease {0} is no longer held and {1} containers still use it; \
         drain the cell before restarting"
    )]
    ContainersPresent(Lease, usize),

    #[error("vtep address does not fit a /{prefix}: {msg}")]
    BadAddress { prefix: u8, msg: String },
}

pub struct Bootstrap<'a> {
    pub cfg: &'a DaemonConfig,
    pub underlay_device: &'a str,
    pub factory: &'a VtepFactory,
    pub leases: &'a dyn LeaseSource,
    pub store: &'a Arc<Store>,
    pub log: &'a Logger,
}

impl Bootstrap<'_> {
    fn subnet_prefix(&self) -> u8 {
        if self.cfg.single_ip_only { 32 } else { self.cfg.subnet_prefix_length }
    }

    fn vtep_config(&self, lease: &Lease) -> Result<VtepConfig, VxlanError> {
        VtepConfig::new(
            &self.cfg.vtep_name,
            self.cfg.vni,
            self.cfg.vtep_port,
            self.underlay_device,
            lease,
            self.cfg.overlay_network,
        )
    }

    async fn acquire_and_create(&self) -> Result<Lease, BootstrapError> {
        let lease = self
            .leases
            .acquire_lease(self.cfg.underlay_ip, self.cfg.single_ip_only)
            .await?;
        info!(self.log, "acquired lease"; "lease" => %lease);
        self.factory.create_vtep(&self.vtep_config(&lease)?).await?;
        Ok(lease)
    }

    /// Return the lease the cell runs with, creating the VTEP if needed.
    pub async fn run(&self) -> Result<Lease, BootstrapError> {
        let Some((mac, addr)) = self.factory.vtep_state(&self.cfg.vtep_name).await? else {
            return self.acquire_and_create().await;
        };

        let prefix = self.subnet_prefix();
        let subnet = Ipv4Network::new(addr, prefix)
            .map_err(|e| BootstrapError::BadAddress { prefix, msg: e.to_string() })?;
        let candidate = Lease {
            underlay_ip: self.cfg.underlay_ip,
            overlay_subnet: normalize(subnet),
            overlay_hardware_addr: mac,
        };

        match self.leases.renew_lease(&candidate).await {
            Ok(()) => {
                info!(self.log, "renewed existing lease"; "lease" => %candidate);
                Ok(candidate)
            }
            Err(ClientError::NonRenewable) => {
                let containers = self.store.read_all_async().await?;
                if !containers.is_empty() {
                    return Err(BootstrapError::ContainersPresent(candidate, containers.len()));
                }
                warn!(self.log, "existing lease is gone, replacing vtep"; "lease" => %candidate);
                self.factory.delete_vtep(&self.cfg.vtep_name).await?;
                self.acquire_and_create().await
            }
            Err(e) => Err(e.into()),
        }
    }
}
