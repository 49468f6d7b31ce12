// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The local VXLAN tunnel endpoint and the converger that keeps its
//! forwarding state in line with the controller's lease table.
//!
//! For every lease inside the overlay network the VTEP carries:
//!
//! * an ARP neighbor: the lease's VTEP address resolves to its MAC;
//! * an FDB entry: frames for that MAC are tunneled to the underlay IP;
//! * for remote leases only, a route: the overlay subnet is reachable
//!   via the remote VTEP address, on-link.
//!
//! Each cycle first renews the local lease, so the controller keeps it
//! out of its staleness sweep. It then computes the desired sets from scratch, diffs them
//! against what the kernel reports, deletes the surplus and then adds
//! what is missing. The first failure ends the cycle.

use crate::client::ClientError;
use crate::client::LeaseSource;
use crate::metrics::Metrics;
use crate::netlink::FdbEntry;
use crate::netlink::Neighbor;
use crate::netlink::Netlink;
use crate::netlink::NetlinkError;
use crate::netlink::Route;
use crate::netlink::VxlanSpec;
use ipnetwork::Ipv4Network;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use trellis_api::Lease;
use trellis_api::MacAddr;

/// `IFNAMSIZ` less the terminating NUL.
pub const MAX_LINK_NAME_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum VxlanError {
    #[error("netlink: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("fetching leases: {0}")]
    Client(#[from] ClientError),

    #[error("invalid vtep config: {0}")]
    Config(String),

    #[error("vtep {0} has no overlay address")]
    NoAddress(String),

    #[error("no interface carries underlay address {0}")]
    UnderlayNotFound(Ipv4Addr),

    #[error("controller no longer holds lease {0}")]
    LeaseLost(Lease),
}

impl VxlanError {
    /// The cell can no longer route with its lease and must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LeaseLost(_))
    }
}

/// A validated description of the local VTEP.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VtepConfig {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub underlay_device: String,
    pub underlay_ip: Ipv4Addr,
    pub overlay_ip: Ipv4Addr,
    pub overlay_mac: MacAddr,
    pub overlay_network: Ipv4Network,
}

impl VtepConfig {
    /// Describe the VTEP that serves `lease`.
    pub fn new(
        name: &str,
        vni: u32,
        port: u16,
        underlay_device: &str,
        lease: &Lease,
        overlay_network: Ipv4Network,
    ) -> Result<Self, VxlanError> {
        if name.is_empty() || name.len() > MAX_LINK_NAME_LEN {
            return Err(VxlanError::Config(format!(
                "name {name:?} must be 1 to {MAX_LINK_NAME_LEN} bytes"
            )));
        }
        if port == 0 {
            return Err(VxlanError::Config("port must be non-zero".into()));
        }
        if underlay_device.is_empty() {
            return Err(VxlanError::Config("underlay device is empty".into()));
        }
        if lease.overlay_hardware_addr == MacAddr::ZERO {
            return Err(VxlanError::Config("overlay hardware address is zero".into()));
        }
        if overlay_network.prefix() >= lease.overlay_subnet.prefix() {
            return Err(VxlanError::Config(format!(
                "overlay network {overlay_network} must be larger than subnet {}",
                lease.overlay_subnet
            )));
        }
        if !overlay_network.contains(lease.vtep_ip()) {
            return Err(VxlanError::Config(format!(
                "subnet {} is outside overlay network {overlay_network}",
                lease.overlay_subnet
            )));
        }

        Ok(Self {
            name: name.to_string(),
            vni,
            port,
            underlay_device: underlay_device.to_string(),
            underlay_ip: lease.underlay_ip,
            overlay_ip: lease.vtep_ip(),
            overlay_mac: lease.overlay_hardware_addr,
            overlay_network,
        })
    }

    fn spec(&self) -> VxlanSpec {
        VxlanSpec {
            name: self.name.clone(),
            vni: self.vni,
            port: self.port,
            underlay_device: self.underlay_device.clone(),
            underlay_ip: self.underlay_ip,
            mac: self.overlay_mac,
            overlay_ip: self.overlay_ip,
            overlay_prefix: self.overlay_network.prefix(),
        }
    }
}

/// Creates, inspects and removes the VTEP device.
#[derive(Clone)]
pub struct VtepFactory {
    netlink: Arc<dyn Netlink>,
    log: Logger,
}

impl VtepFactory {
    pub fn new(netlink: Arc<dyn Netlink>, log: &Logger) -> Self {
        Self { netlink, log: log.new(o!("component" => "vtep")) }
    }

    /// Create the device, address it with the overlay network's prefix
    /// length, and bring it up.
    pub async fn create_vtep(&self, cfg: &VtepConfig) -> Result<(), VxlanError> {
        self.netlink.link_add_vxlan(&cfg.spec()).await?;
        let addr = Ipv4Network::new(cfg.overlay_ip, cfg.overlay_network.prefix())
            .map_err(|e| VxlanError::Config(e.to_string()))?;
        self.netlink.addr_add(&cfg.name, addr).await?;
        self.netlink.link_set_up(&cfg.name).await?;
        info!(self.log, "created vtep";
            "name" => &cfg.name, "addr" => %addr, "mac" => %cfg.overlay_mac);
        Ok(())
    }

    pub async fn delete_vtep(&self, name: &str) -> Result<(), VxlanError> {
        self.netlink.link_del(name).await?;
        info!(self.log, "deleted vtep"; "name" => name);
        Ok(())
    }

    /// The MAC and overlay address of an existing VTEP, or `None` when
    /// there is no such device.
    pub async fn vtep_state(&self, name: &str) -> Result<Option<(MacAddr, Ipv4Addr)>, VxlanError> {
        let link = match self.netlink.link_by_name(name).await {
            Ok(l) => l,
            Err(NetlinkError::LinkNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mac = link
            .mac
            .ok_or_else(|| VxlanError::Config(format!("{name} has no hardware address")))?;
        let addr = self
            .netlink
            .addr_list(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VxlanError::NoAddress(name.to_string()))?;
        Ok(Some((mac, addr.ip())))
    }

    /// Find the interface that carries `ip`.
    pub async fn locate_underlay_device(&self, ip: Ipv4Addr) -> Result<String, VxlanError> {
        for link in self.netlink.link_list().await? {
            let addrs = self.netlink.addr_list(&link.name).await?;
            if addrs.iter().any(|a| a.ip() == ip) {
                return Ok(link.name);
            }
        }
        Err(VxlanError::UnderlayNotFound(ip))
    }
}

/// What one converger cycle changed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleReport {
    pub added: usize,
    pub removed: usize,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// The kernel state the VTEP should carry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Desired {
    pub neighbors: BTreeSet<Neighbor>,
    pub fdb: BTreeSet<FdbEntry>,
    pub routes: BTreeSet<Route>,
}

/// Compute the VTEP state for `leases`, as seen from `local_underlay`.
pub fn desired_state(
    leases: &[Lease],
    overlay_network: Ipv4Network,
    local_underlay: Ipv4Addr,
) -> Desired {
    let mut d = Desired::default();
    for l in leases {
        if l.overlay_subnet.prefix() < overlay_network.prefix()
            || !overlay_network.contains(l.vtep_ip())
        {
            continue;
        }
        d.neighbors.insert(Neighbor { ip: l.vtep_ip(), mac: l.overlay_hardware_addr });
        d.fdb.insert(FdbEntry { mac: l.overlay_hardware_addr, dst: l.underlay_ip });
        if l.underlay_ip != local_underlay {
            d.routes.insert(Route { dst: l.overlay_subnet, gateway: l.vtep_ip() });
        }
    }
    d
}

pub struct VxlanConverger {
    netlink: Arc<dyn Netlink>,
    leases: Arc<dyn LeaseSource>,
    vtep: String,
    overlay_network: Ipv4Network,
    local: Lease,
    metrics: Arc<Metrics>,
    log: Logger,
}

impl VxlanConverger {
    pub fn new(
        netlink: Arc<dyn Netlink>,
        leases: Arc<dyn LeaseSource>,
        vtep: &str,
        overlay_network: Ipv4Network,
        local: Lease,
        metrics: Arc<Metrics>,
        log: &Logger,
    ) -> Self {
        Self {
            netlink,
            leases,
            vtep: vtep.to_string(),
            overlay_network,
            local,
            metrics,
            log: log.new(o!("component" => "vxlan-converger")),
        }
    }

    /// One timed, counted cycle.
    pub async fn poll(&self) -> Result<CycleReport, VxlanError> {
        let res = self.metrics.vxlan_poll_time.time(self.converge()).await;
        if res.is_err() {
            self.metrics.vxlan_errors.incr();
        }
        res
    }

    pub async fn converge(&self) -> Result<CycleReport, VxlanError> {
        match self.leases.renew_lease(&self.local).await {
            Ok(()) => {}
            Err(ClientError::NonRenewable) => return Err(VxlanError::LeaseLost(self.local)),
            Err(e) => return Err(e.into()),
        }

        let leases = self.leases.routable_leases().await?;
        let want = desired_state(&leases, self.overlay_network, self.local.underlay_ip);
        let nl = &*self.netlink;
        let dev = self.vtep.as_str();

        let have_neighbors: BTreeSet<_> = nl.neighbor_list(dev).await?.into_iter().collect();
        let have_fdb: BTreeSet<_> = nl.fdb_list(dev).await?.into_iter().collect();
        let have_routes: BTreeSet<_> = nl.route_list(dev).await?.into_iter().collect();

        let mut report = CycleReport::default();

        for r in have_routes.difference(&want.routes) {
            debug!(self.log, "route del"; "route" => %r);
            nl.route_del(dev, r).await?;
            report.removed += 1;
        }
        for e in have_fdb.difference(&want.fdb) {
            debug!(self.log, "fdb del"; "entry" => %e);
            nl.fdb_del(dev, e).await?;
            report.removed += 1;
        }
        for n in have_neighbors.difference(&want.neighbors) {
            debug!(self.log, "neighbor del"; "neighbor" => %n);
            nl.neighbor_del(dev, n).await?;
            report.removed += 1;
        }

        for n in want.neighbors.difference(&have_neighbors) {
            debug!(self.log, "neighbor add"; "neighbor" => %n);
            nl.neighbor_add(dev, n).await?;
            report.added += 1;
        }
        for e in want.fdb.difference(&have_fdb) {
            debug!(self.log, "fdb add"; "entry" => %e);
            nl.fdb_add(dev, e).await?;
            report.added += 1;
        }
        for r in want.routes.difference(&have_routes) {
            debug!(self.log, "route add"; "route" => %r);
            nl.route_add(dev, r).await?;
            report.added += 1;
        }

        if !report.is_noop() {
            info!(self.log, "converged";
                "added" => report.added, "removed" => report.removed);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeLeaseSource;
    use crate::fakes::FakeNetlink;
    use crate::log::null_logger;

    const VTEP: &str = "trellis-vtep";

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn lease(underlay: &str, subnet: &str) -> Lease {
        Lease::new(ip(underlay), subnet.parse().unwrap())
    }

    fn overlay() -> Ipv4Network {
        "10.255.0.0/16".parse().unwrap()
    }

    fn setup(leases: Vec<Lease>) -> (Arc<FakeNetlink>, Arc<FakeLeaseSource>, VxlanConverger) {
        let nl = Arc::new(FakeNetlink::new());
        nl.add_link(VTEP, Some(MacAddr::for_vtep(ip("10.255.7.0"))), &[]);
        let src = Arc::new(FakeLeaseSource::new(leases));
        let conv = VxlanConverger::new(
            nl.clone(),
            src.clone(),
            VTEP,
            overlay(),
            lease("10.0.0.1", "10.255.7.0/24"),
            Metrics::new(),
            &null_logger(),
        );
        (nl, src, conv)
    }

    fn three_cells() -> Vec<Lease> {
        vec![
            lease("10.0.0.1", "10.255.7.0/24"),
            lease("10.0.0.2", "10.255.9.0/24"),
            lease("10.0.0.3", "10.255.11.0/24"),
        ]
    }

    #[tokio::test]
    async fn reconciles_remote_leases() {
        let (nl, _src, conv) = setup(three_cells());

        let report = conv.converge().await.unwrap();
        assert_eq!(report, CycleReport { added: 8, removed: 0 });

        let neighbors = nl.neighbor_list(VTEP).await.unwrap();
        assert_eq!(neighbors.len(), 3);
        assert!(neighbors.contains(&Neighbor {
            ip: ip("10.255.9.0"),
            mac: "ee:ee:0a:ff:09:00".parse().unwrap(),
        }));
        assert_eq!(nl.fdb_list(VTEP).await.unwrap().len(), 3);

        let routes: BTreeSet<_> = nl.route_list(VTEP).await.unwrap().into_iter().collect();
        let expected: BTreeSet<_> = [
            Route { dst: "10.255.9.0/24".parse().unwrap(), gateway: ip("10.255.9.0") },
            Route { dst: "10.255.11.0/24".parse().unwrap(), gateway: ip("10.255.11.0") },
        ]
        .into_iter()
        .collect();
        assert_eq!(routes, expected);
    }

    #[tokio::test]
    async fn second_cycle_is_noop() {
        let (nl, _src, conv) = setup(three_cells());
        conv.converge().await.unwrap();
        let before = nl.mutations();

        let report = conv.converge().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(nl.mutations(), before);
    }

    #[tokio::test]
    async fn every_cycle_renews_local_lease() {
        let (_nl, src, conv) = setup(three_cells());
        for _ in 0..3 {
            conv.converge().await.unwrap();
        }
        assert_eq!(src.renewals(), vec![lease("10.0.0.1", "10.255.7.0/24"); 3]);
    }

    #[tokio::test]
    async fn lost_lease_is_fatal() {
        let (nl, src, conv) = setup(three_cells());
        src.set_non_renewable(true);
        let err = conv.poll().await.unwrap_err();
        assert!(matches!(err, VxlanError::LeaseLost(l) if l.underlay_ip == ip("10.0.0.1")));
        assert!(err.is_fatal());
        assert_eq!(nl.mutations(), 0);
    }

    #[tokio::test]
    async fn renewal_transport_failure_is_not_fatal() {
        let (nl, src, conv) = setup(three_cells());
        src.fail_next();
        let err = conv.converge().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(nl.mutations(), 0);
        // The next cycle renews and converges.
        conv.converge().await.unwrap();
        assert_eq!(src.renewals().len(), 1);
    }

    #[tokio::test]
    async fn lease_source_failure_skips_cycle() {
        let (nl, src, conv) = setup(three_cells());
        src.fail_next();
        assert!(matches!(conv.converge().await, Err(VxlanError::Client(_))));
        assert_eq!(nl.mutations(), 0);
    }

    #[tokio::test]
    async fn removes_departed_and_moved_cells() {
        let (nl, src, conv) = setup(three_cells());
        conv.converge().await.unwrap();

        // 10.0.0.3 leaves; 10.255.9.0/24 moves to a new underlay.
        src.set(vec![
            lease("10.0.0.1", "10.255.7.0/24"),
            lease("10.0.0.4", "10.255.9.0/24"),
        ]);
        let report = conv.converge().await.unwrap();
        // Cell 3 loses neighbor, fdb and route; cell 2 loses its fdb
        // entry and gets a new one.
        assert_eq!(report, CycleReport { added: 1, removed: 4 });

        let fdb = nl.fdb_list(VTEP).await.unwrap();
        assert!(fdb.contains(&FdbEntry {
            mac: "ee:ee:0a:ff:09:00".parse().unwrap(),
            dst: ip("10.0.0.4"),
        }));
        assert_eq!(fdb.len(), 2);
        assert_eq!(nl.route_list(VTEP).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ignores_leases_outside_overlay() {
        let (nl, _src, conv) = setup(vec![
            lease("10.0.0.1", "10.255.7.0/24"),
            lease("10.0.0.9", "10.254.1.0/24"),
        ]);
        conv.converge().await.unwrap();
        assert_eq!(nl.neighbor_list(VTEP).await.unwrap().len(), 1);
        assert!(nl.route_list(VTEP).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn netlink_failure_aborts_cycle() {
        let (nl, _src, conv) = setup(three_cells());
        nl.fail_on("fdb_add");
        assert!(matches!(conv.converge().await, Err(VxlanError::Netlink(_))));
        // Neighbors went in before the failure; no routes did.
        assert_eq!(nl.neighbor_list(VTEP).await.unwrap().len(), 3);
        assert!(nl.route_list(VTEP).await.unwrap().is_empty());
    }

    #[test]
    fn config_validation() {
        let l = lease("10.0.0.1", "10.255.7.0/24");
        assert!(VtepConfig::new(VTEP, 1, 4789, "eth0", &l, overlay()).is_ok());
        assert!(VtepConfig::new("", 1, 4789, "eth0", &l, overlay()).is_err());
        assert!(VtepConfig::new("a-very-long-link-name", 1, 4789, "eth0", &l, overlay()).is_err());
        assert!(VtepConfig::new(VTEP, 1, 0, "eth0", &l, overlay()).is_err());
        assert!(VtepConfig::new(VTEP, 1, 4789, "eth0", &l, "10.255.7.0/24".parse().unwrap())
            .is_err());
        assert!(VtepConfig::new(VTEP, 1, 4789, "eth0", &l, "10.254.0.0/16".parse().unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn factory_lifecycle() {
        let nl = Arc::new(FakeNetlink::new());
        nl.add_link("eth0", None, &["10.0.0.1/24".parse().unwrap()]);
        let f = VtepFactory::new(nl.clone(), &null_logger());

        assert_eq!(f.locate_underlay_device(ip("10.0.0.1")).await.unwrap(), "eth0");
        assert!(matches!(
            f.locate_underlay_device(ip("10.0.0.2")).await,
            Err(VxlanError::UnderlayNotFound(_))
        ));

        assert_eq!(f.vtep_state(VTEP).await.unwrap(), None);
        let l = lease("10.0.0.1", "10.255.7.0/24");
        let cfg = VtepConfig::new(VTEP, 1, 4789, "eth0", &l, overlay()).unwrap();
        f.create_vtep(&cfg).await.unwrap();
        assert_eq!(
            f.vtep_state(VTEP).await.unwrap(),
            Some((l.overlay_hardware_addr, ip("10.255.7.0")))
        );
        assert_eq!(
            nl.addr_list(VTEP).await.unwrap(),
            vec!["10.255.7.0/16".parse::<Ipv4Network>().unwrap()]
        );
        assert!(nl.is_up(VTEP));

        f.delete_vtep(VTEP).await.unwrap();
        assert_eq!(f.vtep_state(VTEP).await.unwrap(), None);
    }
}
