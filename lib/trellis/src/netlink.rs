// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Links, addresses, routes, ARP neighbors and bridge FDB entries.
//!
//! Every operation is a single kernel call. Failures are returned as
//! is; nothing here retries.

use async_trait::async_trait;
use core::fmt;
use core::fmt::Display;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use trellis_api::MacAddr;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("link not found: {0}")]
    LinkNotFound(String),

    #[error("{cmd}: {msg}")]
    Command { cmd: String, msg: String },

    #[error("exec {0}")]
    Exec(String),

    #[error("decode {what}: {msg}")]
    Decode { what: &'static str, msg: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr>,
    /// The link type, e.g. `vxlan`. Absent for plain devices.
    pub kind: Option<String>,
}

/// An ARP entry: `ip` is reachable at `mac`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Neighbor {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

impl Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} lladdr {}", self.ip, self.mac)
    }
}

/// A forwarding entry: frames for `mac` are tunneled to `dst`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FdbEntry {
    pub mac: MacAddr,
    pub dst: Ipv4Addr,
}

impl Display for FdbEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} dst {}", self.mac, self.dst)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Route {
    pub dst: Ipv4Network,
    pub gateway: Ipv4Addr,
}

impl Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} via {}", self.dst, self.gateway)
    }
}

/// Everything needed to create and address a VXLAN device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub underlay_device: String,
    pub underlay_ip: Ipv4Addr,
    pub mac: MacAddr,
    pub overlay_ip: Ipv4Addr,
    /// The prefix length of the whole overlay network, so the kernel
    /// routes every overlay address to the device.
    pub overlay_prefix: u8,
}

#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_list(&self) -> Result<Vec<Link>, NetlinkError>;

    async fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError>;

    /// Create the VXLAN device described by `spec`, with source
    /// learning disabled and group-based policy enabled. The device is
    /// left down and unaddressed.
    async fn link_add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetlinkError>;

    async fn link_del(&self, name: &str) -> Result<(), NetlinkError>;

    async fn link_set_up(&self, name: &str) -> Result<(), NetlinkError>;

    async fn addr_add(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError>;

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError>;

    async fn route_add(&self, link: &str, route: &Route) -> Result<(), NetlinkError>;

    async fn route_del(&self, link: &str, route: &Route) -> Result<(), NetlinkError>;

    /// Gatewayed routes through `link`.
    async fn route_list(&self, link: &str) -> Result<Vec<Route>, NetlinkError>;

    async fn neighbor_add(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError>;

    async fn neighbor_del(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError>;

    async fn neighbor_list(&self, link: &str) -> Result<Vec<Neighbor>, NetlinkError>;

    async fn fdb_add(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError>;

    async fn fdb_del(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError>;

    /// FDB entries on `link` that tunnel to a remote.
    async fn fdb_list(&self, link: &str) -> Result<Vec<FdbEntry>, NetlinkError>;
}

/// [`Netlink`] by way of the iproute2 tools and their JSON output.
#[derive(Clone, Debug)]
pub struct IpRoute2 {
    ip: PathBuf,
    bridge: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self { ip: "ip".into(), bridge: "bridge".into() }
    }
}

impl IpRoute2 {
    pub fn new(ip: impl Into<PathBuf>, bridge: impl Into<PathBuf>) -> Self {
        Self { ip: ip.into(), bridge: bridge.into() }
    }

    async fn run(&self, bin: &Path, args: &[String]) -> Result<String, NetlinkError> {
        let out = Command::new(bin)
            .args(args)
            .output()
            .await
            .map_err(|e| NetlinkError::Exec(format!("{}: {e}", bin.display())))?;

        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }

        let cmd = format!("{} {}", bin.display(), args.join(" "));
        let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if msg.contains("does not exist") || msg.contains("Cannot find device") {
            let name = args
                .windows(2)
                .find(|w| w[0] == "dev" || w[0] == "del")
                .map(|w| w[1].clone())
                .unwrap_or_default();
            return Err(NetlinkError::LinkNotFound(name));
        }
        Err(NetlinkError::Command { cmd, msg })
    }

    async fn run_ip(&self, args: &[&str]) -> Result<String, NetlinkError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(&self.ip, &args).await
    }

    async fn run_bridge(&self, args: &[&str]) -> Result<String, NetlinkError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(&self.bridge, &args).await
    }
}

#[derive(Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IpNeigh {
    dst: String,
    #[serde(default)]
    lladdr: Option<String>,
}

#[derive(Deserialize)]
struct BridgeFdb {
    mac: String,
    #[serde(default)]
    dst: Option<String>,
}

#[derive(Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
}

fn decode<T: DeserializeOwned>(what: &'static str, out: &str) -> Result<Vec<T>, NetlinkError> {
    // Some versions print nothing at all for an empty table.
    if out.trim().is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str(out).map_err(|e| NetlinkError::Decode { what, msg: e.to_string() })
}

pub(crate) fn decode_links(out: &str) -> Result<Vec<Link>, NetlinkError> {
    let raw: Vec<IpLink> = decode("links", out)?;
    Ok(raw
        .into_iter()
        .map(|l| Link {
            name: l.ifname,
            index: l.ifindex,
            mac: l.address.and_then(|a| a.parse().ok()),
            kind: l.linkinfo.and_then(|i| i.info_kind),
        })
        .collect())
}

pub(crate) fn decode_addrs(out: &str) -> Result<Vec<Ipv4Network>, NetlinkError> {
    let raw: Vec<IpAddrEntry> = decode("addresses", out)?;
    Ok(raw
        .into_iter()
        .flat_map(|e| e.addr_info)
        .filter(|a| a.family == "inet")
        .filter_map(|a| {
            let ip: Ipv4Addr = a.local.parse().ok()?;
            Ipv4Network::new(ip, a.prefixlen).ok()
        })
        .collect())
}

pub(crate) fn decode_neighbors(out: &str) -> Result<Vec<Neighbor>, NetlinkError> {
    let raw: Vec<IpNeigh> = decode("neighbors", out)?;
    Ok(raw
        .into_iter()
        .filter_map(|n| {
            Some(Neighbor { ip: n.dst.parse().ok()?, mac: n.lladdr?.parse().ok()? })
        })
        .collect())
}

pub(crate) fn decode_fdb(out: &str) -> Result<Vec<FdbEntry>, NetlinkError> {
    let raw: Vec<BridgeFdb> = decode("fdb", out)?;
    Ok(raw
        .into_iter()
        .filter_map(|e| {
            Some(FdbEntry { mac: e.mac.parse().ok()?, dst: e.dst?.parse().ok()? })
        })
        .collect())
}

pub(crate) fn decode_routes(out: &str) -> Result<Vec<Route>, NetlinkError> {
    let raw: Vec<IpRoute> = decode("routes", out)?;
    Ok(raw
        .into_iter()
        .filter_map(|r| {
            let gateway = r.gateway?.parse().ok()?;
            // Host routes are printed without a prefix length.
            let dst = if r.dst.contains('/') {
                r.dst.parse().ok()?
            } else {
                Ipv4Network::new(r.dst.parse().ok()?, 32).ok()?
            };
            Some(Route { dst, gateway })
        })
        .collect())
}

#[async_trait]
impl Netlink for IpRoute2 {
    async fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        decode_links(&self.run_ip(&["-d", "-j", "link", "show"]).await?)
    }

    async fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        let out = self.run_ip(&["-d", "-j", "link", "show", "dev", name]).await?;
        decode_links(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| NetlinkError::LinkNotFound(name.to_string()))
    }

    async fn link_add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetlinkError> {
        let mac = spec.mac.to_string();
        let vni = spec.vni.to_string();
        let local = spec.underlay_ip.to_string();
        let port = spec.port.to_string();
        self.run_ip(&[
            "link",
            "add",
            &spec.name,
            "address",
            &mac,
            "type",
            "vxlan",
            "id",
            &vni,
            "local",
            &local,
            "dev",
            &spec.underlay_device,
            "dstport",
            &port,
            "nolearning",
            "gbp",
        ])
        .await
        .map(|_| ())
    }

    async fn link_del(&self, name: &str) -> Result<(), NetlinkError> {
        self.run_ip(&["link", "del", name]).await.map(|_| ())
    }

    async fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.run_ip(&["link", "set", "dev", name, "up"]).await.map(|_| ())
    }

    async fn addr_add(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        let a = addr.to_string();
        self.run_ip(&["addr", "add", &a, "dev", link]).await.map(|_| ())
    }

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError> {
        decode_addrs(&self.run_ip(&["-j", "addr", "show", "dev", link]).await?)
    }

    async fn route_add(&self, link: &str, route: &Route) -> Result<(), NetlinkError> {
        let dst = route.dst.to_string();
        let gw = route.gateway.to_string();
        self.run_ip(&["route", "replace", &dst, "via", &gw, "dev", link, "onlink"])
            .await
            .map(|_| ())
    }

    async fn route_del(&self, link: &str, route: &Route) -> Result<(), NetlinkError> {
        let dst = route.dst.to_string();
        let gw = route.gateway.to_string();
        self.run_ip(&["route", "del", &dst, "via", &gw, "dev", link]).await.map(|_| ())
    }

    async fn route_list(&self, link: &str) -> Result<Vec<Route>, NetlinkError> {
        decode_routes(&self.run_ip(&["-j", "route", "show", "dev", link]).await?)
    }

    async fn neighbor_add(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError> {
        let ip = n.ip.to_string();
        let mac = n.mac.to_string();
        self.run_ip(&["neigh", "replace", &ip, "lladdr", &mac, "dev", link, "nud", "permanent"])
            .await
            .map(|_| ())
    }

    async fn neighbor_del(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError> {
        let ip = n.ip.to_string();
        self.run_ip(&["neigh", "del", &ip, "dev", link]).await.map(|_| ())
    }

    async fn neighbor_list(&self, link: &str) -> Result<Vec<Neighbor>, NetlinkError> {
        decode_neighbors(&self.run_ip(&["-j", "neigh", "show", "dev", link]).await?)
    }

    async fn fdb_add(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError> {
        let mac = e.mac.to_string();
        let dst = e.dst.to_string();
        self.run_bridge(&["fdb", "replace", &mac, "dev", link, "dst", &dst, "self", "permanent"])
            .await
            .map(|_| ())
    }

    async fn fdb_del(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError> {
        let mac = e.mac.to_string();
        let dst = e.dst.to_string();
        self.run_bridge(&["fdb", "del", &mac, "dev", link, "dst", &dst, "self"])
            .await
            .map(|_| ())
    }

    async fn fdb_list(&self, link: &str) -> Result<Vec<FdbEntry>, NetlinkError> {
        decode_fdb(&self.run_bridge(&["-j", "fdb", "show", "dev", link]).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn links() {
        let out = r#"[
            {"ifindex":1,"ifname":"lo","address":"00:00:00:00:00:00","link_type":"loopback"},
            {"ifindex":7,"ifname":"trellis-vtep","address":"ee:ee:0a:ff:07:00",
             "linkinfo":{"info_kind":"vxlan","info_data":{"id":1}}}
        ]"#;
        let links = decode_links(out).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].name, "trellis-vtep");
        assert_eq!(links[1].kind.as_deref(), Some("vxlan"));
        assert_eq!(links[1].mac.unwrap().to_string(), "ee:ee:0a:ff:07:00");
        assert_eq!(links[0].kind, None);
    }

    #[test]
    fn addrs_keep_ipv4() {
        let out = r#"[{"ifindex":7,"ifname":"trellis-vtep","addr_info":[
            {"family":"inet","local":"10.255.7.0","prefixlen":16},
            {"family":"inet6","local":"fe80::1","prefixlen":64}
        ]}]"#;
        let addrs = decode_addrs(out).unwrap();
        assert_eq!(addrs, vec!["10.255.7.0/16".parse().unwrap()]);
    }

    #[test]
    fn neighbors_skip_incomplete() {
        let out = r#"[
            {"dst":"10.255.9.0","lladdr":"ee:ee:0a:ff:09:00","state":["PERMANENT"]},
            {"dst":"10.255.3.0","state":["FAILED"]},
            {"dst":"fe80::1","lladdr":"ee:ee:0a:ff:03:00"}
        ]"#;
        let n = decode_neighbors(out).unwrap();
        assert_eq!(n.len(), 1);
        assert_eq!(n[0].ip, "10.255.9.0".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn fdb_requires_dst() {
        let out = r#"[
            {"mac":"ee:ee:0a:ff:09:00","dst":"10.0.0.2","flags":["self","permanent"]},
            {"mac":"ee:ee:0a:ff:07:00","flags":["self","permanent"]}
        ]"#;
        let e = decode_fdb(out).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].dst, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn routes_need_gateway() {
        let out = r#"[
            {"dst":"10.255.0.0/16","protocol":"kernel","scope":"link","prefsrc":"10.255.7.0"},
            {"dst":"10.255.9.0/24","gateway":"10.255.9.0","flags":["onlink"]},
            {"dst":"10.255.0.17","gateway":"10.255.0.17","flags":["onlink"]}
        ]"#;
        let r = decode_routes(out).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[1].dst, "10.255.0.17/32".parse().unwrap());
    }

    #[test]
    fn empty_output() {
        assert!(decode_routes("").unwrap().is_empty());
        assert!(decode_fdb("[]").unwrap().is_empty());
        assert!(decode_links("not json").is_err());
    }
}
