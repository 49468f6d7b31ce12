// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Subnet leases and the controller requests that manage them.

use super::mac::MacAddr;
use core::fmt;
use core::fmt::Display;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

/// The exclusive binding of one overlay subnet to one cell.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Lease {
    /// The routable host address used as the VXLAN remote.
    pub underlay_ip: Ipv4Addr,
    pub overlay_subnet: Ipv4Network,
    /// The MAC of the VTEP that owns `overlay_subnet`.
    pub overlay_hardware_addr: MacAddr,
}

impl Lease {
    /// Build a lease whose hardware address is derived from the subnet.
    pub fn new(underlay_ip: Ipv4Addr, overlay_subnet: Ipv4Network) -> Self {
        let overlay_subnet = normalize(overlay_subnet);
        Self {
            underlay_ip,
            overlay_subnet,
            overlay_hardware_addr: MacAddr::for_vtep(overlay_subnet.network()),
        }
    }

    /// The overlay address carried by the owning VTEP: the network
    /// address of the subnet.
    pub fn vtep_ip(&self) -> Ipv4Addr {
        self.overlay_subnet.network()
    }

    /// Does `self` describe the same binding as `other`? Only the
    /// address pair identifies a lease; the hardware address is derived.
    pub fn same_binding(&self, other: &Lease) -> bool {
        self.underlay_ip == other.underlay_ip
            && normalize(self.overlay_subnet) == normalize(other.overlay_subnet)
    }
}

impl Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.underlay_ip, self.overlay_subnet, self.overlay_hardware_addr
        )
    }
}

/// Strip host bits so `10.255.7.9/24` and `10.255.7.0/24` compare equal.
pub fn normalize(net: Ipv4Network) -> Ipv4Network {
    // The network address of a valid prefix is always representable.
    Ipv4Network::new(net.network(), net.prefix()).unwrap_or(net)
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AcquireLeaseReq {
    pub underlay_ip: Ipv4Addr,
    /// Request a `/32` from the single-IP pool instead of a block.
    #[serde(default)]
    pub single_overlay_ip: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RenewLeaseReq {
    pub lease: Lease,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReleaseLeaseReq {
    pub underlay_ip: Ipv4Addr,
}

/// Mark a lease as in use so the staleness sweep leaves it alone.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PinLeaseReq {
    pub underlay_ip: Ipv4Addr,
    pub pinned: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LeasesResp {
    pub leases: Vec<Lease>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_shape() {
        let lease = Lease::new(
            "10.0.0.1".parse().unwrap(),
            "10.255.7.0/24".parse().unwrap(),
        );
        let v = serde_json::to_value(lease).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "underlay_ip": "10.0.0.1",
                "overlay_subnet": "10.255.7.0/24",
                "overlay_hardware_addr": "ee:ee:0a:ff:07:00",
            })
        );
        let back: Lease = serde_json::from_value(v).unwrap();
        assert_eq!(back, lease);
    }

    #[test]
    fn vtep_ip_is_network_address() {
        let l = Lease::new(
            "10.0.0.1".parse().unwrap(),
            "10.255.7.0/24".parse().unwrap(),
        );
        assert_eq!(l.vtep_ip(), "10.255.7.0".parse::<Ipv4Addr>().unwrap());

        let single = Lease::new(
            "10.0.0.1".parse().unwrap(),
            "10.255.0.17/32".parse().unwrap(),
        );
        assert_eq!(single.vtep_ip(), "10.255.0.17".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn same_binding_ignores_host_bits() {
        let a = Lease::new(
            "10.0.0.1".parse().unwrap(),
            "10.255.7.0/24".parse().unwrap(),
        );
        let mut b = a;
        b.overlay_subnet = "10.255.7.5/24".parse().unwrap();
        assert!(a.same_binding(&b));
        b.underlay_ip = "10.0.0.2".parse().unwrap();
        assert!(!a.same_binding(&b));
    }
}
