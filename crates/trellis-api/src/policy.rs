// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Network policies as published by the controller.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

/// A transport protocol named in a policy.
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
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "all",
        };
        write!(f, "{s}")
    }
}

/// An inclusive port range.
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
pub struct Ports {
    pub start: u16,
    pub end: u16,
}

impl Ports {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }
}

impl Display for Ports {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// An inclusive IPv4 address range.
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
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SourceGroup {
    pub id: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DestinationGroup {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    pub protocol: Protocol,
    pub ports: Ports,
}

/// An app-to-app policy: traffic from `source` may reach
/// `destination` over the overlay.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Policy {
    pub source: SourceGroup,
    pub destination: DestinationGroup,
}

impl Policy {
    /// The emission order of app-to-app rules.
    pub fn sort_key(&self) -> (&str, &str, Protocol, u16) {
        (
            &self.source.tag,
            &self.destination.tag,
            self.destination.protocol,
            self.destination.ports.start,
        )
    }
}

/// Who an egress policy applies to.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EgressSourceType {
    #[default]
    App,
    Space,
    Default,
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EgressSource {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub source_type: EgressSourceType,
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EgressDestination {
    pub protocol: Protocol,
    #[serde(default)]
    pub ips: Vec<IpRange>,
    #[serde(default)]
    pub ports: Vec<Ports>,
    /// `-1` means any type.
    #[serde(default = "any_icmp")]
    pub icmp_type: i32,
    /// `-1` means any code.
    #[serde(default = "any_icmp")]
    pub icmp_code: i32,
}

fn any_icmp() -> i32 {
    -1
}

/// Which container lifecycle stages an egress policy applies to.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    #[default]
    All,
    Running,
    Staging,
}

/// A container-to-external allow policy.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EgressPolicy {
    pub source: EgressSource,
    pub destination: EgressDestination,
    #[serde(default)]
    pub app_lifecycle: AppLifecycle,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoliciesResp {
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub egress_policies: Vec<EgressPolicy>,
}

/// Ask the controller for the tag of a group.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TagReq {
    pub id: String,
    #[serde(rename = "type")]
    pub tag_type: String,
}

/// An opaque hex tag issued by the controller.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Tag {
    pub id: String,
    #[serde(rename = "type")]
    pub tag_type: String,
    pub tag: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn egress_defaults() {
        let p: EgressPolicy = serde_json::from_str(
            r#"{
                "source": {"id": "space-1", "type": "space"},
                "destination": {
                    "protocol": "tcp",
                    "ips": [{"start": "1.2.3.4", "end": "1.2.3.9"}],
                    "ports": [{"start": 80, "end": 443}]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(p.source.source_type, EgressSourceType::Space);
        assert_eq!(p.app_lifecycle, AppLifecycle::All);
        assert_eq!(p.destination.icmp_type, -1);
        assert_eq!(p.destination.ips[0].to_string(), "1.2.3.4-1.2.3.9");
    }

    #[test]
    fn policy_sort_key_orders_by_tags_first() {
        let mk = |src: &str, dst: &str, port: u16| Policy {
            source: SourceGroup { id: "a".into(), tag: src.into() },
            destination: DestinationGroup {
                id: "b".into(),
                tag: dst.into(),
                protocol: Protocol::Tcp,
                ports: Ports::single(port),
            },
        };
        let mut ps = vec![mk("02", "01", 80), mk("01", "03", 9000), mk("01", "03", 22)];
        ps.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let ports: Vec<u16> =
            ps.iter().map(|p| p.destination.ports.start).collect();
        assert_eq!(ports, vec![22, 9000, 80]);
    }

    #[test]
    fn tag_uses_type_key() {
        let t: Tag =
            serde_json::from_str(r#"{"id":"g","type":"app","tag":"0004"}"#)
                .unwrap();
        assert_eq!(t.tag_type, "app");
    }
}
