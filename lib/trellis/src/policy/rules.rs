// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Constructors for every rule the policy converger emits.
//!
//! Tags are hex strings issued by the controller; they are written as
//! packet marks (`0x<tag>`), which the VXLAN device carries across the
//! tunnel in its group-based-policy header.

use crate::iptables::IptablesRule;
use ipnetwork::Ipv4Network;
use slog::Logger;
use slog::warn;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use trellis_api::EgressDestination;
use trellis_api::IpRange;
use trellis_api::Ports;
use trellis_api::Protocol;

/// The kernel truncates log prefixes at 29 bytes including the NUL.
pub const MAX_LOG_PREFIX_LEN: usize = 28;

const REJECT: [&str; 4] = ["--jump", "REJECT", "--reject-with", "icmp-port-unreachable"];

/// Truncate to the kernel's limit and quote, with a trailing space so
/// the prefix is separated from the packet summary.
pub fn trim_and_pad(name: &str) -> String {
    let mut end = name.len().min(MAX_LOG_PREFIX_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("\"{} \"", &name[..end])
}

fn with_comment(rule: IptablesRule, comment: &str) -> IptablesRule {
    rule.extend(["-m", "comment", "--comment"]).extend([comment.replace(' ', "_")])
}

fn mark(tag: &str) -> String {
    format!("0x{tag}")
}

fn limit(per_sec: u32) -> [String; 5] {
    [
        "-m".into(),
        "limit".into(),
        "--limit".into(),
        format!("{per_sec}/s"),
        "--limit-burst".into(),
    ]
}

// App-to-app rules for the shared chain.

/// Tag packets from `source_ip` with its group's tag.
pub fn mark_set(source_ip: Ipv4Addr, tag: &str, group_id: &str) -> IptablesRule {
    with_comment(
        IptablesRule::new(["--source".to_string(), source_ip.to_string()])
            .extend(["--jump", "MARK", "--set-xmark"])
            .extend([mark(tag)]),
        &format!("src:{group_id}"),
    )
}

fn mark_match(dst: Ipv4Addr, protocol: Protocol, ports: Ports, tag: &str) -> IptablesRule {
    IptablesRule::new([
        "-d".to_string(),
        dst.to_string(),
        "-p".into(),
        protocol.to_string(),
        "--dport".into(),
        ports.to_string(),
        "-m".into(),
        "mark".into(),
        "--mark".into(),
        mark(tag),
    ])
}

/// Accept packets tagged `tag` reaching `dst` on `ports`.
pub fn mark_allow(
    dst: Ipv4Addr,
    protocol: Protocol,
    ports: Ports,
    tag: &str,
    source_id: &str,
    destination_id: &str,
) -> IptablesRule {
    with_comment(
        mark_match(dst, protocol, ports, tag).extend(["--jump", "ACCEPT"]),
        &format!("src:{source_id}_dst:{destination_id}"),
    )
}

/// Log what [`mark_allow`] is about to accept. UDP has no useful
/// connection state, so it is rate limited instead.
pub fn mark_allow_log(
    dst: Ipv4Addr,
    protocol: Protocol,
    ports: Ports,
    tag: &str,
    destination_id: &str,
    accepted_udp_logs_per_sec: u32,
) -> IptablesRule {
    let base = mark_match(dst, protocol, ports, tag);
    let base = if protocol == Protocol::Udp {
        base.extend(limit(accepted_udp_logs_per_sec))
            .extend([accepted_udp_logs_per_sec.to_string()])
    } else {
        base.extend(["-m", "conntrack", "--ctstate", "INVALID,NEW,UNTRACKED"])
    };
    base.extend(["--jump", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("OK_{tag}_{destination_id}"))])
}

/// Accept tagged TCP traffic to one port; used for the ingress router.
pub fn mark_allow_no_comment(dst: Ipv4Addr, port: u16, tag: &str) -> IptablesRule {
    IptablesRule::new([
        "-d".to_string(),
        dst.to_string(),
        "-p".into(),
        "tcp".into(),
        "-m".into(),
        "tcp".into(),
        "--dport".into(),
        port.to_string(),
        "-m".into(),
        "mark".into(),
        "--mark".into(),
        mark(tag),
        "--jump".into(),
        "ACCEPT".into(),
    ])
}

/// Accept all traffic within `range`.
pub fn accept_everything(range: Ipv4Network) -> IptablesRule {
    let r = range.to_string();
    IptablesRule::new(["-s", r.as_str(), "-d", r.as_str(), "-j", "ACCEPT"])
}

// Per-container chains.

pub fn related_established() -> IptablesRule {
    IptablesRule::new(["-m", "state", "--state", "RELATED,ESTABLISHED", "--jump", "ACCEPT"])
}

pub fn default_reject() -> IptablesRule {
    IptablesRule::new(REJECT)
}

pub fn accept() -> IptablesRule {
    IptablesRule::new(["--jump", "ACCEPT"])
}

/// Allow a container to reach a service on the host.
pub fn input_allow(protocol: Protocol, service: SocketAddrV4) -> IptablesRule {
    IptablesRule::new([
        "-p".to_string(),
        protocol.to_string(),
        "-d".into(),
        service.ip().to_string(),
        "--destination-port".into(),
        service.port().to_string(),
        "--jump".into(),
        "ACCEPT".into(),
    ])
}

/// Reject traffic to a deny network.
pub fn deny_network(net: Ipv4Network) -> IptablesRule {
    IptablesRule::new(["-d".to_string(), net.to_string()]).extend(REJECT)
}

pub fn net_out_default_reject_log(handle: &str, denied_logs_per_sec: u32) -> IptablesRule {
    IptablesRule::new(limit(denied_logs_per_sec))
        .extend([denied_logs_per_sec.to_string()])
        .extend(["--jump", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("DENY_{handle}"))])
}

/// Drop TCP packets conntrack cannot place in any connection.
pub fn net_out_invalid() -> IptablesRule {
    IptablesRule::new(["-p", "tcp", "-m", "state", "--state", "INVALID", "--jump", "DROP"])
}

/// Send new TCP connections above `rate_per_sec` (after `burst`) per
/// destination to `target`. The hashlimit bucket is named `name`.
pub fn net_out_rate_limit(
    name: &str,
    rate_per_sec: u32,
    burst: u32,
    expire_ms: u64,
    target: Option<&str>,
) -> IptablesRule {
    let rule = IptablesRule::new(["-p", "tcp", "-m", "conntrack", "--ctstate", "NEW", "-m", "hashlimit"])
        .extend(["--hashlimit-above".to_string(), format!("{rate_per_sec}/sec")])
        .extend(["--hashlimit-burst".to_string(), burst.to_string()])
        .extend(["--hashlimit-mode", "dstip,dstport"])
        .extend(["--hashlimit-name", name])
        .extend(["--hashlimit-htable-expire".to_string(), expire_ms.to_string()]);
    match target {
        Some(chain) => rule.extend(["--jump", chain]),
        None => rule.extend(REJECT),
    }
}

pub fn net_out_rate_limit_log(handle: &str, denied_logs_per_sec: u32) -> IptablesRule {
    IptablesRule::new(limit(denied_logs_per_sec))
        .extend([denied_logs_per_sec.to_string()])
        .extend(["--jump", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("DENY_ORL_{handle}"))])
}

/// The log chain's rule for everything but UDP.
pub fn net_out_log_non_udp(handle: &str) -> IptablesRule {
    IptablesRule::new(["!", "-p", "udp", "-m", "conntrack", "--ctstate", "INVALID,NEW,UNTRACKED"])
        .extend(["-j", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("OK_{handle}"))])
}

pub fn net_out_log_udp(handle: &str, accepted_udp_logs_per_sec: u32) -> IptablesRule {
    IptablesRule::new(["-p", "udp"])
        .extend(limit(accepted_udp_logs_per_sec))
        .extend([accepted_udp_logs_per_sec.to_string()])
        .extend(["-j", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("OK_{handle}"))])
}

fn accept_or_goto(rule: IptablesRule, log_chain: Option<&str>) -> IptablesRule {
    match log_chain {
        Some(chain) => rule.extend(["-g", chain]),
        None => rule.extend(["--jump", "ACCEPT"]),
    }
}

/// Allow any protocol to `range`.
pub fn net_out(range: IpRange, log_chain: Option<&str>) -> IptablesRule {
    accept_or_goto(
        IptablesRule::new(["-m".to_string(), "iprange".into(), "--dst-range".into(), range.to_string()]),
        log_chain,
    )
}

/// Allow TCP or UDP to `range` on `ports`.
pub fn net_out_with_ports(
    range: IpRange,
    protocol: Protocol,
    ports: Ports,
    log_chain: Option<&str>,
) -> IptablesRule {
    let p = protocol.to_string();
    accept_or_goto(
        IptablesRule::new([
            "-m".to_string(),
            "iprange".into(),
            "-p".into(),
            p.clone(),
            "--dst-range".into(),
            range.to_string(),
            "-m".into(),
            p,
            "--destination-port".into(),
            ports.to_string(),
        ]),
        log_chain,
    )
}

/// Allow ICMP to `range`. A type of -1 matches every type; a code of
/// -1 matches every code of the given type.
pub fn net_out_icmp(
    range: IpRange,
    icmp_type: i32,
    icmp_code: i32,
    log_chain: Option<&str>,
) -> IptablesRule {
    let mut rule = IptablesRule::new([
        "-m".to_string(),
        "iprange".into(),
        "-p".into(),
        "icmp".into(),
        "--dst-range".into(),
        range.to_string(),
    ]);
    if icmp_type >= 0 {
        let t = if icmp_code >= 0 {
            format!("{icmp_type}/{icmp_code}")
        } else {
            icmp_type.to_string()
        };
        rule = rule.extend(["-m".to_string(), "icmp".into(), "--icmp-type".into(), t]);
    }
    accept_or_goto(rule, log_chain)
}

/// Jump condition from a host-facing chain into a container's net-out
/// chain: traffic from `ip` leaving through `iface`.
pub fn net_out_jump_condition(ip: Ipv4Addr, iface: &str) -> IptablesRule {
    IptablesRule::new(["-s".to_string(), ip.to_string(), "-o".into(), iface.to_string()])
}

pub fn source_condition(ip: Ipv4Addr) -> IptablesRule {
    IptablesRule::new(["-s".to_string(), ip.to_string()])
}

// Overlay chain.

/// Let tagged traffic from `ip` out through the VTEP.
pub fn overlay_allow_egress(vtep: &str, ip: Ipv4Addr) -> IptablesRule {
    IptablesRule::new(["-s".to_string(), ip.to_string(), "-o".into(), vtep.to_string()])
        .extend(["-m", "mark", "!", "--mark", "0x0", "--jump", "ACCEPT"])
}

pub fn overlay_related_established(ip: Ipv4Addr) -> IptablesRule {
    IptablesRule::new(["-d".to_string(), ip.to_string()])
        .extend(["-m", "state", "--state", "RELATED,ESTABLISHED", "--jump", "ACCEPT"])
}

pub fn overlay_tag_accept(ip: Ipv4Addr, tag: &str) -> IptablesRule {
    IptablesRule::new(["-d".to_string(), ip.to_string(), "-m".into(), "mark".into()])
        .extend(["--mark".to_string(), mark(tag), "--jump".into(), "ACCEPT".into()])
}

pub fn overlay_default_reject(ip: Ipv4Addr) -> IptablesRule {
    IptablesRule::new(["-d".to_string(), ip.to_string()]).extend(REJECT)
}

pub fn overlay_default_reject_log(handle: &str, ip: Ipv4Addr, denied_logs_per_sec: u32) -> IptablesRule {
    IptablesRule::new(["-d".to_string(), ip.to_string()])
        .extend(limit(denied_logs_per_sec))
        .extend([denied_logs_per_sec.to_string()])
        .extend(["--jump", "LOG", "--log-prefix"])
        .extend([trim_and_pad(&format!("DENY_C2C_{handle}"))])
}

/// Turn egress destinations into allow rules, one per address range
/// and port range. Destinations that cannot be expressed are logged and
/// skipped. Duplicates are dropped, keeping the first occurrence.
pub fn convert_egress<'a>(
    destinations: impl IntoIterator<Item = &'a EgressDestination>,
    log_chain: Option<&str>,
    log: &Logger,
) -> Vec<IptablesRule> {
    let mut seen = BTreeSet::new();
    let mut out = vec![];
    for d in destinations {
        for rule in convert_one(d, log_chain, log) {
            if seen.insert(rule.clone()) {
                out.push(rule);
            }
        }
    }
    out
}

fn convert_one(d: &EgressDestination, log_chain: Option<&str>, log: &Logger) -> Vec<IptablesRule> {
    let mut out = vec![];
    match d.protocol {
        Protocol::Tcp | Protocol::Udp => {
            if d.ports.is_empty() {
                warn!(log, "invalid egress rule: tcp/udp must specify ports";
                    "destination" => ?d);
                return out;
            }
            for range in &d.ips {
                for ports in &d.ports {
                    out.push(net_out_with_ports(*range, d.protocol, *ports, log_chain));
                }
            }
        }
        Protocol::Icmp => {
            if !d.ports.is_empty() {
                warn!(log, "invalid egress rule: icmp must not specify ports";
                    "destination" => ?d);
                return out;
            }
            for range in &d.ips {
                out.push(net_out_icmp(*range, d.icmp_type, d.icmp_code, log_chain));
            }
        }
        Protocol::All => {
            if !d.ports.is_empty() {
                warn!(log, "invalid egress rule: all-protocol rules must not specify ports";
                    "destination" => ?d);
                return out;
            }
            for range in &d.ips {
                out.push(net_out(*range, log_chain));
            }
        }
    }
    out
}
