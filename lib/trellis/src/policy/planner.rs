// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Turn containers and policies into desired chains.
//!
//! Planning does no I/O. Given the same containers, policies and
//! configuration the planner always produces the same rule sets, which
//! is what lets the converger skip chains that have not changed.

use super::chain::Chain;
use super::chain::INPUT_PREFIX;
use super::chain::NET_OUT_LOG_PREFIX;
use super::chain::NET_OUT_PREFIX;
use super::chain::OVERLAY_PREFIX;
use super::chain::Placement;
use super::chain::RATE_LIMIT_LOG_PREFIX;
use super::chain::RulesWithChain;
use super::chain::VPA_PREFIX;
use super::chain::container_chain;
use super::rules;
use crate::datastore::Containers;
use crate::iptables::FILTER;
use crate::iptables::IptablesRule;
use ipnetwork::Ipv4Network;
use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use trellis_api::AppLifecycle;
use trellis_api::ContainerRecord;
use trellis_api::EgressPolicy;
use trellis_api::EgressSourceType;
use trellis_api::Policy;
use trellis_api::Protocol;
use trellis_api::Workload;

/// The tag group of the ingress router.
pub const INGRESS_TAG_ID: &str = "INGRESS_ROUTER";
pub const INGRESS_TAG_TYPE: &str = "router";

/// Networks no container may reach, by lifecycle.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DenyNetworks {
    pub always: Vec<Ipv4Network>,
    pub running: Vec<Ipv4Network>,
    pub staging: Vec<Ipv4Network>,
}

impl DenyNetworks {
    /// The networks denied to a container running `workload`.
    pub fn for_workload(&self, workload: Option<Workload>) -> Vec<Ipv4Network> {
        let mut out = self.always.clone();
        match workload {
            Some(w) if w.is_running() => out.extend(&self.running),
            Some(Workload::Staging) => out.extend(&self.staging),
            _ => {}
        }
        out
    }
}

/// Limits on new outbound TCP connections per container.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutConn {
    pub limit: bool,
    /// Log connections over the limit before rejecting them.
    pub logging: bool,
    pub burst: u32,
    pub rate_per_sec: u32,
    /// Log connections over the limit but let them through.
    pub dry_run: bool,
}

impl Default for OutConn {
    fn default() -> Self {
        Self { limit: false, logging: false, burst: 1000, rate_per_sec: 100, dry_run: false }
    }
}

impl OutConn {
    /// How long an idle hashlimit bucket lives: the time to refill a
    /// full burst, rounded up to whole seconds.
    pub fn expiry_ms(&self) -> u64 {
        u64::from(self.burst).div_ceil(u64::from(self.rate_per_sec.max(1))) * 1000
    }
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub vtep_name: String,
    pub overlay_network: Ipv4Network,
    /// The interfaces egress leaves the host through.
    pub host_interfaces: Vec<String>,
    pub deny_networks: DenyNetworks,
    pub host_tcp_services: Vec<SocketAddrV4>,
    pub host_udp_services: Vec<SocketAddrV4>,
    pub asg_logging: bool,
    pub denied_logs_per_sec: u32,
    pub accepted_udp_logs_per_sec: u32,
    pub enable_overlay_ingress_rules: bool,
    pub disable_container_network_policy: bool,
    pub outbound_connections: OutConn,
}

/// Does a policy for `lifecycle` apply to a container running
/// `workload`? Containers of unknown workload get everything.
pub fn lifecycle_matches(lifecycle: AppLifecycle, workload: Option<Workload>) -> bool {
    match (lifecycle, workload) {
        (AppLifecycle::All, _) | (_, None) => true,
        (AppLifecycle::Running, Some(w)) => w.is_running(),
        (AppLifecycle::Staging, Some(w)) => w == Workload::Staging,
    }
}

/// Does `policy` apply to `c`?
pub fn egress_applies(policy: &EgressPolicy, c: &ContainerRecord) -> bool {
    let source = match policy.source.source_type {
        EgressSourceType::Default => true,
        EgressSourceType::Space => c.space_id() == Some(policy.source.id.as_str()),
        EgressSourceType::App => c.policy_group_id() == Some(policy.source.id.as_str()),
    };
    source && lifecycle_matches(policy.app_lifecycle, c.workload())
}

pub struct Planner {
    cfg: PlannerConfig,
    c2c_logging: Arc<AtomicBool>,
    log: Logger,
}

impl Planner {
    /// `c2c_logging` is shared with whoever may toggle it at runtime.
    pub fn new(cfg: PlannerConfig, c2c_logging: Arc<AtomicBool>, log: &Logger) -> Self {
        Self { cfg, c2c_logging, log: log.clone() }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.cfg
    }

    pub fn c2c_logging(&self) -> bool {
        self.c2c_logging.load(Ordering::Relaxed)
    }

    /// The shared app-to-app chain: mark every source, then allow each
    /// marked flow at its destination, then the ingress router.
    pub fn vpa_rules(
        &self,
        containers: &Containers,
        policies: &[Policy],
        ingress_tag: Option<&str>,
    ) -> RulesWithChain {
        let policies: Vec<&Policy> =
            policies.iter().sorted_by(|a, b| a.sort_key().cmp(&b.sort_key())).collect();

        let c2c_logging = self.c2c_logging();
        let mut marked: BTreeSet<Ipv4Addr> = BTreeSet::new();
        let mut mark_sets = vec![];
        let mut allows = vec![];

        for p in &policies {
            for c in containers.values() {
                let Some(group) = c.policy_group_id() else {
                    continue;
                };
                if group == p.source.id && marked.insert(c.ip) {
                    mark_sets.push(rules::mark_set(c.ip, &p.source.tag, &p.source.id));
                }
                if group == p.destination.id {
                    let d = &p.destination;
                    if c2c_logging {
                        allows.push(rules::mark_allow_log(
                            c.ip,
                            d.protocol,
                            d.ports,
                            &p.source.tag,
                            &d.id,
                            self.cfg.accepted_udp_logs_per_sec,
                        ));
                    }
                    allows.push(rules::mark_allow(
                        c.ip,
                        d.protocol,
                        d.ports,
                        &p.source.tag,
                        &p.source.id,
                        &d.id,
                    ));
                }
            }
        }

        let mut out = vec![];
        if self.cfg.disable_container_network_policy {
            out.push(rules::accept_everything(self.cfg.overlay_network));
        }
        out.extend(mark_sets);
        out.extend(allows);
        if let Some(tag) = ingress_tag {
            for c in containers.values() {
                for port in c.ports() {
                    out.push(rules::mark_allow_no_comment(c.ip, port, tag));
                }
            }
        }

        RulesWithChain {
            chain: Chain {
                table: FILTER,
                parent: "FORWARD",
                base: VPA_PREFIX.to_string(),
                jump_conditions: vec![IptablesRule::default()],
                placement: Placement::First,
            },
            rules: out,
        }
    }

    /// The container's host-input chain.
    pub fn input_rules(&self, c: &ContainerRecord) -> RulesWithChain {
        let mut out = vec![rules::related_established()];
        for svc in &self.cfg.host_tcp_services {
            out.push(rules::input_allow(Protocol::Tcp, *svc));
        }
        for svc in &self.cfg.host_udp_services {
            out.push(rules::input_allow(Protocol::Udp, *svc));
        }
        out.push(rules::default_reject());

        RulesWithChain {
            chain: Chain {
                table: FILTER,
                parent: "INPUT",
                base: container_chain(INPUT_PREFIX, &c.handle),
                jump_conditions: vec![rules::source_condition(c.ip)],
                placement: Placement::First,
            },
            rules: out,
        }
    }

    /// The container's overlay chain: let marked traffic out, keep
    /// established flows, and reject whatever the shared chain did not
    /// accept.
    pub fn overlay_rules(&self, c: &ContainerRecord, ingress_tag: Option<&str>) -> RulesWithChain {
        let mut out = vec![
            rules::overlay_allow_egress(&self.cfg.vtep_name, c.ip),
            rules::overlay_related_established(c.ip),
        ];
        if let Some(tag) = ingress_tag {
            out.push(rules::overlay_tag_accept(c.ip, tag));
        }
        if self.c2c_logging() {
            out.push(rules::overlay_default_reject_log(
                &c.handle,
                c.ip,
                self.cfg.denied_logs_per_sec,
            ));
        }
        out.push(rules::overlay_default_reject(c.ip));

        RulesWithChain {
            chain: Chain {
                table: FILTER,
                parent: "FORWARD",
                base: container_chain(OVERLAY_PREFIX, &c.handle),
                jump_conditions: vec![IptablesRule::default()],
                placement: Placement::Last,
            },
            rules: out,
        }
    }

    /// Everything the policy cycle manages: the shared chain first, then
    /// each container's input and overlay chains in handle order.
    pub fn policy_rule_sets(
        &self,
        containers: &Containers,
        policies: &[Policy],
        ingress_tag: Option<&str>,
    ) -> Vec<RulesWithChain> {
        let mut out = vec![self.vpa_rules(containers, policies, ingress_tag)];
        for c in containers.values() {
            out.push(self.input_rules(c));
            out.push(self.overlay_rules(c, ingress_tag));
        }
        out
    }

    /// The name of the container's accepted-egress log chain, when
    /// egress logging is on.
    pub fn net_out_log_chain(&self, handle: &str) -> Option<String> {
        self.cfg.asg_logging.then(|| container_chain(NET_OUT_LOG_PREFIX, handle))
    }

    /// The rules of the accepted-egress log chain.
    pub fn net_out_log_rules(&self, handle: &str) -> Vec<IptablesRule> {
        vec![
            rules::net_out_log_non_udp(handle),
            rules::net_out_log_udp(handle, self.cfg.accepted_udp_logs_per_sec),
            rules::accept(),
        ]
    }

    /// The name of the chain connections over the outbound rate limit
    /// go to, when they are logged.
    pub fn rate_limit_log_chain(&self, handle: &str) -> Option<String> {
        let oc = &self.cfg.outbound_connections;
        (oc.limit && (oc.logging || oc.dry_run))
            .then(|| container_chain(RATE_LIMIT_LOG_PREFIX, handle))
    }

    /// The rules of the rate limit log chain. A dry run only logs.
    pub fn rate_limit_log_rules(&self, handle: &str) -> Vec<IptablesRule> {
        let mut out = vec![rules::net_out_rate_limit_log(handle, self.cfg.denied_logs_per_sec)];
        if !self.cfg.outbound_connections.dry_run {
            out.push(rules::default_reject());
        }
        out
    }

    /// The container's egress chain.
    pub fn net_out_rules(&self, c: &ContainerRecord, egress: &[EgressPolicy]) -> RulesWithChain {
        let base = container_chain(NET_OUT_PREFIX, &c.handle);
        let log_chain = self.net_out_log_chain(&c.handle);
        let applicable = egress.iter().filter(|p| egress_applies(p, c)).map(|p| &p.destination);

        let mut out = vec![
            rules::related_established(),
            rules::net_out_invalid(),
            rules::overlay_allow_egress(&self.cfg.vtep_name, c.ip),
        ];
        let oc = &self.cfg.outbound_connections;
        if oc.limit {
            let target = self.rate_limit_log_chain(&c.handle);
            out.push(rules::net_out_rate_limit(
                &base,
                oc.rate_per_sec,
                oc.burst,
                oc.expiry_ms(),
                target.as_deref(),
            ));
        }
        let allows = rules::convert_egress(applicable, log_chain.as_deref(), &self.log);
        debug!(self.log, "egress allows"; "handle" => &c.handle, "rules" => allows.len());
        out.extend(allows);
        for net in self.cfg.deny_networks.for_workload(c.workload()) {
            out.push(rules::deny_network(net));
        }
        if self.cfg.asg_logging {
            out.push(rules::net_out_default_reject_log(&c.handle, self.cfg.denied_logs_per_sec));
        }
        out.push(rules::default_reject());

        RulesWithChain {
            chain: Chain {
                table: FILTER,
                parent: "FORWARD",
                base,
                jump_conditions: self
                    .cfg
                    .host_interfaces
                    .iter()
                    .map(|iface| rules::net_out_jump_condition(c.ip, iface))
                    .collect(),
                placement: Placement::First,
            },
            rules: out,
        }
    }
}
