// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! In-memory stand-ins for the kernel and the controller.
//!
//! These are only built for tests and for crates that enable the
//! `test-help` feature.

use crate::client::ClientError;
use crate::client::LeaseSource;
use crate::client::PolicySource;
use crate::iptables::FILTER;
use crate::iptables::Iptables;
use crate::iptables::IptablesError;
use crate::iptables::IptablesRule;
use crate::iptables::NAT;
use crate::netlink::FdbEntry;
use crate::netlink::Link;
use crate::netlink::Neighbor;
use crate::netlink::Netlink;
use crate::netlink::NetlinkError;
use crate::netlink::Route;
use crate::netlink::VxlanSpec;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use trellis_api::Lease;
use trellis_api::MacAddr;
use trellis_api::PoliciesResp;
use trellis_api::Tag;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn builtins(table: &str) -> &'static [&'static str] {
    match table {
        FILTER => &["INPUT", "FORWARD", "OUTPUT"],
        NAT => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        _ => &[],
    }
}

const MUTATIONS: [&str; 7] = [
    "new_chain",
    "delete_chain",
    "clear_chain",
    "delete",
    "bulk_insert",
    "bulk_append",
    "flush_and_restore",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Failure {
    Once,
    Always,
}

#[derive(Debug, Default)]
struct Table {
    chains: BTreeMap<String, Vec<IptablesRule>>,
}

impl Table {
    fn new(name: &str) -> Self {
        let mut t = Self::default();
        for b in builtins(name) {
            t.chains.insert(b.to_string(), vec![]);
        }
        t
    }
}

#[derive(Debug, Default)]
struct IptablesState {
    tables: BTreeMap<String, Table>,
    calls: BTreeMap<String, usize>,
    failures: BTreeMap<String, Failure>,
}

impl IptablesState {
    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_insert_with(|| Table::new(name))
    }

    // Count the call and fire any injected failure.
    fn enter(&mut self, op: &str) -> Result<(), IptablesError> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        match self.failures.get(op).copied() {
            Some(Failure::Once) => {
                self.failures.remove(op);
                Err(IptablesError::Transport(format!("injected failure: {op}")))
            }
            Some(Failure::Always) => {
                Err(IptablesError::Transport(format!("injected failure: {op}")))
            }
            None => Ok(()),
        }
    }

    fn chain(&mut self, table: &str, chain: &str) -> Result<&mut Vec<IptablesRule>, IptablesError> {
        self.table(table)
            .chains
            .get_mut(chain)
            .ok_or_else(|| IptablesError::ChainAbsent(format!("No chain/target/match by that name: {chain}")))
    }

    // Rules may only target built-in targets or chains that exist.
    fn check_targets(&mut self, table: &str, rules: &[IptablesRule]) -> Result<(), IptablesError> {
        let t = self.table(table);
        for r in rules {
            if let Some(target) = r.target() {
                let builtin = target.bytes().all(|b| b.is_ascii_uppercase());
                if !builtin && !t.chains.contains_key(target) {
                    return Err(IptablesError::ChainAbsent(format!(
                        "Couldn't load target `{target}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A packet filter held in memory, with call counting and failure
/// injection.
#[derive(Debug, Default)]
pub struct FakeIptables {
    state: Mutex<IptablesState>,
}

impl FakeIptables {
    pub fn new() -> Self {
        let mut state = IptablesState::default();
        state.table(FILTER);
        Self { state: Mutex::new(state) }
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failures.insert(op.to_string(), Failure::Always);
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: &str) {
        lock(&self.state).failures.insert(op.to_string(), Failure::Once);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// How many times `op` was called, failed calls included.
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.state).calls.get(op).copied().unwrap_or(0)
    }

    /// How many calls that could change state were made.
    pub fn mutations(&self) -> usize {
        let state = lock(&self.state);
        MUTATIONS.iter().map(|op| state.calls.get(*op).copied().unwrap_or(0)).sum()
    }

    /// Append to a chain without counting or checking.
    pub fn append_raw(&self, table: &str, chain: &str, rule: &str) {
        let mut state = lock(&self.state);
        state
            .table(table)
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(IptablesRule::new(rule.split_whitespace()));
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        let mut state = lock(&self.state);
        state
            .table(table)
            .chains
            .get(chain)
            .map(|rs| rs.iter().map(|r| r.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        lock(&self.state).table(table).chains.contains_key(chain)
    }

    pub fn chains(&self, table: &str) -> Vec<String> {
        lock(&self.state).table(table).chains.keys().cloned().collect()
    }
}

#[async_trait]
impl Iptables for FakeIptables {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("new_chain")?;
        let t = state.table(table);
        if t.chains.contains_key(chain) {
            return Err(IptablesError::Transport(format!("Chain already exists: {chain}")));
        }
        t.chains.insert(chain.to_string(), vec![]);
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("delete_chain")?;
        if builtins(table).contains(&chain) {
            return Err(IptablesError::Transport(format!("cannot delete built-in chain {chain}")));
        }
        if !state.chain(table, chain)?.is_empty() {
            return Err(IptablesError::Transport(format!("Directory not empty: {chain}")));
        }
        let t = state.table(table);
        if t.chains.values().flatten().any(|r| r.target() == Some(chain)) {
            return Err(IptablesError::Transport(format!("Too many links: {chain}")));
        }
        t.chains.remove(chain);
        Ok(())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("clear_chain")?;
        state.chain(table, chain)?.clear();
        Ok(())
    }

    async fn exists(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<bool, IptablesError> {
        let mut state = lock(&self.state);
        state.enter("exists")?;
        Ok(state.chain(table, chain).map(|rs| rs.contains(rule)).unwrap_or(false))
    }

    async fn delete(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("delete")?;
        let rules = state.chain(table, chain)?;
        match rules.iter().position(|r| r == rule) {
            Some(i) => {
                rules.remove(i);
                Ok(())
            }
            None => Err(IptablesError::Transport(
                "Bad rule (does a matching rule exist in that chain?)".into(),
            )),
        }
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("bulk_insert")?;
        state.check_targets(table, rules)?;
        let existing = state.chain(table, chain)?;
        let at = pos.saturating_sub(1).min(existing.len());
        for (i, r) in rules.iter().enumerate() {
            existing.insert(at + i, r.clone());
        }
        Ok(())
    }

    async fn bulk_append(
        &self,
        table: &str,
        chain: &str,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("bulk_append")?;
        state.check_targets(table, rules)?;
        state.chain(table, chain)?.extend(rules.iter().cloned());
        Ok(())
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        let mut state = lock(&self.state);
        state.enter("list")?;
        let head = if builtins(table).contains(&chain) {
            format!("-P {chain} ACCEPT")
        } else {
            format!("-N {chain}")
        };
        let rules = state.chain(table, chain)?;
        let mut out = vec![head];
        out.extend(rules.iter().map(|r| format!("-A {chain} {r}")));
        Ok(out)
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        let mut state = lock(&self.state);
        state.enter("list_chains")?;
        Ok(state.table(table).chains.keys().cloned().collect())
    }

    async fn flush_and_restore(&self, dump: &str) -> Result<(), IptablesError> {
        let mut state = lock(&self.state);
        state.enter("flush_and_restore")?;

        let mut current: Option<String> = None;
        let mut staged: BTreeMap<String, Table> = BTreeMap::new();
        for line in dump.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            if let Some(name) = line.strip_prefix('*') {
                staged.insert(name.to_string(), Table::new(name));
                current = Some(name.to_string());
                continue;
            }
            if line == "COMMIT" {
                current = None;
                continue;
            }
            let Some(name) = current.as_deref() else {
                return Err(IptablesError::Parse(format!("line outside a table: {line}")));
            };
            let Some(t) = staged.get_mut(name) else {
                return Err(IptablesError::Parse(format!("unknown table: {name}")));
            };
            if let Some(decl) = line.strip_prefix(':') {
                let Some(chain) = decl.split_whitespace().next() else {
                    return Err(IptablesError::Parse(line.to_string()));
                };
                t.chains.entry(chain.to_string()).or_default();
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let mut words = rest.split_whitespace();
                let Some(chain) = words.next() else {
                    return Err(IptablesError::Parse(line.to_string()));
                };
                let Some(rules) = t.chains.get_mut(chain) else {
                    return Err(IptablesError::ChainAbsent(chain.to_string()));
                };
                rules.push(IptablesRule::new(words));
            } else {
                return Err(IptablesError::Parse(line.to_string()));
            }
        }
        if current.is_some() {
            return Err(IptablesError::Parse("missing COMMIT".into()));
        }

        state.tables.extend(staged);
        Ok(())
    }

    async fn rule_count(&self, table: &str) -> Result<usize, IptablesError> {
        let mut state = lock(&self.state);
        state.enter("rule_count")?;
        Ok(state.table(table).chains.values().map(Vec::len).sum())
    }
}

#[derive(Debug)]
struct FakeLink {
    link: Link,
    addrs: Vec<Ipv4Network>,
    up: bool,
    neighbors: BTreeMap<Ipv4Addr, Neighbor>,
    fdb: BTreeMap<MacAddr, FdbEntry>,
    routes: BTreeMap<Ipv4Network, Route>,
}

#[derive(Debug, Default)]
struct NetlinkState {
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    mutations: usize,
    failures: BTreeSet<String>,
}

impl NetlinkState {
    fn mutate(&mut self, op: &str) -> Result<(), NetlinkError> {
        if self.failures.contains(op) {
            return Err(NetlinkError::Command { cmd: op.to_string(), msg: "injected failure".into() });
        }
        self.mutations += 1;
        Ok(())
    }

    fn link(&mut self, name: &str) -> Result<&mut FakeLink, NetlinkError> {
        self.links.get_mut(name).ok_or_else(|| NetlinkError::LinkNotFound(name.to_string()))
    }

    fn add(&mut self, name: &str, mac: Option<MacAddr>, kind: Option<&str>, addrs: &[Ipv4Network]) {
        self.next_index += 1;
        self.links.insert(
            name.to_string(),
            FakeLink {
                link: Link {
                    name: name.to_string(),
                    index: self.next_index,
                    mac,
                    kind: kind.map(str::to_string),
                },
                addrs: addrs.to_vec(),
                up: false,
                neighbors: BTreeMap::new(),
                fdb: BTreeMap::new(),
                routes: BTreeMap::new(),
            },
        );
    }
}

/// Kernel link state held in memory.
#[derive(Debug, Default)]
pub struct FakeNetlink {
    state: Mutex<NetlinkState>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link without counting it as a mutation.
    pub fn add_link(&self, name: &str, mac: Option<MacAddr>, addrs: &[Ipv4Network]) {
        lock(&self.state).add(name, mac, None, addrs);
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failures.insert(op.to_string());
    }

    pub fn mutations(&self) -> usize {
        lock(&self.state).mutations
    }

    pub fn is_up(&self, name: &str) -> bool {
        lock(&self.state).links.get(name).is_some_and(|l| l.up)
    }
}

#[async_trait]
impl Netlink for FakeNetlink {
    async fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        Ok(lock(&self.state).links.values().map(|l| l.link.clone()).collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        Ok(lock(&self.state).link(name)?.link.clone())
    }

    async fn link_add_vxlan(&self, spec: &VxlanSpec) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("link_add_vxlan")?;
        if state.links.contains_key(&spec.name) {
            return Err(NetlinkError::Command {
                cmd: "link_add_vxlan".into(),
                msg: format!("{} exists", spec.name),
            });
        }
        state.link(&spec.underlay_device)?;
        state.add(&spec.name, Some(spec.mac), Some("vxlan"), &[]);
        Ok(())
    }

    async fn link_del(&self, name: &str) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("link_del")?;
        state.links.remove(name).map(|_| ()).ok_or_else(|| NetlinkError::LinkNotFound(name.to_string()))
    }

    async fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("link_set_up")?;
        state.link(name)?.up = true;
        Ok(())
    }

    async fn addr_add(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("addr_add")?;
        let l = state.link(link)?;
        if !l.addrs.contains(&addr) {
            l.addrs.push(addr);
        }
        Ok(())
    }

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError> {
        Ok(lock(&self.state).link(link)?.addrs.clone())
    }

    async fn route_add(&self, link: &str, route: &Route) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("route_add")?;
        state.link(link)?.routes.insert(route.dst, *route);
        Ok(())
    }

    async fn route_del(&self, link: &str, route: &Route) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("route_del")?;
        state.link(link)?.routes.remove(&route.dst);
        Ok(())
    }

    async fn route_list(&self, link: &str) -> Result<Vec<Route>, NetlinkError> {
        Ok(lock(&self.state).link(link)?.routes.values().copied().collect())
    }

    async fn neighbor_add(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("neighbor_add")?;
        state.link(link)?.neighbors.insert(n.ip, *n);
        Ok(())
    }

    async fn neighbor_del(&self, link: &str, n: &Neighbor) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("neighbor_del")?;
        state.link(link)?.neighbors.remove(&n.ip);
        Ok(())
    }

    async fn neighbor_list(&self, link: &str) -> Result<Vec<Neighbor>, NetlinkError> {
        Ok(lock(&self.state).link(link)?.neighbors.values().copied().collect())
    }

    async fn fdb_add(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("fdb_add")?;
        state.link(link)?.fdb.insert(e.mac, *e);
        Ok(())
    }

    async fn fdb_del(&self, link: &str, e: &FdbEntry) -> Result<(), NetlinkError> {
        let mut state = lock(&self.state);
        state.mutate("fdb_del")?;
        state.link(link)?.fdb.remove(&e.mac);
        Ok(())
    }

    async fn fdb_list(&self, link: &str) -> Result<Vec<FdbEntry>, NetlinkError> {
        Ok(lock(&self.state).link(link)?.fdb.values().copied().collect())
    }
}

fn injected() -> ClientError {
    ClientError::Status { status: 503, body: "injected failure".into() }
}

/// A controller's lease API held in memory.
#[derive(Debug, Default)]
pub struct FakeLeaseSource {
    leases: Mutex<Vec<Lease>>,
    offer: Mutex<Option<Lease>>,
    renewals: Mutex<Vec<Lease>>,
    acquisitions: AtomicUsize,
    fail_next: AtomicBool,
    non_renewable: AtomicBool,
}

impl FakeLeaseSource {
    pub fn new(leases: Vec<Lease>) -> Self {
        Self { leases: Mutex::new(leases), ..Default::default() }
    }

    pub fn set(&self, leases: Vec<Lease>) {
        *lock(&self.leases) = leases;
    }

    /// The lease handed out to an underlay address with none yet.
    pub fn offer(&self, lease: Lease) {
        *lock(&self.offer) = Some(lease);
    }

    /// Fail the next call of any kind.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_non_renewable(&self, v: bool) {
        self.non_renewable.store(v, Ordering::SeqCst);
    }

    pub fn renewals(&self) -> Vec<Lease> {
        lock(&self.renewals).clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ClientError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseSource for FakeLeaseSource {
    async fn acquire_lease(
        &self,
        underlay_ip: Ipv4Addr,
        _single_overlay_ip: bool,
    ) -> Result<Lease, ClientError> {
        self.check()?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut leases = lock(&self.leases);
        if let Some(l) = leases.iter().find(|l| l.underlay_ip == underlay_ip) {
            return Ok(*l);
        }
        let Some(l) = lock(&self.offer).take() else {
            return Err(ClientError::Status { status: 503, body: "no subnets available".into() });
        };
        let l = Lease::new(underlay_ip, l.overlay_subnet);
        leases.push(l);
        Ok(l)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check()?;
        if self.non_renewable.load(Ordering::SeqCst) {
            return Err(ClientError::NonRenewable);
        }
        lock(&self.renewals).push(*lease);
        Ok(())
    }

    async fn routable_leases(&self) -> Result<Vec<Lease>, ClientError> {
        self.check()?;
        Ok(lock(&self.leases).clone())
    }
}

/// A controller's policy API held in memory.
#[derive(Debug, Default)]
pub struct FakePolicySource {
    resp: Mutex<PoliciesResp>,
    tags: Mutex<BTreeMap<(String, String), String>>,
    fail_next: AtomicBool,
}

impl FakePolicySource {
    pub fn new(resp: PoliciesResp) -> Self {
        Self { resp: Mutex::new(resp), ..Default::default() }
    }

    pub fn set(&self, resp: PoliciesResp) {
        *lock(&self.resp) = resp;
    }

    /// Fail the next policy fetch.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The tag issued for group `id`, of any type.
    pub fn tag(&self, id: &str) -> Option<String> {
        lock(&self.tags).iter().find(|((i, _), _)| i == id).map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl PolicySource for FakePolicySource {
    async fn policies(&self) -> Result<PoliciesResp, ClientError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(lock(&self.resp).clone())
    }

    async fn create_or_get_tag(&self, id: &str, tag_type: &str) -> Result<Tag, ClientError> {
        let mut tags = lock(&self.tags);
        let next = format!("{:04x}", tags.len() + 1);
        let tag = tags.entry((id.to_string(), tag_type.to_string())).or_insert(next).clone();
        Ok(Tag { id: id.to_string(), tag_type: tag_type.to_string(), tag })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fake_iptables_enforces_references() {
        let ipt = FakeIptables::new();
        ipt.new_chain(FILTER, "a").await.unwrap();
        let err = ipt
            .bulk_append(FILTER, "FORWARD", &[IptablesRule::new(["-j", "missing"])])
            .await
            .unwrap_err();
        assert!(err.is_chain_absent());

        ipt.bulk_append(FILTER, "FORWARD", &[IptablesRule::new(["-j", "a"])]).await.unwrap();
        assert!(ipt.delete_chain(FILTER, "a").await.is_err());
        ipt.delete(FILTER, "FORWARD", &IptablesRule::new(["-j", "a"])).await.unwrap();
        ipt.delete_chain(FILTER, "a").await.unwrap();
        assert!(ipt.delete_chain(FILTER, "a").await.unwrap_err().is_chain_absent());
    }

    #[tokio::test]
    async fn fake_iptables_restores_dump() {
        let ipt = FakeIptables::new();
        ipt.flush_and_restore(
            "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n\
             :x - [0:0]\n-A FORWARD -j x\nCOMMIT\n",
        )
        .await
        .unwrap();
        assert_eq!(ipt.rules(FILTER, "FORWARD"), vec!["-j x"]);
        assert_eq!(ipt.list(FILTER, "x").await.unwrap(), vec!["-N x"]);
        assert!(ipt.flush_and_restore("*filter\n-A nope -j ACCEPT\nCOMMIT\n").await.is_err());
    }

    #[tokio::test]
    async fn fake_tags_are_stable() {
        let p = FakePolicySource::new(PoliciesResp::default());
        let a = p.create_or_get_tag("g", "app").await.unwrap();
        let b = p.create_or_get_tag("h", "app").await.unwrap();
        assert_ne!(a.tag, b.tag);
        assert_eq!(p.create_or_get_tag("g", "app").await.unwrap(), a);
        assert_eq!(p.tag("g"), Some(a.tag));
    }
}
