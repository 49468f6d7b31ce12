// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Drive the planner and the enforcer.
//!
//! There are two families of chains, converged independently so that a
//! slow controller answer for one does not hold up the other:
//!
//! * the policy family: the shared app-to-app chain plus every
//!   container's input and overlay chains;
//! * the egress family: every container's net-out chain and, with
//!   logging on, its log chains for accepted and rate limited egress.
//!
//! Each family has its own lock and remembers the rule set it last put
//! in force per chain, so an unchanged rule set costs no packet-filter
//! writes.

use super::chain::INPUT_PREFIX;
use super::chain::NET_OUT_LOG_PREFIX;
use super::chain::NET_OUT_PREFIX;
use super::chain::OVERLAY_PREFIX;
use super::chain::RATE_LIMIT_LOG_PREFIX;
use super::chain::RulesWithChain;
use super::chain::VPA_PREFIX;
use super::chain::container_chain;
use super::enforcer::EnforceError;
use super::enforcer::Enforcer;
use super::planner::INGRESS_TAG_ID;
use super::planner::INGRESS_TAG_TYPE;
use super::planner::Planner;
use crate::client::ClientError;
use crate::client::PolicySource;
use crate::datastore::Containers;
use crate::datastore::DatastoreError;
use crate::datastore::Store;
use crate::iptables::FILTER;
use crate::iptables::IptablesError;
use crate::metrics::Metrics;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("reading containers: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("fetching from controller: {0}")]
    Client(#[from] ClientError),

    #[error("{0}")]
    Enforce(#[from] EnforceError),

    #[error("cleaning orphaned chains: {0}")]
    Cleanup(#[from] IptablesError),

    #[error("{} chains failed, first: {}", .0.len(), .0[0])]
    Partial(Vec<EnforceError>),
}

#[derive(Debug)]
struct Applied {
    rules: RulesWithChain,
    generation: String,
}

/// Last-applied state, keyed by chain base name.
type AppliedMap = BTreeMap<String, Applied>;

pub struct PolicyConverger {
    planner: Planner,
    enforcer: Enforcer,
    datastore: Arc<Store>,
    policies: Arc<dyn PolicySource>,
    metrics: Arc<Metrics>,
    policy_state: Mutex<AppliedMap>,
    asg_state: Mutex<AppliedMap>,
    log: Logger,
}

impl PolicyConverger {
    pub fn new(
        planner: Planner,
        enforcer: Enforcer,
        datastore: Arc<Store>,
        policies: Arc<dyn PolicySource>,
        metrics: Arc<Metrics>,
        log: &Logger,
    ) -> Self {
        Self {
            planner,
            enforcer,
            datastore,
            policies,
            metrics,
            policy_state: Mutex::new(AppliedMap::new()),
            asg_state: Mutex::new(AppliedMap::new()),
            log: log.clone(),
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// One policy cycle, with metrics. For the poller.
    pub async fn poll_policies(&self) -> Result<(), ConvergeError> {
        let res = self.metrics.policy_poll_time.time(self.do_policy_cycle()).await;
        if res.is_err() {
            self.metrics.policy_errors.incr();
        }
        res
    }

    /// One egress cycle over every container, with metrics. For the
    /// poller.
    pub async fn poll_asgs(&self) -> Result<(), ConvergeError> {
        let res = self.metrics.asg_poll_time.time(self.do_asg_cycle()).await;
        if res.is_err() {
            self.metrics.asg_errors.incr();
        }
        res
    }

    /// Bring the policy family in line with the current containers and
    /// policies, then remove chains of containers that are gone.
    pub async fn do_policy_cycle(&self) -> Result<(), ConvergeError> {
        let mut state = self.policy_state.lock().await;

        let containers = self.datastore.read_all_async().await?;
        let resp = self.policies.policies().await?;
        let ingress_tag = if self.planner.config().enable_overlay_ingress_rules {
            Some(self.policies.create_or_get_tag(INGRESS_TAG_ID, INGRESS_TAG_TYPE).await?.tag)
        } else {
            None
        };

        let desired =
            self.planner.policy_rule_sets(&containers, &resp.policies, ingress_tag.as_deref());

        let start = Instant::now();
        let mut cleanup_errs = vec![];
        for rs in desired.iter() {
            match self.apply(&mut state, rs).await {
                Ok(()) => {}
                Err(e) if e.installed().is_some() => cleanup_errs.push(e),
                Err(e) => {
                    self.metrics.policy_enforce_time.set(start.elapsed());
                    return Err(e.into());
                }
            }
        }
        self.metrics.policy_enforce_time.set(start.elapsed());

        let bases: BTreeSet<&str> = desired.iter().map(|rs| rs.chain.base.as_str()).collect();
        state.retain(|base, _| bases.contains(base.as_str()));
        let in_force: BTreeSet<String> = state.values().map(|a| a.generation.clone()).collect();
        for prefix in [VPA_PREFIX, INPUT_PREFIX, OVERLAY_PREFIX] {
            self.enforcer.clean_chains_matching(FILTER, prefix, &in_force).await?;
        }

        debug!(self.log, "policy cycle complete";
            "containers" => containers.len(), "policies" => resp.policies.len());
        partial(cleanup_errs)
    }

    /// Bring every container's egress chains in line, then remove the
    /// egress chains of containers that are gone.
    pub async fn do_asg_cycle(&self) -> Result<(), ConvergeError> {
        self.sync_asgs(None).await
    }

    /// Bring only the named containers' egress chains in line. Handles
    /// not in the datastore are ignored and nothing is cleaned up.
    pub async fn sync_asgs_for_containers(&self, handles: &[String]) -> Result<(), ConvergeError> {
        self.sync_asgs(Some(handles)).await
    }

    async fn sync_asgs(&self, only: Option<&[String]>) -> Result<(), ConvergeError> {
        let mut state = self.asg_state.lock().await;

        let mut containers = self.datastore.read_all_async().await?;
        if let Some(handles) = only {
            containers.retain(|h, _| handles.contains(h));
        }
        let resp = self.policies.policies().await?;

        let start = Instant::now();
        let mut errs = vec![];
        for c in containers.values() {
            if let Err(e) = self.sync_container_asgs(&mut state, c, &resp.egress_policies).await {
                error!(self.log, "converging egress"; "handle" => &c.handle, "error" => %e);
                errs.push(e);
            }
        }
        self.metrics.asg_enforce_time.set(start.elapsed());

        if only.is_none() {
            self.metrics.asg_cleanup_time.time(self.cleanup_asgs(&mut state, &containers)).await?;
        }
        partial(errs)
    }

    async fn sync_container_asgs(
        &self,
        state: &mut AppliedMap,
        c: &trellis_api::ContainerRecord,
        egress: &[trellis_api::EgressPolicy],
    ) -> Result<(), EnforceError> {
        if let Some(nl) = self.planner.net_out_log_chain(&c.handle) {
            let rules = self.planner.net_out_log_rules(&c.handle);
            if self.enforcer.ensure_chain(FILTER, &nl, &rules).await? {
                debug!(self.log, "created log chain"; "chain" => &nl);
            }
        }
        if let Some(rl) = self.planner.rate_limit_log_chain(&c.handle) {
            let rules = self.planner.rate_limit_log_rules(&c.handle);
            if self.enforcer.ensure_chain(FILTER, &rl, &rules).await? {
                debug!(self.log, "created rate limit log chain"; "chain" => &rl);
            }
        }

        let rs = self.planner.net_out_rules(c, egress);
        let changed = state.get(&rs.chain.base).is_none_or(|a| a.rules != rs);
        let res = self.apply(state, &rs).await;
        if changed && res.as_ref().map_or_else(|e| e.installed().is_some(), |_| true) {
            if let Some(log_config) = c.log_config() {
                info!(self.log, "security group rules updated";
                    "handle" => &c.handle, "log_config" => %log_config);
            }
        }
        res
    }

    // Drop state and chains of containers no longer present.
    async fn cleanup_asgs(
        &self,
        state: &mut AppliedMap,
        containers: &Containers,
    ) -> Result<(), IptablesError> {
        let bases: BTreeSet<String> =
            containers.keys().map(|h| container_chain(NET_OUT_PREFIX, h)).collect();
        state.retain(|base, _| bases.contains(base));
        let in_force: BTreeSet<String> = state.values().map(|a| a.generation.clone()).collect();
        self.enforcer.clean_chains_matching(FILTER, NET_OUT_PREFIX, &in_force).await?;

        let log_chains: BTreeSet<String> =
            containers.keys().filter_map(|h| self.planner.net_out_log_chain(h)).collect();
        self.enforcer.clean_chains_matching(FILTER, NET_OUT_LOG_PREFIX, &log_chains).await?;

        let rl_chains: BTreeSet<String> =
            containers.keys().filter_map(|h| self.planner.rate_limit_log_chain(h)).collect();
        self.enforcer.clean_chains_matching(FILTER, RATE_LIMIT_LOG_PREFIX, &rl_chains).await?;
        Ok(())
    }

    /// Delete the egress chains of `handle`, whether or not it is still
    /// in the datastore.
    pub async fn cleanup_orphaned_asg_chains(&self, handle: &str) -> Result<(), ConvergeError> {
        let mut state = self.asg_state.lock().await;
        let base = container_chain(NET_OUT_PREFIX, handle);
        state.remove(&base);
        let none = BTreeSet::new();
        let mut deleted = self.enforcer.clean_chains_matching(FILTER, &base, &none).await?;
        let nl = container_chain(NET_OUT_LOG_PREFIX, handle);
        deleted.extend(self.enforcer.clean_chains_matching(FILTER, &nl, &none).await?);
        let rl = container_chain(RATE_LIMIT_LOG_PREFIX, handle);
        deleted.extend(self.enforcer.clean_chains_matching(FILTER, &rl, &none).await?);
        info!(self.log, "cleaned up egress chains"; "handle" => handle, "chains" => deleted.len());
        Ok(())
    }

    // Enforce `rs` unless it is what we last put in force.
    async fn apply(&self, state: &mut AppliedMap, rs: &RulesWithChain) -> Result<(), EnforceError> {
        if state.get(&rs.chain.base).is_some_and(|a| a.rules == *rs) {
            return Ok(());
        }
        let res = self.enforcer.enforce(rs).await;
        let generation = match &res {
            Ok(g) => g.clone(),
            Err(e) => match e.installed() {
                Some(g) => {
                    warn!(self.log, "installed chain but cleanup failed";
                        "chain" => g, "error" => %e);
                    g.to_string()
                }
                None => return res.map(|_| ()),
            },
        };
        state.insert(rs.chain.base.clone(), Applied { rules: rs.clone(), generation });
        res.map(|_| ())
    }
}

fn partial(mut errs: Vec<EnforceError>) -> Result<(), ConvergeError> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(ConvergeError::Enforce(errs.remove(0))),
        _ => Err(ConvergeError::Partial(errs)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::FakeIptables;
    use crate::fakes::FakePolicySource;
    use crate::log::null_logger;
    use crate::policy::planner::OutConn;
    use crate::policy::planner::PlannerConfig;
    use crate::policy::planner::test::config;
    use crate::policy::planner::test::container;
    use crate::policy::planner::test::policy;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use trellis_api::AppLifecycle;
    use trellis_api::EgressDestination;
    use trellis_api::EgressPolicy;
    use trellis_api::EgressSource;
    use trellis_api::EgressSourceType;
    use trellis_api::IpRange;
    use trellis_api::PoliciesResp;
    use trellis_api::Protocol;
    use trellis_api::container::META_LOG_CONFIG;

    struct Harness {
        _dir: TempDir,
        ipt: Arc<FakeIptables>,
        store: Arc<Store>,
        source: Arc<FakePolicySource>,
        metrics: Arc<Metrics>,
        c2c: Arc<AtomicBool>,
        conv: PolicyConverger,
    }

    fn harness(cfg: PlannerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log = null_logger();
        let ipt = Arc::new(FakeIptables::new());
        let store = Arc::new(Store::new(dir.path().join("store.json")));
        let source = Arc::new(FakePolicySource::new(PoliciesResp::default()));
        let metrics = Metrics::new();
        let c2c = Arc::new(AtomicBool::new(false));
        let conv = PolicyConverger::new(
            Planner::new(cfg, c2c.clone(), &log),
            Enforcer::new(ipt.clone(), &log),
            store.clone(),
            source.clone(),
            metrics.clone(),
            &log,
        );
        Harness { _dir: dir, ipt, store, source, metrics, c2c, conv }
    }

    fn put(store: &Store, c: trellis_api::ContainerRecord) {
        store.add(&c.handle, c.ip, c.metadata).unwrap();
    }

    fn egress_all(start: &str) -> EgressPolicy {
        EgressPolicy {
            source: EgressSource { id: String::new(), source_type: EgressSourceType::Default },
            destination: EgressDestination {
                protocol: Protocol::All,
                ips: vec![IpRange { start: start.parse().unwrap(), end: start.parse().unwrap() }],
                ports: vec![],
                icmp_type: -1,
                icmp_code: -1,
            },
            app_lifecycle: AppLifecycle::All,
        }
    }

    fn prefixed(ipt: &FakeIptables, prefix: &str) -> Vec<String> {
        ipt.chains(FILTER).into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    #[tokio::test]
    async fn policy_cycle_installs_family() {
        let h = harness(config());
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        put(&h.store, container("b1", "10.255.8.2", "app-b"));
        h.source.set(PoliciesResp {
            policies: vec![policy(("app-a", "0001"), ("app-b", "0002"), 8080)],
            egress_policies: vec![],
        });

        h.conv.poll_policies().await.unwrap();

        assert_eq!(prefixed(&h.ipt, VPA_PREFIX).len(), 1);
        assert_eq!(prefixed(&h.ipt, INPUT_PREFIX).len(), 2);
        assert_eq!(prefixed(&h.ipt, OVERLAY_PREFIX).len(), 2);
        let vpa = &prefixed(&h.ipt, VPA_PREFIX)[0];
        assert_eq!(h.ipt.rules(FILTER, vpa).len(), 2);
        let forward = h.ipt.rules(FILTER, "FORWARD");
        assert_eq!(forward[0], format!("--jump {vpa}"));
        assert!(forward.last().unwrap().contains("ov-"));
        assert_eq!(h.metrics.policy_errors.get(), 0);
    }

    #[tokio::test]
    async fn unchanged_cycle_writes_nothing() {
        let h = harness(config());
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        h.source.set(PoliciesResp {
            policies: vec![policy(("app-a", "0001"), ("app-a", "0001"), 8080)],
            egress_policies: vec![egress_all("8.8.8.8")],
        });
        h.conv.do_policy_cycle().await.unwrap();
        h.conv.do_asg_cycle().await.unwrap();

        let before = h.ipt.mutations();
        h.conv.do_policy_cycle().await.unwrap();
        h.conv.do_asg_cycle().await.unwrap();
        assert_eq!(h.ipt.mutations(), before);
        assert_eq!(h.ipt.calls("new_chain"), 4);
    }

    #[tokio::test]
    async fn logging_toggle_rebuilds_chains() {
        let h = harness(config());
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        h.conv.do_policy_cycle().await.unwrap();
        let ov = prefixed(&h.ipt, OVERLAY_PREFIX);

        h.c2c.store(true, Ordering::Relaxed);
        h.conv.do_policy_cycle().await.unwrap();
        let ov2 = prefixed(&h.ipt, OVERLAY_PREFIX);
        assert_eq!(ov2.len(), 1);
        assert_ne!(ov, ov2);
        assert!(h.ipt.rules(FILTER, &ov2[0]).iter().any(|r| r.contains("DENY_C2C_a1")));
    }

    #[tokio::test]
    async fn departed_containers_are_cleaned() {
        let mut cfg = config();
        cfg.asg_logging = true;
        cfg.outbound_connections = OutConn { limit: true, logging: true, ..OutConn::default() };
        let h = harness(cfg);
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        put(&h.store, container("b1", "10.255.8.2", "app-b"));
        h.source.set(PoliciesResp { policies: vec![], egress_policies: vec![egress_all("8.8.8.8")] });
        h.conv.do_policy_cycle().await.unwrap();
        h.conv.do_asg_cycle().await.unwrap();
        assert_eq!(prefixed(&h.ipt, NET_OUT_LOG_PREFIX).len(), 2);
        assert_eq!(prefixed(&h.ipt, RATE_LIMIT_LOG_PREFIX).len(), 2);

        h.store.delete("b1").unwrap();
        h.conv.do_policy_cycle().await.unwrap();
        h.conv.do_asg_cycle().await.unwrap();

        for prefix in
            [INPUT_PREFIX, OVERLAY_PREFIX, NET_OUT_PREFIX, NET_OUT_LOG_PREFIX, RATE_LIMIT_LOG_PREFIX]
        {
            let left = prefixed(&h.ipt, prefix);
            assert_eq!(left.len(), 1, "{prefix}: {left:?}");
            assert!(left[0].starts_with(&container_chain(prefix, "a1")));
        }
        let forward = h.ipt.rules(FILTER, "FORWARD").join("\n");
        assert!(!forward.contains(&container_chain(NET_OUT_PREFIX, "b1")));
    }

    #[tokio::test]
    async fn rate_limited_egress_goes_to_its_log_chain() {
        let mut cfg = config();
        cfg.outbound_connections = OutConn { limit: true, logging: true, ..OutConn::default() };
        let h = harness(cfg);
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        h.conv.do_asg_cycle().await.unwrap();

        let rl = container_chain(RATE_LIMIT_LOG_PREFIX, "a1");
        let logs = h.ipt.rules(FILTER, &rl);
        assert_eq!(logs.len(), 2);
        assert!(logs[0].contains("DENY_ORL_a1"));
        let no = &prefixed(&h.ipt, NET_OUT_PREFIX)[0];
        let rules = h.ipt.rules(FILTER, no);
        assert!(rules.iter().any(|r| r.contains("hashlimit") && r.ends_with(&format!("--jump {rl}"))));
        assert!(rules.iter().any(|r| r.contains("--state INVALID --jump DROP")));

        h.conv.cleanup_orphaned_asg_chains("a1").await.unwrap();
        assert!(!h.ipt.has_chain(FILTER, &rl));
    }

    #[tokio::test]
    async fn targeted_sync_skips_cleanup() {
        let h = harness(config());
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        put(&h.store, container("b1", "10.255.8.2", "app-b"));
        h.conv.do_asg_cycle().await.unwrap();

        h.store.delete("b1").unwrap();
        put(&h.store, container("c1", "10.255.9.2", "app-c"));
        h.conv
            .sync_asgs_for_containers(&["c1".to_string(), "missing".to_string()])
            .await
            .unwrap();

        let no = prefixed(&h.ipt, NET_OUT_PREFIX);
        assert_eq!(no.len(), 3);

        h.conv.cleanup_orphaned_asg_chains("b1").await.unwrap();
        assert_eq!(prefixed(&h.ipt, NET_OUT_PREFIX).len(), 2);
    }

    #[tokio::test]
    async fn controller_failure_fails_cycle_and_counts() {
        let h = harness(config());
        h.source.fail_next();
        let err = h.conv.poll_policies().await.unwrap_err();
        assert!(matches!(err, ConvergeError::Client(_)));
        assert_eq!(h.metrics.policy_errors.get(), 1);
        assert_eq!(h.ipt.mutations(), 0);
    }

    #[tokio::test]
    async fn egress_cycle_continues_past_failures() {
        let h = harness(config());
        put(&h.store, container("a1", "10.255.7.2", "app-a"));
        put(&h.store, container("b1", "10.255.8.2", "app-b"));
        h.ipt.fail_next("bulk_insert");

        let err = h.conv.poll_asgs().await.unwrap_err();
        assert!(matches!(err, ConvergeError::Enforce(EnforceError::Jump { .. })));
        assert_eq!(prefixed(&h.ipt, NET_OUT_PREFIX).len(), 1);
        assert_eq!(h.metrics.asg_errors.get(), 1);

        h.conv.poll_asgs().await.unwrap();
        assert_eq!(prefixed(&h.ipt, NET_OUT_PREFIX).len(), 2);
    }

    #[tokio::test]
    async fn ingress_tag_is_fetched_when_enabled() {
        let mut cfg = config();
        cfg.enable_overlay_ingress_rules = true;
        let h = harness(cfg);
        put(
            &h.store,
            container("a1", "10.255.7.2", "app-a")
                .with_meta(trellis_api::container::META_PORTS, "8080")
                .with_meta(META_LOG_CONFIG, serde_json::json!({"guid": "app-a"})),
        );
        h.conv.do_policy_cycle().await.unwrap();

        let tag = h.source.tag(INGRESS_TAG_ID).unwrap();
        let vpa = &prefixed(&h.ipt, VPA_PREFIX)[0];
        assert_eq!(
            h.ipt.rules(FILTER, vpa),
            vec![format!("-d 10.255.7.2 -p tcp -m tcp --dport 8080 -m mark --mark 0x{tag} --jump ACCEPT")]
        );
    }
}
