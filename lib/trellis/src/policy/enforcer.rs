// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Install rule sets as chain generations.
//!
//! Enforcing a [`RulesWithChain`] never edits a live chain. A fresh
//! generation is created and filled, the parent's jumps to it are
//! added, and only then are older generations of the same base
//! unhooked and deleted. Any failure before the jumps land removes the
//! new generation again and leaves the old one in force.

use super::chain::RulesWithChain;
use super::chain::Timestamper;
use super::chain::generation_name;
use super::chain::generation_of;
use super::chain::Placement;
use crate::iptables::Iptables;
use crate::iptables::IptablesError;
use crate::iptables::IptablesRule;
use crate::iptables::ignore_absent;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("creating chain {chain}: {source}")]
    Create {
        chain: String,
        #[source]
        source: IptablesError,
    },

    #[error("populating chain {chain}: {source}")]
    Populate {
        chain: String,
        #[source]
        source: IptablesError,
    },

    #[error("jumping from {parent} to {chain}: {source}")]
    Jump {
        parent: &'static str,
        chain: String,
        #[source]
        source: IptablesError,
    },

    /// The new generation is in force; removing an older one failed.
    #[error("cleaning up after installing {chain}: {source}")]
    Cleanup {
        chain: String,
        #[source]
        source: IptablesError,
    },

    #[error("{0}")]
    Iptables(#[from] IptablesError),
}

impl EnforceError {
    /// The generation that is in force despite the error, if any.
    pub fn installed(&self) -> Option<&str> {
        match self {
            Self::Cleanup { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

pub struct Enforcer {
    iptables: Arc<dyn Iptables>,
    timestamper: Timestamper,
    log: Logger,
}

impl Enforcer {
    pub fn new(iptables: Arc<dyn Iptables>, log: &Logger) -> Self {
        Self { iptables, timestamper: Timestamper::new(), log: log.clone() }
    }

    pub fn iptables(&self) -> &Arc<dyn Iptables> {
        &self.iptables
    }

    /// Install `rs` as a new generation and retire the older ones.
    /// Returns the name of the generation now in force.
    pub async fn enforce(&self, rs: &RulesWithChain) -> Result<String, EnforceError> {
        let chain = &rs.chain;
        let ipt = &self.iptables;
        let ts = self.timestamper.next();
        let new = generation_name(&chain.base, ts);

        ipt.new_chain(chain.table, &new)
            .await
            .map_err(|source| EnforceError::Create { chain: new.clone(), source })?;

        if let Err(source) = ipt.bulk_append(chain.table, &new, &rs.rules).await {
            self.discard(chain.table, &new).await;
            return Err(EnforceError::Populate { chain: new, source });
        }

        let jumps = chain.jumps(&new);
        let res = match chain.placement {
            Placement::First => ipt.bulk_insert(chain.table, chain.parent, 1, &jumps).await,
            Placement::Last => ipt.bulk_append(chain.table, chain.parent, &jumps).await,
        };
        if let Err(source) = res {
            self.unhook(chain.table, chain.parent, &jumps).await;
            self.discard(chain.table, &new).await;
            return Err(EnforceError::Jump { parent: chain.parent, chain: new, source });
        }

        debug!(self.log, "installed chain";
            "chain" => &new, "parent" => chain.parent, "rules" => rs.rules.len());

        let keep: BTreeSet<&str> = rs.rules.iter().filter_map(IptablesRule::goto_target).collect();
        if let Err(source) = self.retire_older(rs, ts, &keep).await {
            return Err(EnforceError::Cleanup { chain: new, source });
        }
        Ok(new)
    }

    // Best effort removal of any jumps that landed before a failed
    // insert.
    async fn unhook(&self, table: &str, parent: &str, jumps: &[IptablesRule]) {
        let ipt = &self.iptables;
        for j in jumps {
            match ipt.exists(table, parent, j).await {
                Ok(false) => {}
                Ok(true) => {
                    if let Err(e) = ipt.delete(table, parent, j).await {
                        warn!(self.log, "removing stranded jump";
                            "parent" => parent, "rule" => %j, "error" => %e);
                    }
                }
                Err(e) => {
                    warn!(self.log, "checking for stranded jump";
                        "parent" => parent, "rule" => %j, "error" => %e);
                }
            }
        }
    }

    // Best effort removal of a generation that never went live.
    async fn discard(&self, table: &str, chain: &str) {
        let ipt = &self.iptables;
        if let Err(e) = ipt.clear_chain(table, chain).await {
            warn!(self.log, "clearing abandoned chain"; "chain" => chain, "error" => %e);
        }
        if let Err(e) = ipt.delete_chain(table, chain).await {
            warn!(self.log, "deleting abandoned chain"; "chain" => chain, "error" => %e);
        }
    }

    // Unhook and delete every generation of `rs`'s base older than `ts`
    // that the parent still jumps to.
    async fn retire_older(
        &self,
        rs: &RulesWithChain,
        ts: i64,
        keep: &BTreeSet<&str>,
    ) -> Result<(), IptablesError> {
        let chain = &rs.chain;
        let mut old: BTreeMap<String, Vec<IptablesRule>> = BTreeMap::new();
        for line in self.iptables.list(chain.table, chain.parent).await? {
            let Some(rule) = IptablesRule::from_list_line(chain.parent, &line) else {
                continue;
            };
            let Some(target) = rule.target() else {
                continue;
            };
            if generation_of(&chain.base, target).is_some_and(|t| t < ts) {
                old.entry(target.to_string()).or_default().push(rule);
            }
        }

        for (name, jumps) in old {
            for j in &jumps {
                ignore_absent(self.iptables.delete(chain.table, chain.parent, j).await)?;
            }
            self.delete_with_targets(chain.table, &name, keep).await?;
            info!(self.log, "retired chain"; "chain" => name);
        }
        Ok(())
    }

    // Delete `chain` and then every chain it goes to that is not in
    // `keep`. Chains already gone are fine.
    async fn delete_with_targets(
        &self,
        table: &str,
        chain: &str,
        keep: &BTreeSet<&str>,
    ) -> Result<(), IptablesError> {
        let lines = match self.iptables.list(table, chain).await {
            Ok(lines) => lines,
            Err(e) if e.is_chain_absent() => return Ok(()),
            Err(e) => return Err(e),
        };
        let targets: BTreeSet<String> = lines
            .iter()
            .filter_map(|l| IptablesRule::from_list_line(chain, l))
            .filter_map(|r| r.goto_target().map(str::to_string))
            .filter(|t| !keep.contains(t.as_str()))
            .collect();

        ignore_absent(self.iptables.clear_chain(table, chain).await)?;
        ignore_absent(self.iptables.delete_chain(table, chain).await)?;
        for t in targets {
            ignore_absent(self.iptables.clear_chain(table, &t).await)?;
            ignore_absent(self.iptables.delete_chain(table, &t).await)?;
        }
        Ok(())
    }

    /// Create `chain` holding `rules` unless it already exists. Returns
    /// whether it was created.
    pub async fn ensure_chain(
        &self,
        table: &str,
        chain: &str,
        rules: &[IptablesRule],
    ) -> Result<bool, IptablesError> {
        if self.iptables.chain_exists(table, chain).await? {
            return Ok(false);
        }
        self.iptables.new_chain(table, chain).await?;
        if let Err(e) = self.iptables.bulk_append(table, chain, rules).await {
            self.discard(table, chain).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Delete every chain of `table` whose name starts with `prefix` and
    /// is not in `desired`, along with any rule elsewhere in the table
    /// that jumps or goes to it. Returns the chains deleted.
    pub async fn clean_chains_matching(
        &self,
        table: &str,
        prefix: &str,
        desired: &BTreeSet<String>,
    ) -> Result<Vec<String>, IptablesError> {
        let chains = self.iptables.list_chains(table).await?;
        let doomed: BTreeSet<&str> = chains
            .iter()
            .map(String::as_str)
            .filter(|c| c.starts_with(prefix) && !desired.contains(*c))
            .collect();
        if doomed.is_empty() {
            return Ok(vec![]);
        }

        // Unhook first: a referenced chain cannot be deleted.
        for c in chains.iter().filter(|c| !doomed.contains(c.as_str())) {
            let lines = match self.iptables.list(table, c).await {
                Ok(lines) => lines,
                Err(e) if e.is_chain_absent() => continue,
                Err(e) => return Err(e),
            };
            for rule in lines.iter().filter_map(|l| IptablesRule::from_list_line(c, l)) {
                if rule.target().is_some_and(|t| doomed.contains(t)) {
                    ignore_absent(self.iptables.delete(table, c, &rule).await)?;
                }
            }
        }

        // Referrers before the chains they go to.
        for c in &doomed {
            ignore_absent(self.iptables.clear_chain(table, c).await)?;
        }
        let mut deleted = vec![];
        for c in doomed {
            ignore_absent(self.iptables.delete_chain(table, c).await)?;
            info!(self.log, "deleted orphaned chain"; "chain" => c);
            deleted.push(c.to_string());
        }
        Ok(deleted)
    }
}
