// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Operator helpers behind `trellisadm`.

#![deny(unused_must_use)]

use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::time::Duration;
use trellis::iptables::FILTER;
use trellis::iptables::Iptables;
use trellis::iptables::IptablesError;
use trellis::iptables::IptablesRule;
use trellis::iptables::RestoreDump;
use trellis::policy::chain::INPUT_PREFIX;
use trellis::policy::chain::NET_OUT_LOG_PREFIX;
use trellis::policy::chain::NET_OUT_PREFIX;
use trellis::policy::chain::OVERLAY_PREFIX;
use trellis::policy::chain::RATE_LIMIT_LOG_PREFIX;
use trellis::policy::chain::VPA_PREFIX;

/// How many times a reset is attempted before giving up.
pub const RESET_ATTEMPTS: u32 = 15;

pub const MANAGED_PREFIXES: [&str; 6] = [
    VPA_PREFIX,
    INPUT_PREFIX,
    OVERLAY_PREFIX,
    NET_OUT_PREFIX,
    NET_OUT_LOG_PREFIX,
    RATE_LIMIT_LOG_PREFIX,
];

/// The rules of every chain the daemon manages in `filter`, optionally
/// narrowed to chains starting with `prefix`.
pub async fn managed_chains(
    ipt: &dyn Iptables,
    prefix: Option<&str>,
) -> Result<BTreeMap<String, Vec<String>>, IptablesError> {
    let mut out = BTreeMap::new();
    for chain in ipt.list_chains(FILTER).await? {
        if !MANAGED_PREFIXES.iter().any(|p| chain.starts_with(p)) {
            continue;
        }
        if prefix.is_some_and(|p| !chain.starts_with(p)) {
            continue;
        }
        let rules = ipt
            .list(FILTER, &chain)
            .await?
            .iter()
            .filter_map(|l| IptablesRule::from_list_line(&chain, l))
            .map(|r| r.to_string())
            .collect();
        out.insert(chain, rules);
    }
    Ok(out)
}

/// Put `filter` and `nat` back to their built-in chains at `ACCEPT`,
/// retrying up to `attempts` times.
pub async fn reset_iptables(
    ipt: &dyn Iptables,
    attempts: u32,
    backoff: Duration,
    log: &Logger,
) -> Result<(), IptablesError> {
    let dump = RestoreDump::reset().render();
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match ipt.flush_and_restore(&dump).await {
            Ok(()) => {
                info!(log, "packet filter reset"; "attempt" => attempt);
                return Ok(());
            }
            Err(e) => {
                warn!(log, "reset failed"; "attempt" => attempt, "error" => %e);
                last = Some(e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| IptablesError::Transport("no attempts made".into())))
}
