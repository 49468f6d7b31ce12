// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Chain naming and generations.
//!
//! Every managed chain has a stable *base* name. What is actually
//! installed is a *generation*: the base followed by a 16-digit
//! microsecond timestamp. A new generation is built next to the old one
//! and swapped in by its parent jump, so a reader of the packet filter
//! never observes a half-built chain.

use crate::iptables::IptablesRule;
use sha2::Digest;
use sha2::Sha256;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// The shared app-to-app chain.
pub const VPA_PREFIX: &str = "vpa--";

/// Per-container traffic to the host.
pub const INPUT_PREFIX: &str = "in-";

/// Per-container overlay default deny.
pub const OVERLAY_PREFIX: &str = "ov-";

/// Per-container egress to the outside world.
pub const NET_OUT_PREFIX: &str = "no-";

/// Per-container log chain for accepted egress.
pub const NET_OUT_LOG_PREFIX: &str = "nl-";

/// Per-container chain for connections over the outbound rate limit.
pub const RATE_LIMIT_LOG_PREFIX: &str = "rl-";

const TIMESTAMP_DIGITS: usize = 16;

/// The per-container base name: `prefix` plus a short digest of the
/// container handle. Handles are too long for chain names.
pub fn container_chain(prefix: &str, handle: &str) -> String {
    let digest = Sha256::digest(handle.as_bytes());
    format!("{prefix}{}", &hex::encode(digest)[..8])
}

pub fn generation_name(base: &str, ts: i64) -> String {
    format!("{base}{ts:0width$}", width = TIMESTAMP_DIGITS)
}

/// The timestamp of `chain` if it is a generation of `base`.
pub fn generation_of(base: &str, chain: &str) -> Option<i64> {
    let digits = chain.strip_prefix(base)?;
    if digits.len() != TIMESTAMP_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Hands out strictly increasing microsecond timestamps, even when the
/// clock stalls or steps back.
#[derive(Debug, Default)]
pub struct Timestamper {
    last: AtomicI64,
}

impl Timestamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let ts = now.max(last + 1);
            match self.last.compare_exchange_weak(last, ts, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return ts,
                Err(cur) => last = cur,
            }
        }
    }
}

/// Where the parent's jumps go.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Ahead of everything already in the parent.
    First,
    /// Behind everything already in the parent.
    Last,
}

/// A managed chain: where it hangs and under which conditions it is
/// entered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chain {
    pub table: &'static str,
    pub parent: &'static str,
    pub base: String,
    /// Each condition becomes one jump in the parent. An empty rule is
    /// an unconditional jump.
    pub jump_conditions: Vec<IptablesRule>,
    pub placement: Placement,
}

impl Chain {
    /// The parent rules that enter `generation`.
    pub fn jumps(&self, generation: &str) -> Vec<IptablesRule> {
        self.jump_conditions
            .iter()
            .map(|c| c.clone().extend(["--jump", generation]))
            .collect()
    }
}

/// The full desired content of one chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RulesWithChain {
    pub chain: Chain,
    pub rules: Vec<IptablesRule>,
}
