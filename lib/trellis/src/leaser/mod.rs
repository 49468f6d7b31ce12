// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Subnet allocation on the controller.
//!
//! The overlay network is cut into two disjoint pools:
//!
//! * the block pool: every `/B` subnet of the overlay network except the
//!   one at offset zero, for cells that host many containers;
//! * the single-IP pool: every `/32` inside that first `/B` block except
//!   its network address, for cells that need exactly one address.
//!
//! The lease store ([`store`]) draws from these uniformly at random.

pub mod store;

use ipnetwork::Ipv4Network;
use rand::Rng;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use thiserror::Error;

pub use store::LeaseError;
pub use store::LeaseRecord;
pub use store::LeaseStore;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PoolError {
    #[error("subnet prefix length /{subnet} must be longer than the overlay prefix /{overlay}")]
    PrefixOrder { overlay: u8, subnet: u8 },

    #[error("subnet prefix length /{0} is out of range")]
    BadPrefix(u8),
}

/// Which pool a lease is drawn from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolKind {
    Block,
    Single,
}

impl PoolKind {
    pub fn from_single(single: bool) -> Self {
        if single { Self::Single } else { Self::Block }
    }
}

#[derive(Clone, Debug)]
pub struct CidrPool {
    network: Ipv4Network,
    subnet_prefix: u8,
    blocks: BTreeSet<Ipv4Network>,
    singles: BTreeSet<Ipv4Network>,
}

fn add(base: Ipv4Addr, offset: u64) -> Ipv4Addr {
    Ipv4Addr::from((u64::from(u32::from(base)) + offset) as u32)
}

impl CidrPool {
    pub fn new(network: Ipv4Network, subnet_prefix: u8) -> Result<Self, PoolError> {
        if subnet_prefix > 32 {
            return Err(PoolError::BadPrefix(subnet_prefix));
        }
        if subnet_prefix <= network.prefix() {
            return Err(PoolError::PrefixOrder {
                overlay: network.prefix(),
                subnet: subnet_prefix,
            });
        }

        let base = network.network();
        let full: u64 = 1 << (32 - u32::from(network.prefix()));
        let block: u64 = 1 << (32 - u32::from(subnet_prefix));

        let mut blocks = BTreeSet::new();
        let mut off = block;
        while off < full {
            // Offsets are multiples of the block size, so the prefix is
            // always valid for the address.
            if let Ok(n) = Ipv4Network::new(add(base, off), subnet_prefix) {
                blocks.insert(n);
            }
            off += block;
        }

        let mut singles = BTreeSet::new();
        for off in 1..block {
            if let Ok(n) = Ipv4Network::new(add(base, off), 32) {
                singles.insert(n);
            }
        }

        Ok(Self { network, subnet_prefix, blocks, singles })
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    pub fn subnet_prefix(&self) -> u8 {
        self.subnet_prefix
    }

    pub fn pool(&self, kind: PoolKind) -> &BTreeSet<Ipv4Network> {
        match kind {
            PoolKind::Block => &self.blocks,
            PoolKind::Single => &self.singles,
        }
    }

    pub fn block_pool_size(&self) -> usize {
        self.blocks.len()
    }

    pub fn single_pool_size(&self) -> usize {
        self.singles.len()
    }

    pub fn is_member(&self, subnet: &Ipv4Network) -> bool {
        self.blocks.contains(subnet) || self.singles.contains(subnet)
    }

    /// Which pool `subnet` belongs to, if any.
    pub fn kind_of(&self, subnet: &Ipv4Network) -> Option<PoolKind> {
        if self.blocks.contains(subnet) {
            Some(PoolKind::Block)
        } else if self.singles.contains(subnet) {
            Some(PoolKind::Single)
        } else {
            None
        }
    }

    /// Pick a member of `kind` not in `taken`, uniformly at random.
    pub fn available(
        &self,
        kind: PoolKind,
        taken: &BTreeSet<Ipv4Network>,
    ) -> Option<Ipv4Network> {
        let pool = self.pool(kind);
        let used = taken.iter().filter(|s| pool.contains(s)).count();
        let free = pool.len() - used;
        if free == 0 {
            return None;
        }
        let i = rand::rng().random_range(0..free);
        pool.iter().filter(|s| !taken.contains(s)).nth(i).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn block_pool_skips_first_block() {
        let pool = CidrPool::new(net("10.255.0.0/16"), 24).unwrap();
        assert_eq!(pool.block_pool_size(), 255);
        assert!(!pool.is_member(&net("10.255.0.0/24")));
        assert!(pool.is_member(&net("10.255.1.0/24")));
        assert!(pool.is_member(&net("10.255.255.0/24")));
        assert!(!pool.is_member(&net("10.254.1.0/24")));
        assert!(!pool.is_member(&net("10.255.1.0/25")));
    }

    #[test]
    fn single_pool_lives_in_first_block() {
        let pool = CidrPool::new(net("10.255.0.0/16"), 24).unwrap();
        assert_eq!(pool.single_pool_size(), 255);
        assert!(!pool.is_member(&net("10.255.0.0/32")));
        assert!(pool.is_member(&net("10.255.0.1/32")));
        assert!(pool.is_member(&net("10.255.0.255/32")));
        assert_eq!(pool.kind_of(&net("10.255.0.9/32")), Some(PoolKind::Single));
        assert_eq!(pool.kind_of(&net("10.255.9.0/24")), Some(PoolKind::Block));
        assert!(pool.blocks.is_disjoint(&pool.singles));
    }

    #[test]
    fn rejects_bad_prefixes() {
        assert!(CidrPool::new(net("10.255.0.0/16"), 16).is_err());
        assert!(CidrPool::new(net("10.255.0.0/16"), 8).is_err());
        assert!(CidrPool::new(net("10.255.0.0/16"), 33).is_err());
    }

    #[test]
    fn available_excludes_taken() {
        let pool = CidrPool::new(net("10.255.0.0/22"), 24).unwrap();
        let mut taken = BTreeSet::new();
        taken.insert(net("10.255.1.0/24"));
        taken.insert(net("10.255.3.0/24"));
        for _ in 0..20 {
            assert_eq!(pool.available(PoolKind::Block, &taken), Some(net("10.255.2.0/24")));
        }
        taken.insert(net("10.255.2.0/24"));
        assert_eq!(pool.available(PoolKind::Block, &taken), None);
    }

    #[test]
    fn available_covers_whole_pool() {
        let pool = CidrPool::new(net("10.255.0.0/21"), 24).unwrap();
        let taken = BTreeSet::new();
        let mut seen = BTreeSet::new();
        for _ in 0..500 {
            seen.insert(pool.available(PoolKind::Block, &taken).unwrap());
        }
        assert_eq!(seen.len(), pool.block_pool_size());
    }
}
