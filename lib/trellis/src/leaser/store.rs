// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The authoritative lease table.
//!
//! Schema:
//!
//! * `subnets(underlay_ip PK, overlay_subnet UNIQUE, overlay_hardware_addr,
//!   last_renewed_at)`: one row per live lease.
//! * `gating_table(id PK, generation)`: a single row that every mutating
//!   transaction updates first. Combined with `BEGIN IMMEDIATE` this
//!   serializes allocation across every connection to the database.
//! * `lease_pins(underlay_ip PK)`: leases the staleness sweep must not
//!   remove.

use super::CidrPool;
use super::PoolKind;
use chrono::DateTime;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;
use trellis_api::Lease;
use trellis_api::MacAddr;
use trellis_api::normalize;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subnets (
    underlay_ip TEXT PRIMARY KEY,
    overlay_subnet TEXT UNIQUE NOT NULL,
    overlay_hardware_addr TEXT NOT NULL,
    last_renewed_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS gating_table (
    id INTEGER PRIMARY KEY,
    generation INTEGER NOT NULL
);
INSERT OR IGNORE INTO gating_table (id, generation) VALUES (1, 0);
CREATE TABLE IF NOT EXISTS lease_pins (
    underlay_ip TEXT PRIMARY KEY
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("database: {0}")]
    Transient(#[from] rusqlite::Error),

    #[error("no free subnets left in the {0:?} pool")]
    Exhausted(PoolKind),

    #[error("lease {0} is not renewable")]
    NonRenewable(Lease),

    #[error("underlay {underlay_ip} already holds {subnet}, which is not in the {requested:?} pool")]
    PoolMismatch { underlay_ip: Ipv4Addr, subnet: Ipv4Network, requested: PoolKind },

    #[error("subnet {0} is not a member of the overlay pool")]
    NotInPool(Ipv4Network),

    #[error("no lease held by {0}")]
    NotFound(Ipv4Addr),

    #[error("corrupt lease row: {0}")]
    Corrupt(String),
}

impl LeaseError {
    fn is_unique_violation(&self) -> bool {
        match self {
            Self::Transient(e) => e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation),
            _ => false,
        }
    }
}

/// A lease as the controller keeps it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseRecord {
    pub lease: Lease,
    pub last_renewed_at: DateTime<Utc>,
    pub pinned: bool,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct LeaseStore {
    conn: Mutex<Connection>,
    pool: CidrPool,
    expiration: chrono::Duration,
    clock: Clock,
    log: Logger,
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LeaseStore")
            .field("pool", &self.pool.network())
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

fn parse_row(
    underlay: String,
    subnet: String,
    hw: String,
    renewed: i64,
) -> Result<(Lease, DateTime<Utc>), LeaseError> {
    let underlay_ip: Ipv4Addr = underlay
        .parse()
        .map_err(|_| LeaseError::Corrupt(format!("underlay_ip {underlay:?}")))?;
    let overlay_subnet: Ipv4Network = subnet
        .parse()
        .map_err(|_| LeaseError::Corrupt(format!("overlay_subnet {subnet:?}")))?;
    let overlay_hardware_addr: MacAddr =
        hw.parse().map_err(|_| LeaseError::Corrupt(format!("hardware addr {hw:?}")))?;
    let at = DateTime::from_timestamp(renewed, 0)
        .ok_or_else(|| LeaseError::Corrupt(format!("last_renewed_at {renewed}")))?;
    Ok((Lease { underlay_ip, overlay_subnet, overlay_hardware_addr }, at))
}

/// Take the gating row. Must be the first statement of every mutating
/// transaction.
fn gate(tx: &Transaction) -> Result<(), LeaseError> {
    tx.execute("UPDATE gating_table SET generation = generation + 1 WHERE id = 1", [])?;
    Ok(())
}

impl LeaseStore {
    pub fn open(
        path: impl AsRef<Path>,
        pool: CidrPool,
        expiration: Duration,
        log: &Logger,
    ) -> Result<Self, LeaseError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, pool, expiration, log)
    }

    pub fn open_in_memory(
        pool: CidrPool,
        expiration: Duration,
        log: &Logger,
    ) -> Result<Self, LeaseError> {
        Self::init(Connection::open_in_memory()?, pool, expiration, log)
    }

    fn init(
        conn: Connection,
        pool: CidrPool,
        expiration: Duration,
        log: &Logger,
    ) -> Result<Self, LeaseError> {
        conn.execute_batch(SCHEMA)?;
        let expiration = chrono::Duration::from_std(expiration)
            .map_err(|e| LeaseError::Corrupt(format!("expiration: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            pool,
            expiration,
            clock: Arc::new(Utc::now),
            log: log.new(o!("component" => "lease-store")),
        })
    }

    /// Replace the source of "now".
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &CidrPool {
        &self.pool
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> i64 {
        (self.clock)().timestamp()
    }

    /// Hand `underlay_ip` a subnet, or return the one it already holds.
    pub fn acquire_subnet_lease(
        &self,
        underlay_ip: Ipv4Addr,
        single_ip: bool,
    ) -> Result<Lease, LeaseError> {
        let kind = PoolKind::from_single(single_ip);
        let mut swept = false;
        let mut raced = false;

        loop {
            match self.try_acquire(underlay_ip, kind) {
                Err(LeaseError::Exhausted(_)) if !swept => {
                    swept = true;
                    let n = self.staleness_sweep()?;
                    info!(self.log, "pool exhausted, swept stale leases";
                        "removed" => n, "pool" => ?kind);
                    if n == 0 {
                        return Err(LeaseError::Exhausted(kind));
                    }
                }
                Err(e) if e.is_unique_violation() && !raced => {
                    raced = true;
                    debug!(self.log, "subnet taken concurrently, retrying";
                        "underlay_ip" => %underlay_ip);
                }
                res => return res,
            }
        }
    }

    fn try_acquire(&self, underlay_ip: Ipv4Addr, kind: PoolKind) -> Result<Lease, LeaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        gate(&tx)?;

        let existing = tx
            .query_row(
                "SELECT underlay_ip, overlay_subnet, overlay_hardware_addr, last_renewed_at
                 FROM subnets WHERE underlay_ip = ?1",
                params![underlay_ip.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;

        if let Some((u, s, h, t)) = existing {
            let (lease, _) = parse_row(u, s, h, t)?;
            return match self.pool.kind_of(&lease.overlay_subnet) {
                Some(k) if k == kind => {
                    tx.commit()?;
                    Ok(lease)
                }
                Some(_) => Err(LeaseError::PoolMismatch {
                    underlay_ip,
                    subnet: lease.overlay_subnet,
                    requested: kind,
                }),
                None => Err(LeaseError::NotInPool(lease.overlay_subnet)),
            };
        }

        let taken = {
            let mut stmt = tx.prepare("SELECT overlay_subnet FROM subnets")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut taken = BTreeSet::new();
            for s in rows {
                let s = s?;
                let net: Ipv4Network =
                    s.parse().map_err(|_| LeaseError::Corrupt(format!("overlay_subnet {s:?}")))?;
                taken.insert(net);
            }
            taken
        };

        let Some(subnet) = self.pool.available(kind, &taken) else {
            return Err(LeaseError::Exhausted(kind));
        };

        let lease = Lease::new(underlay_ip, subnet);
        tx.execute(
            "INSERT INTO subnets
             (underlay_ip, overlay_subnet, overlay_hardware_addr, last_renewed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                underlay_ip.to_string(),
                lease.overlay_subnet.to_string(),
                lease.overlay_hardware_addr.to_string(),
                self.now(),
            ],
        )?;
        tx.commit()?;

        info!(self.log, "lease acquired"; "lease" => %lease);
        Ok(lease)
    }

    /// Refresh `last_renewed_at` of exactly this binding.
    pub fn renew_subnet_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        let subnet = normalize(lease.overlay_subnet);
        if !self.pool.is_member(&subnet) {
            return Err(LeaseError::NotInPool(subnet));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        gate(&tx)?;
        let n = tx.execute(
            "UPDATE subnets SET last_renewed_at = ?1
             WHERE underlay_ip = ?2 AND overlay_subnet = ?3",
            params![self.now(), lease.underlay_ip.to_string(), subnet.to_string()],
        )?;
        if n == 0 {
            return Err(LeaseError::NonRenewable(*lease));
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop whatever `underlay_ip` holds. Releasing nothing succeeds.
    pub fn release_subnet_lease(&self, underlay_ip: Ipv4Addr) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        gate(&tx)?;
        let n = tx.execute(
            "DELETE FROM subnets WHERE underlay_ip = ?1",
            params![underlay_ip.to_string()],
        )?;
        tx.execute("DELETE FROM lease_pins WHERE underlay_ip = ?1", params![
            underlay_ip.to_string()
        ])?;
        tx.commit()?;
        if n > 0 {
            info!(self.log, "lease released"; "underlay_ip" => %underlay_ip);
        }
        Ok(())
    }

    /// Every lease in the table, expired or not.
    pub fn routable_leases(&self) -> Result<Vec<Lease>, LeaseError> {
        Ok(self.records()?.into_iter().map(|r| r.lease).collect())
    }

    /// Every lease with its bookkeeping, ordered by underlay address.
    pub fn records(&self) -> Result<Vec<LeaseRecord>, LeaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.underlay_ip, s.overlay_subnet, s.overlay_hardware_addr,
                    s.last_renewed_at, p.underlay_ip IS NOT NULL
             FROM subnets s LEFT JOIN lease_pins p ON s.underlay_ip = p.underlay_ip",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get::<_, bool>(4)?))
        })?;

        let mut out = vec![];
        for row in rows {
            let (u, s, h, t, pinned) = row?;
            let (lease, last_renewed_at) = parse_row(u, s, h, t)?;
            out.push(LeaseRecord { lease, last_renewed_at, pinned });
        }
        out.sort_by_key(|r| r.lease.underlay_ip);
        Ok(out)
    }

    /// Remove leases not renewed within the expiration window, unless
    /// pinned. Returns how many were removed.
    pub fn staleness_sweep(&self) -> Result<usize, LeaseError> {
        let cutoff = self.now() - self.expiration.num_seconds();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        gate(&tx)?;
        let n = tx.execute(
            "DELETE FROM subnets WHERE last_renewed_at < ?1
             AND underlay_ip NOT IN (SELECT underlay_ip FROM lease_pins)",
            params![cutoff],
        )?;
        tx.commit()?;
        if n > 0 {
            info!(self.log, "swept stale leases"; "removed" => n);
        }
        Ok(n)
    }

    /// Mark or unmark a lease as in use.
    pub fn pin_lease(&self, underlay_ip: Ipv4Addr, pinned: bool) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        gate(&tx)?;
        if pinned {
            let held: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM subnets WHERE underlay_ip = ?1",
                    params![underlay_ip.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            if held.is_none() {
                return Err(LeaseError::NotFound(underlay_ip));
            }
            tx.execute(
                "INSERT OR IGNORE INTO lease_pins (underlay_ip) VALUES (?1)",
                params![underlay_ip.to_string()],
            )?;
        } else {
            tx.execute("DELETE FROM lease_pins WHERE underlay_ip = ?1", params![
                underlay_ip.to_string()
            ])?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::null_logger;
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    fn pool(net: &str, prefix: u8) -> CidrPool {
        CidrPool::new(net.parse().unwrap(), prefix).unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn store(net: &str, prefix: u8) -> LeaseStore {
        LeaseStore::open_in_memory(pool(net, prefix), Duration::from_secs(60), &null_logger())
            .unwrap()
    }

    /// A clock the test moves by hand.
    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let n = now.clone();
        let clock: Clock = Arc::new(move || {
            DateTime::from_timestamp(n.load(Ordering::SeqCst), 0).unwrap()
        });
        (clock, now)
    }

    #[test]
    fn acquire_then_renew() {
        let s = store("10.255.0.0/16", 24);
        let lease = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        assert_eq!(lease.underlay_ip, ip("10.0.0.1"));
        assert_eq!(lease.overlay_subnet.prefix(), 24);
        let [a, b, c, d] = lease.overlay_subnet.network().octets();
        assert_eq!((a, b, d), (10, 255, 0));
        assert!((1..=255).contains(&c));
        assert_eq!(lease.overlay_hardware_addr, MacAddr::for_vtep(lease.vtep_ip()));

        s.renew_subnet_lease(&lease).unwrap();
    }

    #[test]
    fn acquire_is_idempotent() {
        let s = store("10.255.0.0/16", 24);
        let first = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        let second = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        assert_eq!(first, second);
        assert_eq!(s.routable_leases().unwrap().len(), 1);
    }

    #[test]
    fn single_ip_pool() {
        let s = store("10.255.0.0/16", 24);
        let lease = s.acquire_subnet_lease(ip("10.0.0.1"), true).unwrap();
        assert_eq!(lease.overlay_subnet.prefix(), 32);
        assert_eq!(s.pool().kind_of(&lease.overlay_subnet), Some(PoolKind::Single));
    }

    #[test]
    fn pool_mismatch() {
        let s = store("10.255.0.0/16", 24);
        s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        let err = s.acquire_subnet_lease(ip("10.0.0.1"), true).unwrap_err();
        assert!(matches!(err, LeaseError::PoolMismatch { .. }));
    }

    #[test]
    fn renew_requires_exact_binding() {
        let s = store("10.255.0.0/16", 24);
        let lease = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();

        let mut other_underlay = lease;
        other_underlay.underlay_ip = ip("10.0.0.2");
        assert!(matches!(
            s.renew_subnet_lease(&other_underlay).unwrap_err(),
            LeaseError::NonRenewable(_)
        ));

        let mut other_subnet = lease;
        other_subnet.overlay_subnet = if lease.overlay_subnet.to_string() == "10.255.1.0/24" {
            "10.255.2.0/24".parse().unwrap()
        } else {
            "10.255.1.0/24".parse().unwrap()
        };
        assert!(matches!(
            s.renew_subnet_lease(&other_subnet).unwrap_err(),
            LeaseError::NonRenewable(_)
        ));

        let mut outside = lease;
        outside.overlay_subnet = "10.254.1.0/24".parse().unwrap();
        assert!(matches!(
            s.renew_subnet_lease(&outside).unwrap_err(),
            LeaseError::NotInPool(_)
        ));

        s.release_subnet_lease(lease.underlay_ip).unwrap();
        assert!(matches!(
            s.renew_subnet_lease(&lease).unwrap_err(),
            LeaseError::NonRenewable(_)
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let s = store("10.255.0.0/16", 24);
        s.release_subnet_lease(ip("10.0.0.9")).unwrap();
        s.acquire_subnet_lease(ip("10.0.0.9"), false).unwrap();
        s.release_subnet_lease(ip("10.0.0.9")).unwrap();
        s.release_subnet_lease(ip("10.0.0.9")).unwrap();
        assert!(s.routable_leases().unwrap().is_empty());
    }

    #[test]
    fn exhausts_only_when_full() {
        // Three blocks: 10.255.1.0/24 .. 10.255.3.0/24.
        let s = store("10.255.0.0/22", 24);
        let mut got = BTreeSet::new();
        for i in 1..=3 {
            let l = s.acquire_subnet_lease(ip(&format!("10.0.0.{i}")), false).unwrap();
            got.insert(l.overlay_subnet);
        }
        assert_eq!(got.len(), 3);
        let err = s.acquire_subnet_lease(ip("10.0.0.4"), false).unwrap_err();
        assert!(matches!(err, LeaseError::Exhausted(PoolKind::Block)));

        // Freeing one makes room again.
        s.release_subnet_lease(ip("10.0.0.2")).unwrap();
        s.acquire_subnet_lease(ip("10.0.0.4"), false).unwrap();
    }

    #[test]
    fn exhaustion_sweeps_stale_leases() {
        let (clock, now) = manual_clock();
        let s = store("10.255.0.0/23", 24).with_clock(clock);
        s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();

        now.fetch_add(120, Ordering::SeqCst);
        let lease = s.acquire_subnet_lease(ip("10.0.0.2"), false).unwrap();
        assert_eq!(lease.overlay_subnet, "10.255.1.0/24".parse().unwrap());
        assert_eq!(s.routable_leases().unwrap(), vec![lease]);
    }

    #[test]
    fn sweep_spares_fresh_and_pinned() {
        let (clock, now) = manual_clock();
        let s = store("10.255.0.0/16", 24).with_clock(clock);
        let old = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        let pinned = s.acquire_subnet_lease(ip("10.0.0.2"), false).unwrap();
        s.pin_lease(pinned.underlay_ip, true).unwrap();

        now.fetch_add(61, Ordering::SeqCst);
        let fresh = s.acquire_subnet_lease(ip("10.0.0.3"), false).unwrap();

        assert_eq!(s.staleness_sweep().unwrap(), 1);
        let left = s.routable_leases().unwrap();
        assert!(!left.contains(&old));
        assert!(left.contains(&pinned));
        assert!(left.contains(&fresh));

        let recs = s.records().unwrap();
        assert!(recs.iter().any(|r| r.pinned && r.lease == pinned));

        s.pin_lease(pinned.underlay_ip, false).unwrap();
        now.fetch_add(61, Ordering::SeqCst);
        assert_eq!(s.staleness_sweep().unwrap(), 2);
    }

    #[test]
    fn pin_needs_lease() {
        let s = store("10.255.0.0/16", 24);
        let err = s.pin_lease(ip("10.0.0.1"), true).unwrap_err();
        assert!(matches!(err, LeaseError::NotFound(_)));
        s.pin_lease(ip("10.0.0.1"), false).unwrap();
    }

    #[test]
    fn renew_keeps_lease_fresh() {
        let (clock, now) = manual_clock();
        let s = store("10.255.0.0/16", 24).with_clock(clock);
        let lease = s.acquire_subnet_lease(ip("10.0.0.1"), false).unwrap();
        now.fetch_add(50, Ordering::SeqCst);
        s.renew_subnet_lease(&lease).unwrap();
        now.fetch_add(50, Ordering::SeqCst);
        assert_eq!(s.staleness_sweep().unwrap(), 0);
    }

    #[test]
    fn concurrent_acquisitions_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let log = null_logger();
        // Create the schema before the writers race.
        drop(
            LeaseStore::open(&path, pool("10.255.0.0/16", 24), Duration::from_secs(60), &log)
                .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let path = path.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    let s = LeaseStore::open(
                        &path,
                        pool("10.255.0.0/16", 24),
                        Duration::from_secs(60),
                        &log,
                    )
                    .unwrap();
                    (0..10)
                        .map(|i| {
                            s.acquire_subnet_lease(ip(&format!("10.0.{t}.{i}")), false)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let leases: Vec<Lease> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(leases.len(), 80);
        let subnets: BTreeSet<_> = leases.iter().map(|l| l.overlay_subnet).collect();
        assert_eq!(subnets.len(), 80);
        for a in &leases {
            for b in &leases {
                if a.underlay_ip != b.underlay_ip {
                    assert!(!a.overlay_subnet.overlaps(b.overlay_subnet));
                }
            }
        }
    }
}
