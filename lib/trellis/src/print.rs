// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print leases, containers, and chains in a human-friendly manner.
//!
//! These are used by `trellisadm` and by tests that want a readable
//! dump of state on failure.

use crate::api::ContainerRecord;
use crate::api::LeasesResp;
use crate::leaser::LeaseRecord;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`LeasesResp`].
pub fn print_leases(resp: &LeasesResp) -> std::io::Result<()> {
    print_leases_into(&mut std::io::stdout(), resp)
}

/// Print a [`LeasesResp`].
pub fn print_leases_into(
    writer: &mut impl Write,
    resp: &LeasesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "UNDERLAY\tOVERLAY SUBNET\tVTEP MAC")?;
    write_hr(&mut t)?;
    for l in &resp.leases {
        writeln!(
            t,
            "{}\t{}\t{}",
            l.underlay_ip, l.overlay_subnet, l.overlay_hardware_addr
        )?;
    }
    t.flush()
}

/// Print lease records as the controller stores them.
pub fn print_lease_records_into(
    writer: &mut impl Write,
    records: &[LeaseRecord],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "UNDERLAY\tOVERLAY SUBNET\tLAST RENEWED\tPINNED")?;
    write_hr(&mut t)?;
    for r in records {
        writeln!(
            t,
            "{}\t{}\t{}\t{}",
            r.lease.underlay_ip,
            r.lease.overlay_subnet,
            r.last_renewed_at.format("%Y-%m-%dT%H:%M:%SZ"),
            if r.pinned { "yes" } else { "no" },
        )?;
    }
    t.flush()
}

/// Print the container datastore.
pub fn print_containers(
    containers: &BTreeMap<String, ContainerRecord>,
) -> std::io::Result<()> {
    print_containers_into(&mut std::io::stdout(), containers)
}

/// Print the container datastore.
pub fn print_containers_into(
    writer: &mut impl Write,
    containers: &BTreeMap<String, ContainerRecord>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "HANDLE\tIP\tGROUP\tSPACE\tPORTS")?;
    write_hr(&mut t)?;
    for c in containers.values() {
        let ports = c.ports();
        let ports = if ports.is_empty() {
            "-".to_string()
        } else {
            ports.iter().join(",")
        };
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            c.handle,
            c.ip,
            c.policy_group_id().unwrap_or("-"),
            c.space_id().unwrap_or("-"),
            ports,
        )?;
    }
    t.flush()
}

/// Print the rules of each chain in `chains`, keyed by chain name.
pub fn print_chains(
    table: &str,
    chains: &BTreeMap<String, Vec<String>>,
) -> std::io::Result<()> {
    print_chains_into(&mut std::io::stdout(), table, chains)
}

/// Print the rules of each chain in `chains`, keyed by chain name.
pub fn print_chains_into(
    writer: &mut impl Write,
    table: &str,
    chains: &BTreeMap<String, Vec<String>>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    for (name, rules) in chains {
        writeln!(t, "Chain {name} ({table})")?;
        write_hrb(&mut t)?;
        for (i, rule) in rules.iter().enumerate() {
            writeln!(t, "{}\t{rule}", i + 1)?;
        }
        writeln!(t)?;
    }
    t.flush()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
