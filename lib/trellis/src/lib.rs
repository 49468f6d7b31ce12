// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Trellis: the control plane of a container overlay network.
//!
//! A cell runs `trellisd`, which leases an overlay subnet from the
//! controller, programs the local VXLAN tunnel endpoint so every other
//! cell's subnet is reachable, and turns the published network policy
//! plus the set of local containers into packet-filter chains.
//!
//! The library is organized leaves first:
//!
//! * [`iptables`] and [`netlink`] wrap the host's packet filter and
//!   the kernel's link/neighbor/FDB/route tables behind traits, so the
//!   convergers can be driven against in-memory fakes in tests.
//! * [`datastore`] is the file-locked container catalog shared with
//!   the CNI plug-in.
//! * [`leaser`] is the controller-side subnet allocator.
//! * [`client`] talks to the controller.
//! * [`vxlan`] and [`policy`] are the two convergers, driven by
//!   [`poller`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod client;
pub mod config;
pub mod datastore;
#[cfg(any(feature = "test-help", test))]
pub mod fakes;
pub mod filelock;
pub mod iptables;
pub mod leaser;
pub mod log;
pub mod metrics;
pub mod netlink;
pub mod policy;
pub mod poller;
pub mod print;
pub mod vxlan;

pub use trellis_api as api;

/// Return the package version string.
pub fn pkg_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
