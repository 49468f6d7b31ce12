// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The packet-filter policy converger.
//!
//! Five chain kinds are managed in the `filter` table:
//!
//! | prefix  | parent  | content                                        |
//! |---------|---------|------------------------------------------------|
//! | `vpa--` | FORWARD | marks sources and accepts allowed marked flows |
//! | `in-`   | INPUT   | a container's access to the host               |
//! | `ov-`   | FORWARD | a container's overlay default deny             |
//! | `no-`   | FORWARD | a container's egress to the outside            |
//! | `nl-`   | (goto)  | logging of accepted egress                     |
//!
//! [`planner`] computes what these should contain, [`enforcer`] puts a
//! rule set in force without a window of partial state, and
//! [`converger`] ties both to the datastore and the controller.

pub mod chain;
pub mod converger;
pub mod enforcer;
pub mod planner;
pub mod rules;

pub use chain::Chain;
pub use chain::Placement;
pub use chain::RulesWithChain;
pub use converger::ConvergeError;
pub use converger::PolicyConverger;
pub use enforcer::EnforceError;
pub use enforcer::Enforcer;
pub use planner::DenyNetworks;
pub use planner::OutConn;
pub use planner::Planner;
pub use planner::PlannerConfig;
