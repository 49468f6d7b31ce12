// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Containers as recorded in the local datastore.

use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const META_POLICY_GROUP_ID: &str = "policy_group_id";
pub const META_SPACE_ID: &str = "space_id";
pub const META_PORTS: &str = "ports";
pub const META_WORKLOAD: &str = "container_workload";
pub const META_LOG_CONFIG: &str = "log_config";

pub type Metadata = BTreeMap<String, Value>;

/// One container present on the cell.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub handle: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ContainerRecord {
    pub fn new(handle: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self { handle: handle.into(), ip, metadata: Metadata::new() }
    }

    pub fn with_meta(mut self, key: &str, val: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), val.into());
        self
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// The application (policy group) this container belongs to.
    pub fn policy_group_id(&self) -> Option<&str> {
        self.meta_str(META_POLICY_GROUP_ID)
    }

    pub fn space_id(&self) -> Option<&str> {
        self.meta_str(META_SPACE_ID)
    }

    /// The container-side ports open for overlay ingress. Entries that
    /// do not parse are skipped.
    pub fn ports(&self) -> Vec<u16> {
        let Some(raw) = self.meta_str(META_PORTS) else {
            return vec![];
        };
        raw.split(',').filter_map(|p| p.trim().parse().ok()).collect()
    }

    /// The lifecycle stage of the container. `None` when unset or not
    /// one of the known values.
    pub fn workload(&self) -> Option<Workload> {
        self.meta_str(META_WORKLOAD).and_then(|w| w.parse().ok())
    }

    /// The log configuration handed through untouched from the runtime.
    pub fn log_config(&self) -> Option<&Value> {
        self.metadata.get(META_LOG_CONFIG)
    }
}

/// What kind of process a container runs.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    App,
    Task,
    Staging,
}

impl Workload {
    /// App and task containers are "running" as far as egress
    /// lifecycles are concerned.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::App | Self::Task)
    }
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "task" => Ok(Self::Task),
            "staging" => Ok(Self::Staging),
            _ => Err(format!("unknown workload: {s}")),
        }
    }
}

impl Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::App => "app",
            Self::Task => "task",
            Self::Staging => "staging",
        };
        write!(f, "{s}")
    }
}
