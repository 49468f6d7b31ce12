// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! On-disk configuration of the daemon and the controller.
//!
//! Both are JSON with snake_case keys. Loading parses and then checks
//! every cross-field constraint, so a process that got a config back
//! from [`Config::load`] does not need to re-validate anything.

use crate::client::TlsFiles;
use crate::log::parse_level;
use crate::policy::DenyNetworks;
use crate::policy::OutConn;
use crate::policy::PlannerConfig;
use crate::vxlan::MAX_LINK_NAME_LEN;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use slog::Level;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// A configuration file.
pub trait Config: DeserializeOwned {
    /// Check constraints serde cannot express.
    fn validate(&self) -> Result<(), ConfigError>;

    fn from_json(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(path, &raw)
    }
}

fn validate_overlay(overlay: Ipv4Network, subnet_prefix: u8) -> Result<(), ConfigError> {
    if overlay.ip() != overlay.network() {
        return Err(invalid(format!("overlay_network {overlay} has host bits set")));
    }
    if subnet_prefix <= overlay.prefix() || subnet_prefix > 30 {
        return Err(invalid(format!(
            "subnet_prefix_length {subnet_prefix} must be longer than the overlay \
             prefix {} and at most 30",
            overlay.prefix()
        )));
    }
    Ok(())
}

fn validate_level(level: &str) -> Result<Level, ConfigError> {
    parse_level(level).ok_or_else(|| invalid(format!("unknown log_level {level:?}")))
}

fn positive(name: &str, v: u64) -> Result<(), ConfigError> {
    if v == 0 {
        return Err(invalid(format!("{name} must be positive")));
    }
    Ok(())
}

fn default_vtep_name() -> String {
    "trellis-vtep".into()
}

fn default_vtep_port() -> u16 {
    4789
}

fn default_vni() -> u32 {
    1
}

fn default_poll_interval() -> u64 {
    5
}

fn default_asg_poll_interval() -> u64 {
    60
}

fn default_metrics_emit_interval() -> u64 {
    30
}

fn default_client_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".into()
}

fn default_denied_logs_per_sec() -> u32 {
    2
}

fn default_enable_asg_syncing() -> bool {
    true
}

fn default_accepted_udp_logs_per_sec() -> u32 {
    100
}

/// Configuration of `trellisd`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub underlay_ip: Ipv4Addr,
    #[serde(default)]
    pub underlay_interface: Option<String>,
    /// Interfaces egress leaves through. Defaults to the underlay
    /// device.
    #[serde(default)]
    pub host_interface_names: Vec<String>,
    #[serde(default = "default_vtep_name")]
    pub vtep_name: String,
    #[serde(default = "default_vtep_port")]
    pub vtep_port: u16,
    #[serde(default = "default_vni")]
    pub vni: u32,
    pub overlay_network: Ipv4Network,
    pub subnet_prefix_length: u8,
    #[serde(default)]
    pub single_ip_only: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_asg_poll_interval")]
    pub asg_poll_interval: u64,
    #[serde(default = "default_metrics_emit_interval")]
    pub metrics_emit_interval: u64,

    pub controller_url: String,
    pub ca_cert_file: PathBuf,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_seconds: u64,

    pub health_check_port: u16,
    pub debug_server_port: u16,

    pub datastore: PathBuf,
    #[serde(default)]
    pub datastore_file_owner: Option<String>,
    #[serde(default)]
    pub datastore_file_group: Option<String>,
    pub iptables_lock_file: PathBuf,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub iptables_c2c_logging: bool,
    #[serde(default)]
    pub iptables_asg_logging: bool,
    #[serde(default = "default_denied_logs_per_sec")]
    pub iptables_denied_logs_per_sec: u32,
    #[serde(default = "default_accepted_udp_logs_per_sec")]
    pub iptables_accepted_udp_logs_per_sec: u32,

    #[serde(default)]
    pub enable_overlay_ingress_rules: bool,
    #[serde(default)]
    pub disable_container_network_policy: bool,
    #[serde(default)]
    pub deny_networks: DenyNetworks,
    /// Host services containers may reach, e.g. a local DNS resolver.
    #[serde(default)]
    pub host_tcp_services: Vec<SocketAddrV4>,
    #[serde(default)]
    pub host_udp_services: Vec<SocketAddrV4>,
    #[serde(default)]
    pub outbound_connections: OutConn,
    /// Run the egress poller. Without it egress chains are only written
    /// on request through the debug server.
    #[serde(default = "default_enable_asg_syncing")]
    pub enable_asg_syncing: bool,
}

impl Config for DaemonConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_overlay(self.overlay_network, self.subnet_prefix_length)?;
        validate_level(&self.log_level)?;

        if self.vtep_name.is_empty() || self.vtep_name.len() > MAX_LINK_NAME_LEN {
            return Err(invalid(format!(
                "vtep_name must be 1 to {MAX_LINK_NAME_LEN} bytes"
            )));
        }
        if self.vtep_port == 0 {
            return Err(invalid("vtep_port must be non-zero"));
        }
        if self.health_check_port == 0 {
            return Err(invalid("health_check_port must be non-zero"));
        }
        positive("poll_interval", self.poll_interval)?;
        positive("asg_poll_interval", self.asg_poll_interval)?;
        positive("metrics_emit_interval", self.metrics_emit_interval)?;
        positive("client_timeout_seconds", self.client_timeout_seconds)?;
        if !self.controller_url.starts_with("https://")
            && !self.controller_url.starts_with("http://")
        {
            return Err(invalid(format!("controller_url {:?} is not http(s)", self.controller_url)));
        }
        if self.datastore_file_owner.is_some() != self.datastore_file_group.is_some() {
            return Err(invalid(
                "datastore_file_owner and datastore_file_group go together",
            ));
        }
        if self.host_interface_names.iter().any(String::is_empty) {
            return Err(invalid("host_interface_names may not contain empty names"));
        }
        let oc = &self.outbound_connections;
        if oc.limit && (oc.burst == 0 || oc.rate_per_sec == 0) {
            return Err(invalid(
                "outbound_connections needs a non-zero burst and rate_per_sec",
            ));
        }
        Ok(())
    }
}

impl DaemonConfig {
    pub fn level(&self) -> Level {
        parse_level(&self.log_level).unwrap_or(Level::Info)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn asg_poll_interval(&self) -> Duration {
        Duration::from_secs(self.asg_poll_interval)
    }

    pub fn metrics_emit_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_emit_interval)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_seconds)
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            ca_cert: self.ca_cert_file.clone(),
            client_cert: self.client_cert_file.clone(),
            client_key: self.client_key_file.clone(),
        }
    }

    /// The planner's view, once the underlay device is known.
    pub fn planner_config(&self, underlay_device: &str) -> PlannerConfig {
        let host_interfaces = if self.host_interface_names.is_empty() {
            vec![underlay_device.to_string()]
        } else {
            self.host_interface_names.clone()
        };
        PlannerConfig {
            vtep_name: self.vtep_name.clone(),
            overlay_network: self.overlay_network,
            host_interfaces,
            deny_networks: self.deny_networks.clone(),
            host_tcp_services: self.host_tcp_services.clone(),
            host_udp_services: self.host_udp_services.clone(),
            asg_logging: self.iptables_asg_logging,
            denied_logs_per_sec: self.iptables_denied_logs_per_sec,
            accepted_udp_logs_per_sec: self.iptables_accepted_udp_logs_per_sec,
            enable_overlay_ingress_rules: self.enable_overlay_ingress_rules,
            disable_container_network_policy: self.disable_container_network_policy,
            outbound_connections: self.outbound_connections,
        }
    }
}

fn default_lease_expiration() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_tag_length() -> usize {
    2
}

/// Configuration of `trellis-controller`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub listen_address: SocketAddr,
    pub database_path: PathBuf,
    pub overlay_network: Ipv4Network,
    pub subnet_prefix_length: u8,
    #[serde(default = "default_lease_expiration")]
    pub lease_expiration_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub staleness_sweep_interval: u64,
    /// A `{policies, egress_policies}` document served as is.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
    /// Tag width in bytes.
    #[serde(default = "default_tag_length")]
    pub tag_length: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config for ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_overlay(self.overlay_network, self.subnet_prefix_length)?;
        validate_level(&self.log_level)?;
        positive("lease_expiration_seconds", self.lease_expiration_seconds)?;
        positive("staleness_sweep_interval", self.staleness_sweep_interval)?;
        if !(1..=4).contains(&self.tag_length) {
            return Err(invalid("tag_length must be 1 to 4 bytes"));
        }
        Ok(())
    }
}

impl ControllerConfig {
    pub fn level(&self) -> Level {
        parse_level(&self.log_level).unwrap_or(Level::Info)
    }

    pub fn lease_expiration(&self) -> Duration {
        Duration::from_secs(self.lease_expiration_seconds)
    }

    pub fn staleness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.staleness_sweep_interval)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DAEMON: &str = r#"{
        "underlay_ip": "10.0.0.1",
        "overlay_network": "10.255.0.0/16",
        "subnet_prefix_length": 24,
        "controller_url": "https://controller.internal:4003",
        "ca_cert_file": "/etc/trellis/ca.pem",
        "client_cert_file": "/etc/trellis/client.pem",
        "client_key_file": "/etc/trellis/client.key",
        "health_check_port": 4004,
        "debug_server_port": 8721,
        "datastore": "/var/vcap/data/container-metadata/store.json",
        "iptables_lock_file": "/var/vcap/data/garden-cni/iptables.lock"
    }"#;

    fn daemon(patch: serde_json::Value) -> Result<DaemonConfig, ConfigError> {
        let mut v: serde_json::Value = serde_json::from_str(DAEMON).unwrap();
        if let (Some(obj), Some(p)) = (v.as_object_mut(), patch.as_object()) {
            for (k, val) in p {
                obj.insert(k.clone(), val.clone());
            }
        }
        DaemonConfig::from_json(Path::new("test.json"), &v.to_string())
    }

    #[test]
    fn daemon_defaults() {
        let cfg = daemon(serde_json::json!({})).unwrap();
        assert_eq!(cfg.vtep_name, "trellis-vtep");
        assert_eq!(cfg.vtep_port, 4789);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.asg_poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.iptables_denied_logs_per_sec, 2);
        assert_eq!(cfg.iptables_accepted_udp_logs_per_sec, 100);
        assert_eq!(cfg.level(), Level::Info);
        assert_eq!(cfg.deny_networks, DenyNetworks::default());
        assert_eq!(cfg.outbound_connections, OutConn::default());
        assert!(!cfg.outbound_connections.limit);
        assert!(cfg.enable_asg_syncing);

        let pc = cfg.planner_config("eth0");
        assert_eq!(pc.host_interfaces, vec!["eth0"]);
    }

    #[test]
    fn deny_networks_parse() {
        let cfg = daemon(serde_json::json!({
            "deny_networks": {"always": ["172.16.0.0/12"], "staging": ["10.0.0.0/8"]}
        }))
        .unwrap();
        assert_eq!(cfg.deny_networks.always.len(), 1);
        assert!(cfg.deny_networks.running.is_empty());

        let err = daemon(serde_json::json!({"deny_networks": {"always": ["not-a-cidr"]}}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn outbound_connections_parse() {
        let cfg = daemon(serde_json::json!({
            "outbound_connections": {"limit": true, "logging": true, "burst": 900, "rate_per_sec": 100},
            "enable_asg_syncing": false
        }))
        .unwrap();
        assert!(!cfg.enable_asg_syncing);
        let oc = cfg.planner_config("eth0").outbound_connections;
        assert!(oc.limit && oc.logging && !oc.dry_run);
        assert_eq!((oc.burst, oc.rate_per_sec), (900, 100));

        let err = daemon(serde_json::json!({"outbound_connections": {"limt": true}})).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn daemon_rejects_bad_values() {
        for patch in [
            serde_json::json!({"subnet_prefix_length": 16}),
            serde_json::json!({"overlay_network": "10.255.1.0/16"}),
            serde_json::json!({"health_check_port": 0}),
            serde_json::json!({"poll_interval": 0}),
            serde_json::json!({"log_level": "loud"}),
            serde_json::json!({"vtep_name": "a-very-long-vtep-name"}),
            serde_json::json!({"controller_url": "ftp://x"}),
            serde_json::json!({"datastore_file_owner": "vcap"}),
            serde_json::json!({"outbound_connections": {"limit": true, "rate_per_sec": 0}}),
            serde_json::json!({"outbound_connections": {"limit": true, "burst": 0}}),
        ] {
            let err = daemon(patch.clone()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{patch}: {err}");
        }
    }

    #[test]
    fn daemon_requires_fields() {
        let err = DaemonConfig::from_json(Path::new("x"), r#"{"underlay_ip": "10.0.0.1"}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        let err = daemon(serde_json::json!({"bogus_key": 1})).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reports_io() {
        let err = DaemonConfig::load("/nonexistent/trellisd.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn controller_defaults() {
        let cfg = ControllerConfig::from_json(
            Path::new("c.json"),
            r#"{
                "listen_address": "0.0.0.0:4003",
                "database_path": "/var/lib/trellis/leases.db",
                "overlay_network": "10.255.0.0/16",
                "subnet_prefix_length": 24
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.lease_expiration(), Duration::from_secs(60));
        assert_eq!(cfg.staleness_sweep_interval(), Duration::from_secs(30));
        assert_eq!(cfg.tag_length, 2);
        assert!(cfg.policy_file.is_none());
    }
}
