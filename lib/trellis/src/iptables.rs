// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The host packet filter.
//!
//! [`Iptables`] is the seam between the policy converger and the
//! kernel. [`IptablesCmd`] drives the `iptables` tooling directly and
//! [`LockedIptables`] serializes any implementation against every other
//! process on the host that shares the same lock file (the CNI plug-in
//! takes the same lock).

use crate::filelock::FileLock;
use async_trait::async_trait;
use core::fmt;
use core::fmt::Display;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

pub const FILTER: &str = "filter";
pub const NAT: &str = "nat";

/// The longest chain name the kernel accepts.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

const CHAIN_ABSENT_MSGS: [&str; 2] =
    ["No chain/target/match by that name", "does not exist"];

#[derive(Debug, Error)]
pub enum IptablesError {
    /// The named chain, target or match is not there.
    #[error("{0}")]
    ChainAbsent(String),

    #[error("lock: {0}")]
    LockAcquisition(String),

    /// The tool failed for a reason other than a missing chain.
    #[error("iptables call: {0}")]
    Transport(String),

    /// The tool rejected the rule text.
    #[error("invalid rule: {0}")]
    Parse(String),
}

impl IptablesError {
    /// Deleting something that is not there is not an error for
    /// callers that delete idempotently.
    pub fn is_chain_absent(&self) -> bool {
        matches!(self, Self::ChainAbsent(_))
    }

    /// Classify the stderr of a failed tool invocation.
    pub fn from_stderr(status: Option<i32>, stderr: &str) -> Self {
        let msg = stderr.trim().to_string();
        if CHAIN_ABSENT_MSGS.iter().any(|m| msg.contains(m)) {
            Self::ChainAbsent(msg)
        } else if status == Some(2)
            || msg.contains("Bad argument")
            || msg.contains("unknown option")
        {
            Self::Parse(msg)
        } else {
            Self::Transport(msg)
        }
    }
}

/// Treat a missing chain as success.
pub fn ignore_absent(res: Result<(), IptablesError>) -> Result<(), IptablesError> {
    match res {
        Err(e) if e.is_chain_absent() => Ok(()),
        other => other,
    }
}

/// One rule, as the argument list following `-A <chain>`.
#[derive(
    Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct IptablesRule(Vec<String>);

impl IptablesRule {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    /// Parse a rule from a line of `iptables -S` output for `chain`.
    pub fn from_list_line(chain: &str, line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        if words.next()? != "-A" || words.next()? != chain {
            return None;
        }
        Some(Self::new(words))
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    /// The chain this rule jumps or goes to, if any.
    pub fn target(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|w| matches!(w[0].as_str(), "-j" | "--jump" | "-g" | "--goto"))
            .map(|w| w[1].as_str())
    }

    /// The chain this rule goes to with `-g`, if any.
    pub fn goto_target(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|w| matches!(w[0].as_str(), "-g" | "--goto"))
            .map(|w| w[1].as_str())
    }
}

impl Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// A complete `iptables-save` style dump for one or more tables.
///
/// Restoring a dump without `--noflush` replaces the full contents of
/// every table it names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RestoreDump {
    tables: BTreeMap<String, TableDump>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct TableDump {
    policies: Vec<(String, String)>,
    chains: Vec<String>,
    rules: Vec<(String, IptablesRule)>,
}

impl RestoreDump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in chain of `filter` and `nat` at `ACCEPT` and no
    /// user chains.
    pub fn reset() -> Self {
        let mut dump = Self::new();
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            dump = dump.policy(FILTER, chain, "ACCEPT");
        }
        for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            dump = dump.policy(NAT, chain, "ACCEPT");
        }
        dump
    }

    /// Name `table` with no content, so restoring flushes it.
    pub fn table(mut self, table: &str) -> Self {
        self.tables.entry(table.to_string()).or_default();
        self
    }

    pub fn policy(mut self, table: &str, chain: &str, policy: &str) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .policies
            .push((chain.to_string(), policy.to_string()));
        self
    }

    pub fn chain(mut self, table: &str, chain: &str) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .chains
            .push(chain.to_string());
        self
    }

    pub fn rule(mut self, table: &str, chain: &str, rule: IptablesRule) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .rules
            .push((chain.to_string(), rule));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // An empty dump still has to name a table to be accepted.
        if self.tables.is_empty() {
            out.push_str("*filter\nCOMMIT\n");
            return out;
        }

        for (name, t) in &self.tables {
            out.push_str(&format!("*{name}\n"));
            for (chain, policy) in &t.policies {
                out.push_str(&format!(":{chain} {policy} [0:0]\n"));
            }
            for chain in &t.chains {
                out.push_str(&format!(":{chain} - [0:0]\n"));
            }
            for (chain, rule) in &t.rules {
                out.push_str(&format!("-A {chain} {rule}\n"));
            }
            out.push_str("COMMIT\n");
        }
        out
    }
}

impl Display for RestoreDump {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Operations on the host packet filter.
#[async_trait]
pub trait Iptables: Send + Sync {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Remove every rule from `chain`.
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    async fn exists(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<bool, IptablesError>;

    /// Delete the first rule of `chain` equal to `rule`.
    async fn delete(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<(), IptablesError>;

    /// Insert `rules` so that the first of them lands at `pos`
    /// (1-based) and their relative order is kept.
    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError>;

    async fn bulk_append(
        &self,
        table: &str,
        chain: &str,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError>;

    /// The rules of `chain` in `iptables -S` form, starting with the
    /// `-N` line.
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError>;

    async fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError>;

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError> {
        Ok(self.list_chains(table).await?.iter().any(|c| c == chain))
    }

    /// Replace the complete contents of every table in `dump` in one
    /// transaction.
    async fn flush_and_restore(&self, dump: &str) -> Result<(), IptablesError>;

    /// The number of rules across every chain of `table`.
    async fn rule_count(&self, table: &str) -> Result<usize, IptablesError>;
}

/// Drive the host packet filter through the `iptables` tools.
#[derive(Clone, Debug)]
pub struct IptablesCmd {
    iptables: PathBuf,
    restore: PathBuf,
}

impl Default for IptablesCmd {
    fn default() -> Self {
        Self::new("iptables", "iptables-restore")
    }
}

impl IptablesCmd {
    pub fn new(iptables: impl Into<PathBuf>, restore: impl Into<PathBuf>) -> Self {
        Self { iptables: iptables.into(), restore: restore.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, IptablesError> {
        let out = Command::new(&self.iptables)
            .arg("-w")
            .args(args)
            .output()
            .await
            .map_err(|e| {
                IptablesError::Transport(format!(
                    "exec {}: {e}",
                    self.iptables.display()
                ))
            })?;

        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(IptablesError::from_stderr(
                out.status.code(),
                &String::from_utf8_lossy(&out.stderr),
            ))
        }
    }

    /// Feed `input` to `iptables-restore`.
    async fn restore(&self, input: &str, noflush: bool) -> Result<(), IptablesError> {
        let mut cmd = Command::new(&self.restore);
        if noflush {
            cmd.arg("--noflush");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                IptablesError::Transport(format!(
                    "exec {}: {e}",
                    self.restore.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| IptablesError::Transport(format!("write restore input: {e}")))?;
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| IptablesError::Transport(format!("wait for restore: {e}")))?;

        if out.status.success() {
            Ok(())
        } else {
            Err(IptablesError::from_stderr(
                out.status.code(),
                &String::from_utf8_lossy(&out.stderr),
            ))
        }
    }

    fn with_rule<'a>(prefix: &[&'a str], rule: &'a IptablesRule) -> Vec<&'a str> {
        let mut args = prefix.to_vec();
        args.extend(rule.args().iter().map(String::as_str));
        args
    }
}

/// Render a `--noflush` restore input that appends or inserts `rules`.
pub fn render_bulk(
    table: &str,
    chain: &str,
    pos: Option<usize>,
    rules: &[IptablesRule],
) -> String {
    let mut out = format!("*{table}\n");
    for (i, rule) in rules.iter().enumerate() {
        match pos {
            Some(p) => out.push_str(&format!("-I {chain} {} {rule}\n", p + i)),
            None => out.push_str(&format!("-A {chain} {rule}\n")),
        }
    }
    out.push_str("COMMIT\n");
    out
}

#[async_trait]
impl Iptables for IptablesCmd {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-N", chain]).await.map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-X", chain]).await.map(|_| ())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.run(&["-t", table, "-F", chain]).await.map(|_| ())
    }

    async fn exists(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<bool, IptablesError> {
        let args = Self::with_rule(&["-t", table, "-C", chain], rule);
        match self.run(&args).await {
            Ok(_) => Ok(true),
            // `-C` reports a missing rule with a generic failure.
            Err(IptablesError::Transport(_)) | Err(IptablesError::ChainAbsent(_)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<(), IptablesError> {
        let args = Self::with_rule(&["-t", table, "-D", chain], rule);
        self.run(&args).await.map(|_| ())
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        if rules.is_empty() {
            return Ok(());
        }
        self.restore(&render_bulk(table, chain, Some(pos), rules), true).await
    }

    async fn bulk_append(
        &self,
        table: &str,
        chain: &str,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        if rules.is_empty() {
            return Ok(());
        }
        self.restore(&render_bulk(table, chain, None, rules), true).await
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        let out = self.run(&["-t", table, "-S", chain]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        let out = self.run(&["-t", table, "-S"]).await?;
        Ok(out
            .lines()
            .filter_map(|l| {
                let mut w = l.split_whitespace();
                match w.next() {
                    Some("-P") | Some("-N") => w.next().map(str::to_string),
                    _ => None,
                }
            })
            .collect())
    }

    async fn flush_and_restore(&self, dump: &str) -> Result<(), IptablesError> {
        self.restore(dump, false).await
    }

    async fn rule_count(&self, table: &str) -> Result<usize, IptablesError> {
        let out = self.run(&["-t", table, "-S"]).await?;
        Ok(out.lines().filter(|l| l.starts_with("-A ")).count())
    }
}

/// Serialize every call to an [`Iptables`] behind a process-local
/// mutex and the host-wide lock file.
pub struct LockedIptables<T> {
    inner: T,
    mutex: Mutex<()>,
    lock: FileLock,
}

impl<T: Iptables> LockedIptables<T> {
    pub fn new(inner: T, lock_file: impl Into<PathBuf>) -> Self {
        Self { inner, mutex: Mutex::new(()), lock: FileLock::new(lock_file) }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

// Take the process mutex, then the file lock, for the duration of one
// call.
macro_rules! locked {
    ($self:ident, $call:expr) => {{
        let _m = $self.mutex.lock().await;
        let _f = $self
            .lock
            .lock()
            .await
            .map_err(|e| IptablesError::LockAcquisition(e.to_string()))?;
        $call.await
    }};
}

#[async_trait]
impl<T: Iptables> Iptables for LockedIptables<T> {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        locked!(self, self.inner.new_chain(table, chain))
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        locked!(self, self.inner.delete_chain(table, chain))
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        locked!(self, self.inner.clear_chain(table, chain))
    }

    async fn exists(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<bool, IptablesError> {
        locked!(self, self.inner.exists(table, chain, rule))
    }

    async fn delete(
        &self,
        table: &str,
        chain: &str,
        rule: &IptablesRule,
    ) -> Result<(), IptablesError> {
        locked!(self, self.inner.delete(table, chain, rule))
    }

    async fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        locked!(self, self.inner.bulk_insert(table, chain, pos, rules))
    }

    async fn bulk_append(
        &self,
        table: &str,
        chain: &str,
        rules: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        locked!(self, self.inner.bulk_append(table, chain, rules))
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        locked!(self, self.inner.list(table, chain))
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        locked!(self, self.inner.list_chains(table))
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError> {
        locked!(self, self.inner.chain_exists(table, chain))
    }

    async fn flush_and_restore(&self, dump: &str) -> Result<(), IptablesError> {
        locked!(self, self.inner.flush_and_restore(dump))
    }

    async fn rule_count(&self, table: &str) -> Result<usize, IptablesError> {
        locked!(self, self.inner.rule_count(table))
    }
}
