//! Remote Execution Gateway: run commands on a named host.

pub mod shell;
pub mod ssh;

pub use ssh::SshGateway;

use crate::db::DbHost;
use crate::error::{KeeperError, KeeperResult};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connection details for one host, with the private key still sealed.
#[derive(Clone)]
pub struct HostTarget {
    pub host_id: i64,
    pub name: String,
    pub address: String,
    pub ssh_port: u16,
    pub username: String,
    pub sealed_private_key: String,
    pub host_key_fingerprint: Option<String>,
}

impl From<&DbHost> for HostTarget {
    fn from(h: &DbHost) -> Self {
        Self {
            host_id: h.id,
            name: h.name.clone(),
            address: h.address.clone(),
            ssh_port: h.ssh_port,
            username: h.ssh_username.clone(),
            sealed_private_key: h.ssh_private_key.clone(),
            host_key_fingerprint: h.host_key_fingerprint.clone(),
        }
    }
}

impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTarget")
            .field("host_id", &self.host_id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Script to run plus the form that is safe to log.
#[derive(Clone)]
pub struct RemoteCommand {
    script: String,
    display: String,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            display: script.clone(),
            script,
        }
    }

    /// For scripts carrying secrets; only `display` is ever logged.
    pub fn sensitive(script: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            display: display.into(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn display(&self) -> &str {
        &self.display
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteCommand").field(&self.display).finish()
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// Turn a nonzero exit into `RemoteCommand`.
    pub fn check(self) -> KeeperResult<ExecOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(KeeperError::RemoteCommand {
                exit_code: self.exit_code,
                summary: tail_lines(&self.combined(), 20),
            })
        }
    }
}

/// Last `n` non-empty lines of `text`, joined by newlines.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` with an upper bound of `timeout`. On timeout the remote
    /// process is left running.
    async fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> KeeperResult<ExecOutput>;

    /// Like `execute`, forwarding each output line to `lines` as it arrives.
    async fn execute_streaming(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> KeeperResult<ExecOutput> {
        let out = self.execute(host, command, timeout).await?;
        for line in out.combined().lines() {
            let _ = lines.send(line.to_string());
        }
        Ok(out)
    }

    /// Connect and authenticate without running anything.
    async fn test_connection(&self, host: &HostTarget) -> KeeperResult<()>;

    /// Drop any cached session for the host.
    async fn forget(&self, _host_id: i64) {}
}
