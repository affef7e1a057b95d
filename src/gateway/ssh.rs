use super::{ExecOutput, HostTarget, RemoteCommand, RemoteExecutor};
use crate::error::{KeeperError, KeeperResult};
use crate::vault::{SecretKind, Vault};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::ChannelMsg;
use russh::client::{AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{HashAlg, PrivateKey, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

/// Accepts any server key unless a SHA256 fingerprint is pinned for the host.
struct ClientHandler {
    pinned_fingerprint: Option<String>,
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = self.pinned_fingerprint.as_deref() else {
            return Ok(true);
        };
        let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if actual != expected {
            warn!(expected, actual = %actual, "server host key does not match pinned fingerprint");
        }
        Ok(actual == expected)
    }
}

enum ConnectFailure {
    /// Network trouble; worth another attempt.
    Transient(String),
    /// Key or host-key rejection; retrying cannot help.
    Rejected(String),
}

impl From<ConnectFailure> for KeeperError {
    fn from(f: ConnectFailure) -> Self {
        match f {
            ConnectFailure::Transient(msg) | ConnectFailure::Rejected(msg) => {
                KeeperError::Connectivity(msg)
            }
        }
    }
}

/// One cached connection. The mutex is held for the duration of each
/// command, so commands against one host run one at a time.
struct HostSession {
    endpoint: (String, u16, String),
    handle: Mutex<Option<Handle<ClientHandler>>>,
}

pub struct SshGateway {
    vault: Vault,
    config: Arc<Config>,
    connect_timeout: Duration,
    sessions: RwLock<HashMap<i64, Arc<HostSession>>>,
}

impl SshGateway {
    pub fn new(vault: Vault, connect_timeout: Duration) -> Self {
        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            vault,
            config: Arc::new(config),
            connect_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn session_for(&self, host: &HostTarget) -> Arc<HostSession> {
        let endpoint = (host.address.clone(), host.ssh_port, host.username.clone());
        if let Some(s) = self.sessions.read().await.get(&host.host_id) {
            if s.endpoint == endpoint {
                return s.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        match sessions.get(&host.host_id) {
            Some(s) if s.endpoint == endpoint => s.clone(),
            _ => {
                let s = Arc::new(HostSession {
                    endpoint,
                    handle: Mutex::new(None),
                });
                sessions.insert(host.host_id, s.clone());
                s
            }
        }
    }

    fn load_key(&self, host: &HostTarget) -> KeeperResult<Arc<PrivateKey>> {
        let pem = self
            .vault
            .open(SecretKind::SshPrivateKey, &host.sealed_private_key)?;
        let key = russh::keys::decode_secret_key(pem.expose(), None)
            .map_err(|e| KeeperError::config(format!("host {}: unusable private key: {e}", host.name)))?;
        Ok(Arc::new(key))
    }

    /// Connect and authenticate, retrying transient failures briefly.
    async fn connect(&self, host: &HostTarget) -> KeeperResult<Handle<ClientHandler>> {
        let key = self.load_key(host)?;
        let policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(4))
            .with_max_times(2)
            .with_jitter();

        let handle = (|| async { self.connect_once(host, key.clone()).await })
            .retry(policy)
            .when(|e| matches!(e, ConnectFailure::Transient(_)))
            .notify(|err, dur: Duration| {
                if let ConnectFailure::Transient(msg) = err {
                    warn!(host = %host.name, error = %msg, "SSH connect failed, retrying after {:?}", dur);
                }
            })
            .await?;
        info!(host = %host.name, address = %host.address, "SSH session established");
        Ok(handle)
    }

    async fn connect_once(
        &self,
        host: &HostTarget,
        key: Arc<PrivateKey>,
    ) -> Result<Handle<ClientHandler>, ConnectFailure> {
        let handler = ClientHandler {
            pinned_fingerprint: host.host_key_fingerprint.clone(),
        };
        let addr = (host.address.clone(), host.ssh_port);
        let connecting = russh::client::connect(self.config.clone(), addr, handler);
        let mut handle = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Err(_) => {
                return Err(ConnectFailure::Transient(format!(
                    "{}:{} did not answer within {:?}",
                    host.address, host.ssh_port, self.connect_timeout
                )));
            }
            Ok(Err(russh::Error::UnknownKey)) => {
                return Err(ConnectFailure::Rejected(format!(
                    "{}: server host key rejected",
                    host.address
                )));
            }
            Ok(Err(e)) => {
                return Err(ConnectFailure::Transient(format!(
                    "{}:{}: {e}",
                    host.address, host.ssh_port
                )));
            }
            Ok(Ok(h)) => h,
        };

        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| ConnectFailure::Transient(e.to_string()))?
            .flatten();
        let result = handle
            .authenticate_publickey(host.username.clone(), PrivateKeyWithHashAlg::new(key, hash))
            .await
            .map_err(|e| ConnectFailure::Transient(e.to_string()))?;
        match result {
            AuthResult::Success => Ok(handle),
            AuthResult::Failure { .. } => Err(ConnectFailure::Rejected(format!(
                "{}@{}: public key authentication rejected",
                host.username, host.address
            ))),
        }
    }

    async fn run(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        lines: Option<&mpsc::UnboundedSender<String>>,
    ) -> KeeperResult<ExecOutput> {
        let session = self.session_for(host).await;
        let mut guard = session.handle.lock().await;
        if guard.as_ref().is_none_or(|h| h.is_closed()) {
            *guard = Some(self.connect(host).await?);
        }
        let Some(handle) = guard.as_ref() else {
            return Err(KeeperError::Connectivity(format!("{}: session lost", host.name)));
        };

        debug!(host = %host.name, command = %command, "executing remote command");
        let mut chan = match handle.channel_open_session().await {
            Ok(chan) => chan,
            Err(e) => {
                // stale session; drop it so the next call reconnects
                guard.take();
                return Err(KeeperError::Connectivity(format!("{}: open channel: {e}", host.name)));
            }
        };
        chan.exec(true, command.script())
            .await
            .map_err(|e| KeeperError::Connectivity(format!("{}: exec request: {e}", host.name)))?;

        let mut capture = Capture::default();
        while let Some(msg) = chan.wait().await {
            let done = capture.apply(&msg);
            if let Some(tx) = lines {
                for line in capture.drain_lines() {
                    let _ = tx.send(line);
                }
            }
            if done {
                break;
            }
        }
        if let Some(tx) = lines {
            for line in capture.flush_lines() {
                let _ = tx.send(line);
            }
        }
        let _ = chan.close().await;
        Ok(capture.finish())
    }

    async fn bounded(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
        lines: Option<&mpsc::UnboundedSender<String>>,
    ) -> KeeperResult<ExecOutput> {
        match tokio::time::timeout(timeout, self.run(host, command, lines)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(host = %host.name, command = %command, "remote command exceeded {:?}", timeout);
                Err(KeeperError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshGateway {
    async fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> KeeperResult<ExecOutput> {
        self.bounded(host, command, timeout, None).await
    }

    async fn execute_streaming(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
    ) -> KeeperResult<ExecOutput> {
        self.bounded(host, command, timeout, Some(&lines)).await
    }

    /// Uses a throwaway connection so it never waits behind a long command.
    async fn test_connection(&self, host: &HostTarget) -> KeeperResult<()> {
        let key = self.load_key(host)?;
        let handle = self.connect_once(host, key).await?;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }

    async fn forget(&self, host_id: i64) {
        if let Some(session) = self.sessions.write().await.remove(&host_id) {
            if let Some(handle) = session.handle.lock().await.take() {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await;
            }
        }
    }
}

/// Accumulates channel output; complete lines are handed out as they form.
#[derive(Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    pending: Vec<u8>,
    ready: Vec<String>,
}

impl Capture {
    /// Returns true once the channel is finished.
    fn apply(&mut self, msg: &ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(data);
                self.feed(data);
                false
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                self.stderr.extend_from_slice(data);
                self.feed(data);
                false
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_code = Some(*exit_status as i32);
                false
            }
            ChannelMsg::ExitSignal { .. } => {
                self.exit_code.get_or_insert(-1);
                false
            }
            ChannelMsg::Close => true,
            _ => false,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.ready.push(text.trim_end_matches('\r').to_string());
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ready)
    }

    fn flush_lines(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.ready.push(String::from_utf8_lossy(&rest).into_owned());
        }
        self.drain_lines()
    }

    fn finish(self) -> ExecOutput {
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code.unwrap_or(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Capture;
    use russh::{ChannelMsg, CryptoVec};

    #[test]
    fn capture_accumulates_output() {
        let mut c = Capture::default();
        let msg = ChannelMsg::Data {
            data: CryptoVec::from_slice(b"hi"),
        };
        assert!(!c.apply(&msg));
        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"err"),
            ext: 1,
        };
        assert!(!c.apply(&msg));
        assert!(!c.apply(&ChannelMsg::ExitStatus { exit_status: 42 }));
        assert!(c.apply(&ChannelMsg::Close));

        let out = c.finish();
        assert_eq!(out.stdout, "hi");
        assert_eq!(out.stderr, "err");
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn capture_splits_lines_across_chunks() {
        let mut c = Capture::default();
        c.apply(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"INFO: backup start\nINFO: ba"),
        });
        assert_eq!(c.drain_lines(), vec!["INFO: backup start".to_string()]);
        c.apply(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"ckup size = 3MB\r\npartial"),
        });
        assert_eq!(c.drain_lines(), vec!["INFO: backup size = 3MB".to_string()]);
        assert_eq!(c.flush_lines(), vec!["partial".to_string()]);
    }

    #[test]
    fn missing_exit_status_is_reported_as_failure() {
        let mut c = Capture::default();
        assert!(c.apply(&ChannelMsg::Close));
        assert_eq!(c.finish().exit_code, -1);
    }
}
