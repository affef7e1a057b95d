//! Server Provisioning Controller.
//!
//! `Unprovisioned -> Provisioning -> Initialized | Failed`. Both end states
//! are terminal: a failed host is deleted and registered again, partially
//! applied steps are left as they are.

use crate::db::{DbHost, InstallState, KeeperStorage};
use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{as_root, psql_each, quote, validate_path};
use crate::gateway::{HostTarget, RemoteCommand, RemoteExecutor};
use backon::{ConstantBuilder, Retryable};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const ARCHIVE_DISPATCHER: &str = "/usr/local/bin/pgkeeper-archive-push";

/// WAL settings applied with `ALTER SYSTEM`.
pub const ARCHIVE_SETTINGS: [(&str, &str); 5] = [
    ("wal_level", "replica"),
    ("archive_mode", "on"),
    ("archive_command", "/usr/local/bin/pgkeeper-archive-push %p"),
    ("max_wal_senders", "3"),
    ("archive_timeout", "60"),
];

#[derive(Debug, Clone)]
pub struct ProvisionStep {
    pub label: String,
    pub command: RemoteCommand,
}

/// Pushes a WAL segment to every stanza found in the config directory.
fn dispatcher_script(conf_dir: &str) -> String {
    format!(
        r#"#!/bin/sh
status=0
for conf in {conf_dir}/*.conf; do
    [ -e "$conf" ] || continue
    stanza=$(basename "$conf" .conf)
    pgbackrest --stanza="$stanza" archive-push "$1" || status=1
done
exit $status
"#
    )
}

/// The ordered command list for bootstrapping a Debian-family host.
pub fn provision_steps(pg_version: &str, conf_dir: &str) -> KeeperResult<Vec<ProvisionStep>> {
    if pg_version.is_empty() || !pg_version.chars().all(|c| c.is_ascii_digit()) {
        return Err(KeeperError::config(format!(
            "invalid PostgreSQL major version {pg_version:?}"
        )));
    }
    validate_path(conf_dir)?;

    let apt = "export DEBIAN_FRONTEND=noninteractive; ";
    let pgdg = "/usr/share/postgresql-common/pgdg";
    let alter_system: Vec<String> = ARCHIVE_SETTINGS
        .iter()
        .map(|(k, v)| format!("ALTER SYSTEM SET {k} = '{v}'"))
        .collect();
    let dispatcher = STANDARD.encode(dispatcher_script(conf_dir));

    Ok(vec![
        ProvisionStep {
            label: "refresh package index".into(),
            command: RemoteCommand::new(as_root(&format!(
                "{apt}apt-get update -y && \
                 apt-get install -y curl ca-certificates lsb-release && \
                 install -d {pgdg} && \
                 curl -fsSL -o {pgdg}/apt.postgresql.org.asc https://www.postgresql.org/media/keys/ACCC4CF8.asc && \
                 echo \"deb [signed-by={pgdg}/apt.postgresql.org.asc] https://apt.postgresql.org/pub/repos/apt $(lsb_release -cs)-pgdg main\" \
                 > /etc/apt/sources.list.d/pgdg.list && \
                 apt-get update -y"
            ))),
        },
        ProvisionStep {
            label: format!("install PostgreSQL {pg_version}"),
            command: RemoteCommand::new(as_root(&format!(
                "{apt}apt-get install -y postgresql-{pg_version} postgresql-client-{pg_version}"
            ))),
        },
        ProvisionStep {
            label: "install pgBackRest".into(),
            command: RemoteCommand::new(as_root(&format!("{apt}apt-get install -y pgbackrest"))),
        },
        ProvisionStep {
            label: "install WAL archive dispatcher".into(),
            command: RemoteCommand::new(as_root(&format!(
                "install -d -m 750 -o postgres -g postgres {conf} && \
                 printf %s {script} | base64 -d > {ARCHIVE_DISPATCHER} && \
                 chmod 755 {ARCHIVE_DISPATCHER}",
                conf = quote(conf_dir),
                script = quote(&dispatcher),
            ))),
        },
        ProvisionStep {
            label: "configure WAL archiving".into(),
            command: RemoteCommand::new(psql_each("postgres", &alter_system)),
        },
        ProvisionStep {
            label: "restart PostgreSQL".into(),
            command: RemoteCommand::new(as_root(
                "systemctl enable postgresql && systemctl restart postgresql",
            )),
        },
    ])
}

#[derive(Clone)]
pub struct Provisioner {
    storage: KeeperStorage,
    executor: Arc<dyn RemoteExecutor>,
    command_timeout: Duration,
    conf_dir: String,
    health_retry_delay: Duration,
}

impl Provisioner {
    pub fn new(
        storage: KeeperStorage,
        executor: Arc<dyn RemoteExecutor>,
        command_timeout: Duration,
        conf_dir: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            executor,
            command_timeout,
            conf_dir: conf_dir.into(),
            health_retry_delay: Duration::from_secs(3),
        }
    }

    pub fn with_health_retry_delay(mut self, delay: Duration) -> Self {
        self.health_retry_delay = delay;
        self
    }

    /// Claim the host for provisioning. Fails unless it is `Unprovisioned`.
    pub async fn begin(&self, host_id: i64) -> KeeperResult<DbHost> {
        let host = self.storage.get_host(host_id).await?;
        let claimed = self
            .storage
            .transition_host(host_id, InstallState::Unprovisioned, InstallState::Provisioning)
            .await?;
        if !claimed {
            return Err(KeeperError::Conflict(format!(
                "host {} is {}, only unprovisioned hosts can be provisioned",
                host.name, host.install_state
            )));
        }
        Ok(host)
    }

    /// Run every step on a host already claimed by `begin`.
    pub async fn run(&self, host: DbHost) -> KeeperResult<InstallState> {
        match self.run_steps(&host).await {
            Ok(()) => {
                self.storage
                    .transition_host(host.id, InstallState::Provisioning, InstallState::Initialized)
                    .await?;
                self.log(host.id, "provisioning complete\n").await;
                info!(host = %host.name, "host initialized");
                Ok(InstallState::Initialized)
            }
            Err(e) => {
                error!(host = %host.name, error = %e, "provisioning failed");
                self.log(host.id, &format!("provisioning failed: {e}\n")).await;
                self.storage
                    .transition_host(host.id, InstallState::Provisioning, InstallState::Failed)
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn provision(&self, host_id: i64) -> KeeperResult<InstallState> {
        let host = self.begin(host_id).await?;
        self.run(host).await
    }

    async fn run_steps(&self, host: &DbHost) -> KeeperResult<()> {
        let target = HostTarget::from(host);
        for step in provision_steps(&host.pg_version, &self.conf_dir)? {
            info!(host = %host.name, step = %step.label, "provisioning step");
            self.log(host.id, &format!("==> {}\n", step.label)).await;
            let out = self
                .executor
                .execute(&target, &step.command, self.command_timeout)
                .await?;
            self.log(host.id, &out.combined()).await;
            out.check()?;
        }

        self.log(host.id, "==> verify service health\n").await;
        let readiness = RemoteCommand::new(format!("pg_isready -h localhost -p {}", host.pg_port));
        let policy = ConstantBuilder::default()
            .with_delay(self.health_retry_delay)
            .with_max_times(5);
        let ready = (|| async {
            self.executor
                .execute(&target, &readiness, self.command_timeout)
                .await?
                .check()
        })
        .retry(policy)
        .notify(|err: &KeeperError, dur: Duration| {
            warn!(host = %host.name, error = %err, "PostgreSQL not ready, retrying after {:?}", dur);
        })
        .await?;
        self.log(host.id, &ready.combined()).await;

        let show = RemoteCommand::new(format!(
            "sudo -n -u postgres psql -X -tA -p {} -c 'SHOW data_directory'",
            host.pg_port
        ));
        let out = self
            .executor
            .execute(&target, &show, self.command_timeout)
            .await?
            .check()?;
        let data_dir = out.stdout.trim();
        if !data_dir.is_empty() {
            validate_path(data_dir)?;
            self.storage.set_data_dir(host.id, data_dir).await?;
            self.log(host.id, &format!("data directory: {data_dir}\n")).await;
        }
        Ok(())
    }

    async fn log(&self, host_id: i64, text: &str) {
        if let Err(e) = self.storage.append_provision_log(host_id, text).await {
            warn!(host_id, error = %e, "failed to append provision log");
        }
    }
}
