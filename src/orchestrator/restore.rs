//! In-place and point-in-time restore through pgBackRest.
//!
//! Destructive: the cluster's data directory is overwritten. A failure after
//! the service was stopped leaves it stopped.

use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{as_postgres, as_root, quote};
use crate::gateway::{HostTarget, RemoteCommand, RemoteExecutor};
use crate::orchestrator::progress::RunLog;
use crate::orchestrator::stream_to_log;
use crate::stanza::{self, PreparedStanza};
use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestoreTarget {
    /// Most recent backup plus all archived WAL.
    #[default]
    Latest,
    BackupRun { backup_run_id: i64 },
    PointInTime { target_time: DateTime<Utc> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
    pub database_id: i64,
    #[serde(default)]
    pub target: RestoreTarget,
}

/// Resolved restore: what the pgBackRest command needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorePoint {
    Latest,
    Label(String),
    Time(DateTime<Utc>),
}

/// Extra `pgbackrest restore` options for `point`.
pub fn restore_options(point: &RestorePoint) -> String {
    match point {
        RestorePoint::Latest => String::new(),
        RestorePoint::Label(label) => format!(" --set={}", quote(label)),
        RestorePoint::Time(ts) => format!(
            " --type=time --target={} --target-action=promote",
            quote(&ts.format("%Y-%m-%d %H:%M:%S%:z").to_string())
        ),
    }
}

pub fn restore_command(stanza: &str, point: &RestorePoint) -> RemoteCommand {
    RemoteCommand::new(as_postgres(&format!(
        "pgbackrest --stanza={stanza} --delta --log-level-console=info{} restore",
        restore_options(point)
    )))
}

pub struct RestorePlan {
    pub prepared: PreparedStanza,
    pub point: RestorePoint,
    pub conf_dir: String,
    pub health_retry_delay: Duration,
}

pub async fn run_restore(
    remote: &dyn RemoteExecutor,
    log: &RunLog,
    plan: &RestorePlan,
    timeout: Duration,
) -> KeeperResult<()> {
    let host_row = &plan.prepared.host;
    let host = HostTarget::from(host_row);
    let document = &plan.prepared.document;

    log.line("Applying backup configuration").await;
    let applied = stanza::apply(remote, &host, document, &plan.conf_dir, timeout).await?;
    log.line(&applied).await;

    log.line("Stopping PostgreSQL service").await;
    let stop = RemoteCommand::new(as_root("systemctl stop postgresql"));
    remote.execute(&host, &stop, timeout).await?.check()?;

    match &plan.point {
        RestorePoint::Latest => log.line("Restoring latest backup").await,
        RestorePoint::Label(label) => log.line(&format!("Restoring backup {label}")).await,
        RestorePoint::Time(ts) => log.line(&format!("Restoring to point in time {ts}")).await,
    }
    info!(run_id = log.run_id(), host = %host.name, stanza = %document.stanza(), point = ?plan.point, "restore started");
    stream_to_log(
        remote,
        log,
        &host,
        &restore_command(document.stanza(), &plan.point),
        timeout,
    )
    .await?
    .check()?;

    log.line("Starting PostgreSQL service").await;
    let start = RemoteCommand::new(as_root("systemctl start postgresql"));
    remote.execute(&host, &start, timeout).await?.check()?;

    log.line("Verifying service health").await;
    let readiness = RemoteCommand::new(format!("pg_isready -h localhost -p {}", host_row.pg_port));
    let policy = ConstantBuilder::default()
        .with_delay(plan.health_retry_delay)
        .with_max_times(10);
    let ready = (|| async { remote.execute(&host, &readiness, timeout).await?.check() })
        .retry(policy)
        .notify(|err: &KeeperError, dur: Duration| {
            warn!(host = %host.name, error = %err, "PostgreSQL not accepting connections yet, retrying after {:?}", dur);
        })
        .await?;
    log.line(&ready.combined()).await;

    log.line("Restore completed successfully").await;
    Ok(())
}
