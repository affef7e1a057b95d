//! Restore / Import Orchestrator.
//!
//! Both workflows return a run id at once and carry on in a detached task.
//! Callers follow along by polling the run row. A safety timeout bounds how
//! long a run may stay in progress; when it fires the run is failed and the
//! remote command is abandoned, not killed.

pub mod import;
pub mod progress;
pub mod restore;

pub use import::{ImportSource, SourceConnection};
pub use progress::{ProgressEvent, RunLog, infer_stage};
pub use restore::{RestoreRequest, RestoreTarget};

use crate::db::{
    BackupStatus, DbHost, InstallState, KeeperStorage, RestoreKind, RestoreStatus,
};
use crate::error::{KeeperError, KeeperResult};
use crate::executor::HostLocks;
use crate::gateway::shell::validate_identifier;
use crate::gateway::{ExecOutput, HostTarget, RemoteCommand, RemoteExecutor};
use crate::stanza::{self, SynthSettings};
use crate::vault::Vault;
use chrono::Utc;
use futures::StreamExt;
use import::ImportPlan;
use restore::{RestorePlan, RestorePoint};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub database_id: i64,
    #[serde(flatten)]
    pub source: ImportSource,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub synth: SynthSettings,
    pub command_timeout: Duration,
    pub safety_timeout: Duration,
    pub health_retry_delay: Duration,
}

#[derive(Clone)]
pub struct Orchestrator {
    storage: KeeperStorage,
    vault: Vault,
    remote: Arc<dyn RemoteExecutor>,
    settings: OrchestratorSettings,
    host_locks: HostLocks,
}

impl Orchestrator {
    pub fn new(
        storage: KeeperStorage,
        vault: Vault,
        remote: Arc<dyn RemoteExecutor>,
        settings: OrchestratorSettings,
        host_locks: HostLocks,
    ) -> Self {
        Self {
            storage,
            vault,
            remote,
            settings,
            host_locks,
        }
    }

    /// Validate the request, claim the host and start the restore in the
    /// background. Returns the new run's id.
    pub async fn start_restore(&self, request: RestoreRequest) -> KeeperResult<i64> {
        let database = self.storage.get_database(request.database_id).await?;
        let host = self.storage.get_host(database.host_id).await?;
        require_initialized(&host)?;
        let job = self
            .storage
            .job_for_database(database.id)
            .await?
            .ok_or_else(|| {
                KeeperError::config(format!(
                    "database {} has no backup job to restore from",
                    database.name
                ))
            })?;

        let (backup_run_id, recovery_target, point) = match request.target {
            RestoreTarget::Latest => (None, None, RestorePoint::Latest),
            RestoreTarget::BackupRun { backup_run_id } => {
                let run = self.storage.get_backup_run(backup_run_id).await?;
                if run.job_id != job.id {
                    return Err(KeeperError::config(format!(
                        "backup run {backup_run_id} does not belong to database {}",
                        database.name
                    )));
                }
                if run.status != BackupStatus::Success || run.pruned {
                    return Err(KeeperError::config(format!(
                        "backup run {backup_run_id} is not restorable ({}{})",
                        run.status,
                        if run.pruned { ", pruned" } else { "" }
                    )));
                }
                let label = run.repository_path.ok_or_else(|| {
                    KeeperError::config(format!("backup run {backup_run_id} has no backup label"))
                })?;
                (Some(backup_run_id), None, RestorePoint::Label(label))
            }
            RestoreTarget::PointInTime { target_time } => {
                if target_time > Utc::now() {
                    return Err(KeeperError::config("point-in-time target is in the future"));
                }
                (None, Some(target_time), RestorePoint::Time(target_time))
            }
        };

        let guard = self.claim_host(&host)?;
        let run_id = self
            .storage
            .create_restore_run(database.id, RestoreKind::Restore, backup_run_id, recovery_target)
            .await?;
        info!(run_id, database = %database.name, host = %host.name, "restore requested");

        let this = self.clone();
        self.supervise(run_id, guard, async move {
            let prepared =
                stanza::prepare(&this.storage, &this.vault, &this.settings.synth, job).await?;
            let plan = RestorePlan {
                prepared,
                point,
                conf_dir: this.settings.synth.conf_dir.clone(),
                health_retry_delay: this.settings.health_retry_delay,
            };
            let log = RunLog::new(this.storage.clone(), run_id);
            restore::run_restore(
                this.remote.as_ref(),
                &log,
                &plan,
                this.settings.command_timeout,
            )
            .await
        });
        Ok(run_id)
    }

    /// Validate and normalize the source, claim the host and start the import
    /// in the background. Returns the new run's id.
    pub async fn start_import(&self, request: ImportRequest) -> KeeperResult<i64> {
        let source = request.source.normalize()?;
        let database = self.storage.get_database(request.database_id).await?;
        validate_identifier("database name", &database.name)?;
        let host = self.storage.get_host(database.host_id).await?;
        require_initialized(&host)?;
        let owner = self
            .storage
            .list_users(database.id)
            .await?
            .into_iter()
            .find(|u| u.is_primary)
            .map(|u| u.username);

        let guard = self.claim_host(&host)?;
        let run_id = self
            .storage
            .create_restore_run(database.id, RestoreKind::Import, None, None)
            .await?;
        info!(run_id, database = %database.name, host = %host.name, source = %source.host, "import requested");

        let plan = ImportPlan {
            host: HostTarget::from(&host),
            target: database.name,
            owner,
            source,
            stamp: Utc::now().timestamp(),
        };
        let this = self.clone();
        self.supervise(run_id, guard, async move {
            let log = RunLog::new(this.storage.clone(), run_id);
            import::run_import(
                this.remote.as_ref(),
                &log,
                &plan,
                this.settings.command_timeout,
            )
            .await
        });
        Ok(run_id)
    }

    fn claim_host(&self, host: &DbHost) -> KeeperResult<OwnedRwLockWriteGuard<()>> {
        self.host_locks.try_exclusive(host.id).ok_or_else(|| {
            KeeperError::Conflict(format!(
                "host {} is busy with a backup, restore or import",
                host.name
            ))
        })
    }

    /// Drive `work` to a terminal status under the safety timeout. The host
    /// claim is released when the task ends either way.
    fn supervise<F>(&self, run_id: i64, guard: OwnedRwLockWriteGuard<()>, work: F)
    where
        F: Future<Output = KeeperResult<()>> + Send + 'static,
    {
        let storage = self.storage.clone();
        let safety = self.settings.safety_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            let log = RunLog::new(storage.clone(), run_id);
            if let Err(e) = storage.mark_restore_running(run_id).await {
                warn!(run_id, error = %e, "failed to mark run as running");
            }

            let (status, detail) = match tokio::time::timeout(safety, work).await {
                Ok(Ok(())) => (RestoreStatus::Success, None),
                Ok(Err(e)) => {
                    log.line(&format!("ERROR: {e}")).await;
                    let detail = match &e {
                        KeeperError::RemoteCommand { summary, .. } if !summary.is_empty() => {
                            summary.clone()
                        }
                        other => other.to_string(),
                    };
                    (RestoreStatus::Failed, Some(detail))
                }
                Err(_) => {
                    let message = format!(
                        "Operation timed out after {safety:?}; the remote process may still be running"
                    );
                    log.line(&message).await;
                    (RestoreStatus::Failed, Some(message))
                }
            };

            match storage.finish_restore_run(run_id, status, detail.as_deref()).await {
                Ok(true) => info!(run_id, status = %status, "run finished"),
                Ok(false) => warn!(run_id, "run was already finished"),
                Err(e) => error!(run_id, error = %e, "failed to record run outcome"),
            }
        });
    }
}

fn require_initialized(host: &DbHost) -> KeeperResult<()> {
    if host.install_state == InstallState::Initialized {
        Ok(())
    } else {
        Err(KeeperError::config(format!(
            "host {} is {}, restores and imports need an initialized host",
            host.name, host.install_state
        )))
    }
}

/// Run `command`, appending its output to the run log in batches as it arrives.
pub(crate) async fn stream_to_log(
    remote: &dyn RemoteExecutor,
    log: &RunLog,
    host: &HostTarget,
    command: &RemoteCommand,
    timeout: Duration,
) -> KeeperResult<ExecOutput> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = log.clone();
    let forwarder = tokio::spawn(async move {
        let mut batches = UnboundedReceiverStream::new(rx).ready_chunks(64);
        while let Some(lines) = batches.next().await {
            writer.line(&lines.join("\n")).await;
        }
    });
    let result = remote.execute_streaming(host, command, timeout, tx).await;
    let _ = forwarder.await;
    result
}
