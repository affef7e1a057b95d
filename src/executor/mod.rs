//! Backup Executor: one run per invocation, outcome recorded, retention applied.

pub mod host_lock;
pub mod retention;

pub use host_lock::HostLocks;

use crate::db::{
    BackupKind, BackupStatus, DbBackupJob, DbBackupRun, InstallState, KeeperStorage,
};
use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{as_postgres, quote};
use crate::gateway::{ExecOutput, HostTarget, RemoteCommand, RemoteExecutor};
use crate::stanza::{self, SynthSettings};
use crate::vault::Vault;
use retention::{RepoBackup, parse_info, plan_retention};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, mpsc};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub synth: SynthSettings,
    pub command_timeout: Duration,
    pub max_incremental_chain: u32,
}

struct Completed {
    label: Option<String>,
    size_bytes: Option<i64>,
}

/// The host a run reached, held shared until retention is done with it.
struct HostClaim {
    host: HostTarget,
    stanza: String,
    _guard: OwnedRwLockReadGuard<()>,
}

#[derive(Clone)]
pub struct BackupExecutor {
    storage: KeeperStorage,
    vault: Vault,
    remote: Arc<dyn RemoteExecutor>,
    settings: ExecutorSettings,
    host_locks: HostLocks,
}

impl BackupExecutor {
    pub fn new(
        storage: KeeperStorage,
        vault: Vault,
        remote: Arc<dyn RemoteExecutor>,
        settings: ExecutorSettings,
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

    /// Incremental escalates to full when no full exists yet or the chain
    /// since the last full has reached its limit.
    pub async fn resolve_kind(&self, job: &DbBackupJob) -> KeeperResult<BackupKind> {
        if job.backup_kind == BackupKind::Full {
            return Ok(BackupKind::Full);
        }
        if !self.storage.has_successful_full(job.id).await? {
            return Ok(BackupKind::Full);
        }
        let chain = self.storage.incrementals_since_full(job.id).await?;
        if chain >= self.settings.max_incremental_chain {
            return Ok(BackupKind::Full);
        }
        Ok(BackupKind::Incremental)
    }

    /// Execute one backup of `job_id` and return the finished run.
    pub async fn run(&self, job_id: i64, trigger: Trigger) -> KeeperResult<DbBackupRun> {
        let job = self.storage.get_job(job_id).await?;
        let kind = self.resolve_kind(&job).await?;
        let run_id = self
            .storage
            .create_backup_run(job_id, kind, trigger == Trigger::Manual)
            .await?;
        info!(job_id, run_id, kind = %kind, ?trigger, "backup run started");
        if kind != job.backup_kind {
            self.log(
                run_id,
                "escalating incremental to full backup to bound the restore chain\n",
            )
            .await;
        }

        let mut claim: Option<HostClaim> = None;
        let outcome = self.execute(run_id, &job, kind, &mut claim).await;

        match outcome {
            Ok(done) => {
                self.storage
                    .finish_backup_run(
                        run_id,
                        BackupStatus::Success,
                        done.size_bytes,
                        done.label.as_deref(),
                        None,
                    )
                    .await?;
                info!(job_id, run_id, label = ?done.label, size = ?done.size_bytes, "backup succeeded");
            }
            Err(e) => {
                let summary = match &e {
                    KeeperError::RemoteCommand { summary, .. } if !summary.is_empty() => {
                        summary.clone()
                    }
                    other => other.to_string(),
                };
                self.log(run_id, &format!("ERROR: {e}\n")).await;
                self.storage
                    .finish_backup_run(run_id, BackupStatus::Failed, None, None, Some(&summary))
                    .await?;
                error!(job_id, run_id, error = %e, "backup failed");
            }
        }

        if let Some(claim) = claim {
            if let Err(e) = self
                .enforce_retention(run_id, &job, &claim.host, &claim.stanza)
                .await
            {
                warn!(job_id, run_id, error = %e, "retention enforcement failed");
                self.log(run_id, &format!("retention enforcement failed: {e}\n"))
                    .await;
            }
        }

        self.storage.get_backup_run(run_id).await
    }

    async fn execute(
        &self,
        run_id: i64,
        job: &DbBackupJob,
        kind: BackupKind,
        claim: &mut Option<HostClaim>,
    ) -> KeeperResult<Completed> {
        let prepared =
            stanza::prepare(&self.storage, &self.vault, &self.settings.synth, job.clone()).await?;
        let host = &prepared.host;
        if host.install_state != InstallState::Initialized {
            return Err(KeeperError::config(format!(
                "host {} is {}, backups need an initialized host",
                host.name, host.install_state
            )));
        }
        let guard = self.host_locks.try_shared(host.id).ok_or_else(|| {
            KeeperError::Conflict(format!("host {} is busy with a restore or import", host.name))
        })?;

        let host_target = HostTarget::from(host);
        let stanza_name = prepared.document.stanza().to_string();
        *claim = Some(HostClaim {
            host: host_target.clone(),
            stanza: stanza_name.clone(),
            _guard: guard,
        });

        self.log(run_id, "applying pgBackRest configuration\n").await;
        let apply_log = stanza::apply(
            self.remote.as_ref(),
            &host_target,
            &prepared.document,
            &self.settings.synth.conf_dir,
            self.settings.command_timeout,
        )
        .await?;
        self.log(run_id, &apply_log).await;

        let command = RemoteCommand::new(as_postgres(&format!(
            "pgbackrest --stanza={stanza_name} --type={} --log-level-console=info backup",
            kind.pgbackrest_type()
        )));
        let output = self.stream_command(run_id, &host_target, &command).await?;
        output.check()?;

        let backups = self.repo_backups(&host_target, &stanza_name).await?;
        let latest = backups.last();
        Ok(Completed {
            label: latest.map(|b| b.label.clone()),
            size_bytes: latest.and_then(|b| b.size_bytes),
        })
    }

    /// Runs `command`, appending each output line to the run log as it arrives.
    async fn stream_command(
        &self,
        run_id: i64,
        host: &HostTarget,
        command: &RemoteCommand,
    ) -> KeeperResult<ExecOutput> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let storage = self.storage.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = storage.append_backup_log(run_id, &format!("{line}\n")).await {
                    warn!(run_id, error = %e, "failed to append backup log");
                }
            }
        });
        let result = self
            .remote
            .execute_streaming(host, command, self.settings.command_timeout, tx)
            .await;
        let _ = forwarder.await;
        result
    }

    async fn repo_backups(&self, host: &HostTarget, stanza: &str) -> KeeperResult<Vec<RepoBackup>> {
        let cmd = RemoteCommand::new(as_postgres(&format!(
            "pgbackrest --stanza={stanza} --output=json info"
        )));
        let out = self
            .remote
            .execute(host, &cmd, self.settings.command_timeout)
            .await?
            .check()?;
        parse_info(&out.stdout, stanza)
    }

    /// Expire full backups beyond the job's retention count. Run rows are
    /// kept; the ones whose backups are gone are flagged as pruned.
    async fn enforce_retention(
        &self,
        run_id: i64,
        job: &DbBackupJob,
        host: &HostTarget,
        stanza: &str,
    ) -> KeeperResult<()> {
        let backups = self.repo_backups(host, stanza).await?;
        let expire = plan_retention(&backups, job.retention_count);
        for label in &expire {
            info!(job_id = job.id, run_id, label = %label, "expiring backup");
            let cmd = RemoteCommand::new(as_postgres(&format!(
                "pgbackrest --stanza={stanza} --set={} --log-level-console=info expire",
                quote(label)
            )));
            let out = self
                .remote
                .execute(host, &cmd, self.settings.command_timeout)
                .await?;
            self.log(run_id, &out.combined()).await;
            out.check()?;
        }

        let remaining: HashSet<String> = if expire.is_empty() {
            backups.into_iter().map(|b| b.label).collect()
        } else {
            self.repo_backups(host, stanza)
                .await?
                .into_iter()
                .map(|b| b.label)
                .collect()
        };
        let pruned: Vec<i64> = self
            .storage
            .list_backup_runs(job.id)
            .await?
            .into_iter()
            .filter(|r| r.status == BackupStatus::Success && !r.pruned)
            .filter(|r| {
                r.repository_path
                    .as_ref()
                    .is_some_and(|label| !remaining.contains(label))
            })
            .map(|r| r.id)
            .collect();
        if !pruned.is_empty() {
            self.storage.mark_pruned(&pruned).await?;
            self.log(
                run_id,
                &format!("retention: {} earlier backup(s) no longer in the repository\n", pruned.len()),
            )
            .await;
        }
        Ok(())
    }

    async fn log(&self, run_id: i64, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.storage.append_backup_log(run_id, text).await {
            warn!(run_id, error = %e, "failed to append backup log");
        }
    }
}
