//! Inventory operations. Every change to hosts, databases, storage targets
//! and jobs goes through here, so store writes and the live trigger set move
//! together.

use crate::db::{
    BackupKind, BackupStatus, DbBackupJob, DbBackupRun, DbDatabase, DbDatabaseUser, DbHost,
    DbStorageTarget, JobSpec, KeeperStorage, NewHost, NewStorageTarget, Permission, StorageKind,
};
use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{
    psql_each, sql_ident, validate_access_key, validate_bucket, validate_hostname,
    validate_identifier, validate_ini_value, validate_label, validate_path, validate_prefix,
    validate_region,
};
use crate::gateway::{HostTarget, RemoteCommand, RemoteExecutor};
use crate::orchestrator::import::derived_name;
use crate::scheduler::{CronSchedule, SchedulerHandle};
use crate::service::grants::{create_role, grant_script};
use crate::stanza::{repo_check_command, validate_retention};
use crate::vault::{Plaintext, SecretKind, Vault, generate_passphrase, generate_password};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_LOCAL_REPO_ROOT: &str = "/var/lib/pgbackrest";

#[derive(Clone, Deserialize)]
pub struct HostRegistration {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    pub ssh_username: String,
    pub ssh_private_key: String,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub pg_port: Option<u16>,
    #[serde(default)]
    pub pg_version: Option<String>,
}

impl fmt::Debug for HostRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistration")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("pg_version", &self.pg_version)
            .finish_non_exhaustive()
    }
}

/// A freshly created database and the one-time plaintext password of its
/// primary user.
#[derive(Debug)]
pub struct CreatedDatabase {
    pub database: DbDatabase,
    pub primary_user: DbDatabaseUser,
    pub password: Plaintext,
}

#[derive(Clone)]
pub struct Inventory {
    storage: KeeperStorage,
    vault: Vault,
    remote: Arc<dyn RemoteExecutor>,
    scheduler: SchedulerHandle,
    command_timeout: Duration,
    default_pg_version: String,
    local_repo_root: String,
}

/// A backup that can still be restored: successful and not yet expired.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPoint {
    pub backup_run_id: i64,
    pub label: String,
    pub backup_kind: BackupKind,
    pub completed_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<i64>,
}

impl Inventory {
    pub fn new(
        storage: KeeperStorage,
        vault: Vault,
        remote: Arc<dyn RemoteExecutor>,
        scheduler: SchedulerHandle,
        command_timeout: Duration,
        default_pg_version: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            vault,
            remote,
            scheduler,
            command_timeout,
            default_pg_version: default_pg_version.into(),
            local_repo_root: DEFAULT_LOCAL_REPO_ROOT.to_string(),
        }
    }

    /// Base path for `local` storage targets that carry no path of their own.
    pub fn with_local_repo_root(mut self, root: impl Into<String>) -> Self {
        self.local_repo_root = root.into();
        self
    }

    pub fn storage(&self) -> &KeeperStorage {
        &self.storage
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    // ---- hosts ----

    pub async fn register_host(&self, reg: HostRegistration) -> KeeperResult<DbHost> {
        let name = reg.name.trim();
        if name.is_empty() {
            return Err(KeeperError::config("host name is required"));
        }
        // the name becomes a segment of the repository path
        validate_label("host name", name)?;
        validate_hostname(&reg.address)?;
        let username = reg.ssh_username.trim();
        if username.is_empty()
            || !username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(KeeperError::config(format!("invalid ssh username {username:?}")));
        }
        let pg_version = reg
            .pg_version
            .clone()
            .unwrap_or_else(|| self.default_pg_version.clone());
        if pg_version.is_empty() || !pg_version.chars().all(|c| c.is_ascii_digit()) {
            return Err(KeeperError::config(format!(
                "invalid PostgreSQL major version {pg_version:?}"
            )));
        }
        russh::keys::decode_secret_key(&reg.ssh_private_key, None)
            .map_err(|e| KeeperError::config(format!("unusable ssh private key: {e}")))?;

        let sealed_key = self
            .vault
            .seal_str(SecretKind::SshPrivateKey, &reg.ssh_private_key)?;
        let id = self
            .storage
            .insert_host(&NewHost {
                name: name.to_string(),
                address: reg.address.clone(),
                ssh_port: reg.ssh_port.unwrap_or(22),
                ssh_username: username.to_string(),
                ssh_private_key: sealed_key,
                host_key_fingerprint: reg.host_key_fingerprint.clone(),
                pg_port: reg.pg_port.unwrap_or(5432),
                pg_version,
            })
            .await?;
        info!(host_id = id, host = %name, address = %reg.address, "host registered");
        self.storage.get_host(id).await
    }

    pub async fn get_host(&self, host_id: i64) -> KeeperResult<DbHost> {
        self.storage.get_host(host_id).await
    }

    pub async fn list_hosts(&self) -> KeeperResult<Vec<DbHost>> {
        self.storage.list_hosts().await
    }

    /// Removes the host with its databases, jobs and run history. Repository
    /// data already written is left where it is.
    pub async fn delete_host(&self, host_id: i64) -> KeeperResult<()> {
        let host = self.storage.get_host(host_id).await?;
        for job_id in self.storage.job_ids_for_host(host_id).await? {
            self.scheduler.remove_job(job_id).await;
        }
        if !self.storage.delete_host(host_id).await? {
            return Err(KeeperError::not_found(format!("host {host_id}")));
        }
        self.remote.forget(host_id).await;
        info!(host_id, host = %host.name, "host deleted; repository data left untouched");
        Ok(())
    }

    pub async fn test_connection(&self, host_id: i64) -> KeeperResult<()> {
        let host = self.storage.get_host(host_id).await?;
        self.remote.test_connection(&HostTarget::from(&host)).await
    }

    // ---- databases & users ----

    /// Create the database on its host with a primary owner, and record both.
    /// The stanza cipher passphrase is generated here, once per database.
    pub async fn add_database(
        &self,
        host_id: i64,
        name: &str,
        owner: Option<&str>,
    ) -> KeeperResult<CreatedDatabase> {
        validate_identifier("database name", name)?;
        let owner = match owner {
            Some(o) => o.to_string(),
            None => derived_name(name, "_owner"),
        };
        validate_identifier("username", &owner)?;
        let host = self.storage.get_host(host_id).await?;
        if self
            .storage
            .list_databases(host_id)
            .await?
            .iter()
            .any(|d| d.name == name)
        {
            return Err(KeeperError::config(format!(
                "database {name} already exists on host {}",
                host.name
            )));
        }

        let password = generate_password();
        let statements = |pw: &str| {
            vec![
                create_role(&owner, pw),
                format!("CREATE DATABASE {} OWNER {}", sql_ident(name), sql_ident(&owner)),
            ]
        };
        let cmd = RemoteCommand::sensitive(
            psql_each("postgres", &statements(password.expose())),
            psql_each("postgres", &statements("*****")),
        );
        self.remote
            .execute(&HostTarget::from(&host), &cmd, self.command_timeout)
            .await?
            .check()?;

        let sealed_passphrase = self
            .vault
            .seal_str(SecretKind::CipherPassphrase, generate_passphrase().expose())?;
        let database_id = self
            .storage
            .insert_database(host_id, name, &sealed_passphrase)
            .await?;
        let sealed_password = self
            .vault
            .seal_str(SecretKind::DatabasePassword, password.expose())?;
        let user_id = self
            .storage
            .insert_user(database_id, &owner, &sealed_password, Permission::ReadWrite, true)
            .await?;
        info!(host_id, database_id, database = %name, owner = %owner, "database added");

        let database = self.storage.get_database(database_id).await?;
        let primary_user = self
            .storage
            .list_users(database_id)
            .await?
            .into_iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| KeeperError::not_found(format!("database user {user_id}")))?;
        Ok(CreatedDatabase {
            database,
            primary_user,
            password,
        })
    }

    pub async fn add_database_user(
        &self,
        database_id: i64,
        username: &str,
        permission: Permission,
    ) -> KeeperResult<(DbDatabaseUser, Plaintext)> {
        validate_identifier("username", username)?;
        let database = self.storage.get_database(database_id).await?;
        let host = self.storage.get_host(database.host_id).await?;
        let target = HostTarget::from(&host);
        if self
            .storage
            .list_users(database_id)
            .await?
            .iter()
            .any(|u| u.username == username)
        {
            return Err(KeeperError::config(format!(
                "user {username} already exists for database {}",
                database.name
            )));
        }

        let password = generate_password();
        let script = grant_script(&database.name, username, permission);
        let cluster = |pw: &str| {
            let mut all = vec![create_role(username, pw)];
            all.extend(script.cluster.iter().cloned());
            all
        };
        let create = RemoteCommand::sensitive(
            psql_each("postgres", &cluster(password.expose())),
            psql_each("postgres", &cluster("*****")),
        );
        self.remote
            .execute(&target, &create, self.command_timeout)
            .await?
            .check()?;
        let grants = RemoteCommand::new(psql_each(&database.name, &script.database));
        self.remote
            .execute(&target, &grants, self.command_timeout)
            .await?
            .check()?;

        let sealed = self
            .vault
            .seal_str(SecretKind::DatabasePassword, password.expose())?;
        let id = self
            .storage
            .insert_user(database_id, username, &sealed, permission, false)
            .await?;
        info!(database_id, user_id = id, username = %username, permission = %permission, "database user added");
        let user = self
            .storage
            .list_users(database_id)
            .await?
            .into_iter()
            .find(|u| u.id == id)
            .ok_or_else(|| KeeperError::not_found(format!("database user {id}")))?;
        Ok((user, password))
    }

    /// Masked password of a database user, for display.
    pub async fn masked_user_password(&self, database_id: i64, user_id: i64) -> KeeperResult<String> {
        let user = self
            .storage
            .list_users(database_id)
            .await?
            .into_iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| KeeperError::not_found(format!("database user {user_id}")))?;
        self.masked_secret(SecretKind::DatabasePassword, &user.password)
    }

    /// Successful, unexpired backups of a database, newest first. A database
    /// without a job has none.
    pub async fn recovery_points(&self, database_id: i64) -> KeeperResult<Vec<RecoveryPoint>> {
        self.storage.get_database(database_id).await?;
        let Some(job) = self.storage.job_for_database(database_id).await? else {
            return Ok(Vec::new());
        };
        let points = self
            .storage
            .list_backup_runs(job.id)
            .await?
            .into_iter()
            .filter(|r| r.status == BackupStatus::Success && !r.pruned)
            .filter_map(|r| {
                Some(RecoveryPoint {
                    label: r.repository_path?,
                    backup_run_id: r.id,
                    backup_kind: r.backup_kind,
                    completed_at: r.end_time,
                    size_bytes: r.size_bytes,
                })
            })
            .collect();
        Ok(points)
    }

    /// Run history of a job, newest first.
    pub async fn job_runs(&self, job_id: i64) -> KeeperResult<Vec<DbBackupRun>> {
        self.storage.get_job(job_id).await?;
        self.storage.list_backup_runs(job_id).await
    }

    // ---- storage targets ----

    pub async fn create_storage_target(
        &self,
        target: NewStorageTarget,
    ) -> KeeperResult<DbStorageTarget> {
        if target.name.trim().is_empty() {
            return Err(KeeperError::config("storage target name is required"));
        }
        let mut target = target;
        match target.kind {
            StorageKind::S3 => {
                let bucket = target
                    .bucket
                    .as_deref()
                    .ok_or_else(|| KeeperError::config("S3 storage target needs a bucket"))?;
                validate_bucket(bucket)?;
                let region = target
                    .region
                    .as_deref()
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| KeeperError::config("S3 storage target needs a region"))?;
                validate_region(region)?;
                let access_key = target
                    .access_key
                    .as_deref()
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| KeeperError::config("S3 storage target needs an access key"))?;
                validate_access_key(access_key)?;
                if let Some(endpoint) = &target.endpoint {
                    validate_hostname(endpoint)?;
                }
                if let Some(prefix) = &target.path_prefix {
                    validate_prefix(prefix)?;
                }
                let secret = target
                    .secret_key
                    .take()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| KeeperError::config("S3 storage target needs a secret key"))?;
                validate_ini_value("secret key", &secret)?;
                target.secret_key = Some(self.vault.seal_str(SecretKind::StorageSecret, &secret)?);
            }
            StorageKind::Local => {
                if let Some(prefix) = &target.path_prefix {
                    validate_path(prefix)?;
                }
                target.secret_key = None;
            }
        }
        let id = self.storage.insert_storage_target(&target).await?;
        info!(storage_target_id = id, name = %target.name, kind = %target.kind, "storage target created");
        self.storage.get_storage_target(id).await
    }

    /// Rejected while any job still points at the target.
    pub async fn delete_storage_target(&self, id: i64) -> KeeperResult<()> {
        let target = self.storage.get_storage_target(id).await?;
        let users = self.storage.storage_target_usage(id).await?;
        if users > 0 {
            return Err(KeeperError::config(format!(
                "storage target {} is used by {users} backup job(s)",
                target.name
            )));
        }
        self.storage.delete_storage_target(id).await?;
        info!(storage_target_id = id, "storage target deleted");
        Ok(())
    }

    /// List the target's repository from `host_id`, proving the host can
    /// reach it with the stored credentials.
    pub async fn check_storage_target(&self, target_id: i64, host_id: i64) -> KeeperResult<()> {
        let target = self.storage.get_storage_target(target_id).await?;
        let host = self.storage.get_host(host_id).await?;
        let secret = target
            .secret_key
            .as_deref()
            .map(|s| self.vault.open(SecretKind::StorageSecret, s))
            .transpose()?;
        let cmd = repo_check_command(&target, secret.as_ref(), &self.local_repo_root)?;
        self.remote
            .execute(&HostTarget::from(&host), &cmd, self.command_timeout)
            .await?
            .check()?;
        info!(storage_target_id = target_id, host_id, "storage target reachable");
        Ok(())
    }

    pub async fn masked_storage_secret(&self, id: i64) -> KeeperResult<Option<String>> {
        let target = self.storage.get_storage_target(id).await?;
        target
            .secret_key
            .as_deref()
            .map(|s| self.masked_secret(SecretKind::StorageSecret, s))
            .transpose()
    }

    pub fn masked_secret(&self, kind: SecretKind, sealed: &str) -> KeeperResult<String> {
        self.vault.masked(kind, sealed)
    }

    // ---- jobs ----

    async fn validate_job(&self, spec: &JobSpec) -> KeeperResult<()> {
        if spec.name.trim().is_empty() {
            return Err(KeeperError::config("job name is required"));
        }
        validate_retention(spec.retention_count)?;
        CronSchedule::parse(&spec.cron_expression, chrono_tz::UTC)?;
        self.storage.get_database(spec.database_id).await?;
        self.storage.get_storage_target(spec.storage_target_id).await?;
        Ok(())
    }

    /// One job per database; a second one is a configuration error.
    pub async fn create_job(&self, spec: JobSpec) -> KeeperResult<DbBackupJob> {
        self.validate_job(&spec).await?;
        if self.storage.job_for_database(spec.database_id).await?.is_some() {
            return Err(one_job_per_database(spec.database_id));
        }
        let id = self
            .storage
            .insert_job(&spec)
            .await
            .map_err(|e| unique_to_config(e, spec.database_id))?;
        if spec.enabled {
            self.scheduler.add_job(id, spec.cron_expression.clone()).await?;
        }
        info!(job_id = id, database_id = spec.database_id, cron = %spec.cron_expression, "backup job created");
        self.storage.get_job(id).await
    }

    /// Replace a job's definition. Moving it to another database is allowed
    /// only if that database has no job yet.
    pub async fn update_job(&self, id: i64, spec: JobSpec) -> KeeperResult<DbBackupJob> {
        let current = self.storage.get_job(id).await?;
        self.validate_job(&spec).await?;
        if spec.database_id != current.database_id
            && self.storage.job_for_database(spec.database_id).await?.is_some()
        {
            return Err(one_job_per_database(spec.database_id));
        }
        self.storage
            .update_job(id, &spec)
            .await
            .map_err(|e| unique_to_config(e, spec.database_id))?;
        self.scheduler.remove_job(id).await;
        if spec.enabled {
            self.scheduler.add_job(id, spec.cron_expression.clone()).await?;
        }
        info!(job_id = id, "backup job updated");
        self.storage.get_job(id).await
    }

    pub async fn set_job_enabled(&self, id: i64, enabled: bool) -> KeeperResult<DbBackupJob> {
        let job = self.storage.get_job(id).await?;
        self.storage.set_job_enabled(id, enabled).await?;
        if enabled {
            self.scheduler.add_job(id, job.cron_expression.clone()).await?;
        } else {
            self.scheduler.remove_job(id).await;
        }
        info!(job_id = id, enabled, "backup job toggled");
        self.storage.get_job(id).await
    }

    pub async fn delete_job(&self, id: i64) -> KeeperResult<()> {
        self.scheduler.remove_job(id).await;
        if !self.storage.delete_job(id).await? {
            return Err(KeeperError::not_found(format!("backup job {id}")));
        }
        info!(job_id = id, "backup job deleted");
        Ok(())
    }

    /// Install triggers for every enabled job in the store. Jobs whose
    /// schedule no longer parses are logged and left out.
    pub async fn load_schedules(&self) -> KeeperResult<usize> {
        let mut loaded = 0;
        for job in self.storage.list_enabled_jobs().await? {
            match self.scheduler.add_job(job.id, job.cron_expression.clone()).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(job_id = job.id, error = %e, "skipping job with invalid schedule"),
            }
        }
        Ok(loaded)
    }
}

fn one_job_per_database(database_id: i64) -> KeeperError {
    KeeperError::config(format!("database {database_id} already has a backup job"))
}

fn unique_to_config(e: KeeperError, database_id: i64) -> KeeperError {
    match e {
        KeeperError::DatabaseError(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            one_job_per_database(database_id)
        }
        other => other,
    }
}
