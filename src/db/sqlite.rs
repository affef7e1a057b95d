use crate::db::models::{
    BackupKind, BackupStatus, DbBackupJob, DbBackupRun, DbDatabase, DbDatabaseUser, DbHost,
    DbRestoreRun, DbStorageTarget, InstallState, JobSpec, NewHost, NewStorageTarget, Permission,
    RestoreKind, RestoreStatus,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::{KeeperError, KeeperResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

pub type SqlitePool = Pool<Sqlite>;

const HOST_COLUMNS: &str = "id, name, address, ssh_port, ssh_username, ssh_private_key, \
    host_key_fingerprint, pg_port, pg_version, data_dir, install_state, provision_log, created_at";
const JOB_COLUMNS: &str = "id, name, database_id, storage_target_id, backup_kind, \
    cron_expression, retention_count, enabled";
const BACKUP_RUN_COLUMNS: &str = "id, job_id, status, backup_kind, manual, start_time, end_time, \
    size_bytes, repository_path, log_output, error_summary, pruned";
const RESTORE_RUN_COLUMNS: &str = "id, database_id, kind, backup_run_id, recovery_target, \
    status, stage, log_output, error_detail, start_time, end_time";

#[derive(Clone)]
pub struct KeeperStorage {
    pool: SqlitePool,
}

impl KeeperStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialise the schema.
    pub async fn connect(url: &str) -> KeeperResult<Self> {
        let connect_opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(&self) -> KeeperResult<()> {
        // sqlx::query runs a single statement at a time
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- hosts ----

    /// `host.ssh_private_key` must already be sealed.
    pub async fn insert_host(&self, host: &NewHost) -> KeeperResult<i64> {
        let res = sqlx::query(
            r#"INSERT INTO hosts (
                name, address, ssh_port, ssh_username, ssh_private_key,
                host_key_fingerprint, pg_port, pg_version, install_state, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&host.name)
        .bind(&host.address)
        .bind(host.ssh_port as i64)
        .bind(&host.ssh_username)
        .bind(&host.ssh_private_key)
        .bind(&host.host_key_fingerprint)
        .bind(host.pg_port as i64)
        .bind(&host.pg_version)
        .bind(InstallState::Unprovisioned.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_host(&self, id: i64) -> KeeperResult<DbHost> {
        let row = sqlx::query(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KeeperError::not_found(format!("host {id}")))?;
        Self::row_to_host(row)
    }

    pub async fn list_hosts(&self) -> KeeperResult<Vec<DbHost>> {
        let rows = sqlx::query(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_host).collect()
    }

    /// Move a host from `from` to `to`. Returns false if the host was not in `from`.
    pub async fn transition_host(
        &self,
        id: i64,
        from: InstallState,
        to: InstallState,
    ) -> KeeperResult<bool> {
        let res = sqlx::query("UPDATE hosts SET install_state = ? WHERE id = ? AND install_state = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn append_provision_log(&self, id: i64, text: &str) -> KeeperResult<()> {
        sqlx::query("UPDATE hosts SET provision_log = provision_log || ? WHERE id = ?")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_data_dir(&self, id: i64, data_dir: &str) -> KeeperResult<()> {
        sqlx::query("UPDATE hosts SET data_dir = ? WHERE id = ?")
            .bind(data_dir)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes the host row; databases, users, jobs and run history cascade.
    pub async fn delete_host(&self, id: i64) -> KeeperResult<bool> {
        let res = sqlx::query("DELETE FROM hosts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    // ---- databases & users ----

    pub async fn insert_database(
        &self,
        host_id: i64,
        name: &str,
        sealed_passphrase: &str,
    ) -> KeeperResult<i64> {
        let res = sqlx::query(
            "INSERT INTO databases (host_id, name, cipher_passphrase, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(host_id)
        .bind(name)
        .bind(sealed_passphrase)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_database(&self, id: i64) -> KeeperResult<DbDatabase> {
        let row = sqlx::query(
            "SELECT id, host_id, name, cipher_passphrase, created_at FROM databases WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| KeeperError::not_found(format!("database {id}")))?;
        Self::row_to_database(row)
    }

    pub async fn list_databases(&self, host_id: i64) -> KeeperResult<Vec<DbDatabase>> {
        let rows = sqlx::query(
            "SELECT id, host_id, name, cipher_passphrase, created_at FROM databases \
             WHERE host_id = ? ORDER BY id",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_database).collect()
    }

    pub async fn insert_user(
        &self,
        database_id: i64,
        username: &str,
        sealed_password: &str,
        permission: Permission,
        is_primary: bool,
    ) -> KeeperResult<i64> {
        let res = sqlx::query(
            "INSERT INTO database_users (database_id, username, password, permission, is_primary) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(database_id)
        .bind(username)
        .bind(sealed_password)
        .bind(permission.as_str())
        .bind(if is_primary { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn list_users(&self, database_id: i64) -> KeeperResult<Vec<DbDatabaseUser>> {
        let rows = sqlx::query(
            "SELECT id, database_id, username, password, permission, is_primary \
             FROM database_users WHERE database_id = ? ORDER BY is_primary DESC, id",
        )
        .bind(database_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> KeeperResult<DbDatabaseUser> {
                let permission: String = row.try_get("permission")?;
                let is_primary: i64 = row.try_get("is_primary")?;
                Ok(DbDatabaseUser {
                    id: row.try_get("id")?,
                    database_id: row.try_get("database_id")?,
                    username: row.try_get("username")?,
                    password: row.try_get("password")?,
                    permission: permission.parse()?,
                    is_primary: is_primary != 0,
                })
            })
            .collect()
    }

    // ---- storage targets ----

    /// `target.secret_key` must already be sealed.
    pub async fn insert_storage_target(&self, target: &NewStorageTarget) -> KeeperResult<i64> {
        let res = sqlx::query(
            r#"INSERT INTO storage_targets (
                name, kind, bucket, region, endpoint, access_key, secret_key, path_prefix
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&target.name)
        .bind(target.kind.as_str())
        .bind(&target.bucket)
        .bind(&target.region)
        .bind(&target.endpoint)
        .bind(&target.access_key)
        .bind(&target.secret_key)
        .bind(&target.path_prefix)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_storage_target(&self, id: i64) -> KeeperResult<DbStorageTarget> {
        let row = sqlx::query(
            "SELECT id, name, kind, bucket, region, endpoint, access_key, secret_key, path_prefix \
             FROM storage_targets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| KeeperError::not_found(format!("storage target {id}")))?;
        let kind: String = row.try_get("kind")?;
        Ok(DbStorageTarget {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: kind.parse()?,
            bucket: row.try_get("bucket")?,
            region: row.try_get("region")?,
            endpoint: row.try_get("endpoint")?,
            access_key: row.try_get("access_key")?,
            secret_key: row.try_get("secret_key")?,
            path_prefix: row.try_get("path_prefix")?,
        })
    }

    pub async fn storage_target_usage(&self, id: i64) -> KeeperResult<i64> {
        let rec: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM backup_jobs WHERE storage_target_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(rec.0)
    }

    pub async fn delete_storage_target(&self, id: i64) -> KeeperResult<bool> {
        let res = sqlx::query("DELETE FROM storage_targets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    // ---- backup jobs ----

    pub async fn insert_job(&self, spec: &JobSpec) -> KeeperResult<i64> {
        let res = sqlx::query(
            r#"INSERT INTO backup_jobs (
                name, database_id, storage_target_id, backup_kind,
                cron_expression, retention_count, enabled
            ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&spec.name)
        .bind(spec.database_id)
        .bind(spec.storage_target_id)
        .bind(spec.backup_kind.as_str())
        .bind(&spec.cron_expression)
        .bind(spec.retention_count as i64)
        .bind(if spec.enabled { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_job(&self, id: i64, spec: &JobSpec) -> KeeperResult<()> {
        sqlx::query(
            r#"UPDATE backup_jobs SET
                name = ?,
                database_id = ?,
                storage_target_id = ?,
                backup_kind = ?,
                cron_expression = ?,
                retention_count = ?,
                enabled = ?
              WHERE id = ?"#,
        )
        .bind(&spec.name)
        .bind(spec.database_id)
        .bind(spec.storage_target_id)
        .bind(spec.backup_kind.as_str())
        .bind(&spec.cron_expression)
        .bind(spec.retention_count as i64)
        .bind(if spec.enabled { 1 } else { 0 })
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_job_enabled(&self, id: i64, enabled: bool) -> KeeperResult<()> {
        sqlx::query("UPDATE backup_jobs SET enabled = ? WHERE id = ?")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: i64) -> KeeperResult<bool> {
        let res = sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_job(&self, id: i64) -> KeeperResult<DbBackupJob> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM backup_jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KeeperError::not_found(format!("backup job {id}")))?;
        Self::row_to_job(row)
    }

    pub async fn job_for_database(&self, database_id: i64) -> KeeperResult<Option<DbBackupJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE database_id = ?"
        ))
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_job).transpose()
    }

    pub async fn list_enabled_jobs(&self) -> KeeperResult<Vec<DbBackupJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_job).collect()
    }

    pub async fn job_ids_for_host(&self, host_id: i64) -> KeeperResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT j.id FROM backup_jobs j JOIN databases d ON d.id = j.database_id \
             WHERE d.host_id = ? ORDER BY j.id",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    // ---- backup runs ----

    pub async fn create_backup_run(
        &self,
        job_id: i64,
        kind: BackupKind,
        manual: bool,
    ) -> KeeperResult<i64> {
        let res = sqlx::query(
            "INSERT INTO backup_runs (job_id, status, backup_kind, manual, start_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(BackupStatus::Running.as_str())
        .bind(kind.as_str())
        .bind(if manual { 1 } else { 0 })
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Appends to a run's log. Terminal runs stay writable so late retention
    /// output is not lost.
    pub async fn append_backup_log(&self, id: i64, text: &str) -> KeeperResult<()> {
        sqlx::query("UPDATE backup_runs SET log_output = log_output || ? WHERE id = ?")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal transition. Returns false if the run already left `running`.
    pub async fn finish_backup_run(
        &self,
        id: i64,
        status: BackupStatus,
        size_bytes: Option<i64>,
        repository_path: Option<&str>,
        error_summary: Option<&str>,
    ) -> KeeperResult<bool> {
        let res = sqlx::query(
            r#"UPDATE backup_runs SET
                status = ?,
                end_time = ?,
                size_bytes = ?,
                repository_path = ?,
                error_summary = ?
              WHERE id = ? AND status = 'running'"#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(size_bytes)
        .bind(repository_path)
        .bind(error_summary)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_backup_run(&self, id: i64) -> KeeperResult<DbBackupRun> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_RUN_COLUMNS} FROM backup_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| KeeperError::not_found(format!("backup run {id}")))?;
        Self::row_to_backup_run(row)
    }

    /// Newest first.
    pub async fn list_backup_runs(&self, job_id: i64) -> KeeperResult<Vec<DbBackupRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_RUN_COLUMNS} FROM backup_runs WHERE job_id = ? ORDER BY id DESC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_backup_run).collect()
    }

    /// Successful incrementals recorded after the most recent successful full.
    pub async fn incrementals_since_full(&self, job_id: i64) -> KeeperResult<u32> {
        let rec: (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM backup_runs
               WHERE job_id = ?
                 AND status = 'success'
                 AND backup_kind = 'incremental'
                 AND id > COALESCE((
                     SELECT MAX(id) FROM backup_runs
                     WHERE job_id = ? AND status = 'success' AND backup_kind = 'full'
                 ), 0)"#,
        )
        .bind(job_id)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.0 as u32)
    }

    pub async fn has_successful_full(&self, job_id: i64) -> KeeperResult<bool> {
        let rec: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM backup_runs WHERE job_id = ? AND status = 'success' AND backup_kind = 'full'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.0 > 0)
    }

    pub async fn mark_pruned(&self, run_ids: &[i64]) -> KeeperResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in run_ids {
            sqlx::query("UPDATE backup_runs SET pruned = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- restore runs ----

    pub async fn create_restore_run(
        &self,
        database_id: i64,
        kind: RestoreKind,
        backup_run_id: Option<i64>,
        recovery_target: Option<DateTime<Utc>>,
    ) -> KeeperResult<i64> {
        let res = sqlx::query(
            "INSERT INTO restore_runs (database_id, kind, backup_run_id, recovery_target, status, start_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(database_id)
        .bind(kind.as_str())
        .bind(backup_run_id)
        .bind(recovery_target.map(|t| t.to_rfc3339()))
        .bind(RestoreStatus::Pending.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn mark_restore_running(&self, id: i64) -> KeeperResult<bool> {
        let res = sqlx::query("UPDATE restore_runs SET status = 'running' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn append_restore_log(&self, id: i64, text: &str) -> KeeperResult<()> {
        sqlx::query("UPDATE restore_runs SET log_output = log_output || ? WHERE id = ?")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a progress stage; never lowers the stored value.
    pub async fn advance_stage(&self, id: i64, stage: u8) -> KeeperResult<()> {
        sqlx::query("UPDATE restore_runs SET stage = MAX(stage, ?) WHERE id = ?")
            .bind(stage as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal transition. Returns true only for the call that completed the run.
    pub async fn finish_restore_run(
        &self,
        id: i64,
        status: RestoreStatus,
        error_detail: Option<&str>,
    ) -> KeeperResult<bool> {
        let res = sqlx::query(
            "UPDATE restore_runs SET status = ?, error_detail = ?, end_time = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(error_detail)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_restore_run(&self, id: i64) -> KeeperResult<DbRestoreRun> {
        let row = sqlx::query(&format!(
            "SELECT {RESTORE_RUN_COLUMNS} FROM restore_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| KeeperError::not_found(format!("restore run {id}")))?;
        Self::row_to_restore_run(row)
    }

    // ---- row mapping ----

    fn row_to_host(row: SqliteRow) -> KeeperResult<DbHost> {
        let ssh_port: i64 = row.try_get("ssh_port")?;
        let pg_port: i64 = row.try_get("pg_port")?;
        let install_state: String = row.try_get("install_state")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(DbHost {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            ssh_port: to_port(ssh_port)?,
            ssh_username: row.try_get("ssh_username")?,
            ssh_private_key: row.try_get("ssh_private_key")?,
            host_key_fingerprint: row.try_get("host_key_fingerprint")?,
            pg_port: to_port(pg_port)?,
            pg_version: row.try_get("pg_version")?,
            data_dir: row.try_get("data_dir")?,
            install_state: install_state.parse()?,
            provision_log: row.try_get("provision_log")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_database(row: SqliteRow) -> KeeperResult<DbDatabase> {
        let created_at: String = row.try_get("created_at")?;
        Ok(DbDatabase {
            id: row.try_get("id")?,
            host_id: row.try_get("host_id")?,
            name: row.try_get("name")?,
            cipher_passphrase: row.try_get("cipher_passphrase")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_job(row: SqliteRow) -> KeeperResult<DbBackupJob> {
        let backup_kind: String = row.try_get("backup_kind")?;
        let retention_count: i64 = row.try_get("retention_count")?;
        let enabled: i64 = row.try_get("enabled")?;
        Ok(DbBackupJob {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            database_id: row.try_get("database_id")?,
            storage_target_id: row.try_get("storage_target_id")?,
            backup_kind: backup_kind.parse()?,
            cron_expression: row.try_get("cron_expression")?,
            retention_count: retention_count.max(1) as u32,
            enabled: enabled != 0,
        })
    }

    fn row_to_backup_run(row: SqliteRow) -> KeeperResult<DbBackupRun> {
        let status: String = row.try_get("status")?;
        let backup_kind: String = row.try_get("backup_kind")?;
        let manual: i64 = row.try_get("manual")?;
        let pruned: i64 = row.try_get("pruned")?;
        let start_time: String = row.try_get("start_time")?;
        let end_time: Option<String> = row.try_get("end_time")?;
        Ok(DbBackupRun {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            status: status.parse()?,
            backup_kind: backup_kind.parse()?,
            manual: manual != 0,
            start_time: parse_ts(&start_time)?,
            end_time: end_time.as_deref().map(parse_ts).transpose()?,
            size_bytes: row.try_get("size_bytes")?,
            repository_path: row.try_get("repository_path")?,
            log_output: row.try_get("log_output")?,
            error_summary: row.try_get("error_summary")?,
            pruned: pruned != 0,
        })
    }

    fn row_to_restore_run(row: SqliteRow) -> KeeperResult<DbRestoreRun> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let stage: i64 = row.try_get("stage")?;
        let recovery_target: Option<String> = row.try_get("recovery_target")?;
        let start_time: String = row.try_get("start_time")?;
        let end_time: Option<String> = row.try_get("end_time")?;
        Ok(DbRestoreRun {
            id: row.try_get("id")?,
            database_id: row.try_get("database_id")?,
            kind: kind.parse()?,
            backup_run_id: row.try_get("backup_run_id")?,
            recovery_target: recovery_target.as_deref().map(parse_ts).transpose()?,
            status: status.parse()?,
            stage: stage.clamp(0, u8::MAX as i64) as u8,
            log_output: row.try_get("log_output")?,
            error_detail: row.try_get("error_detail")?,
            start_time: parse_ts(&start_time)?,
            end_time: end_time.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn to_port(v: i64) -> Result<u16, sqlx::Error> {
    u16::try_from(v).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
