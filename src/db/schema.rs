//! SQL DDL for the inventory and run-history store.
//! Statements are executed one by one, split on `;`, so no statement may
//! contain a literal semicolon.

/// SQLite schema with:
/// - `backup_jobs.database_id` UNIQUE (one job per database)
/// - `backup_jobs.storage_target_id` RESTRICT (targets in use cannot be deleted)
/// - cascades host -> databases -> users, jobs -> runs
/// - timestamps stored as RFC3339 text
///
/// Cascades rely on `foreign_keys` being enabled on every pooled connection.
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    address TEXT NOT NULL,
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_username TEXT NOT NULL,
    ssh_private_key TEXT NOT NULL, -- sealed by the vault
    host_key_fingerprint TEXT NULL,
    pg_port INTEGER NOT NULL DEFAULT 5432,
    pg_version TEXT NOT NULL,
    data_dir TEXT NULL,
    install_state TEXT NOT NULL DEFAULT 'unprovisioned',
    provision_log TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS databases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    cipher_passphrase TEXT NOT NULL, -- sealed by the vault
    created_at TEXT NOT NULL,
    UNIQUE (host_id, name)
);

CREATE TABLE IF NOT EXISTS database_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_id INTEGER NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
    username TEXT NOT NULL,
    password TEXT NOT NULL, -- sealed by the vault
    permission TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    UNIQUE (database_id, username)
);

CREATE TABLE IF NOT EXISTS storage_targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL, -- 's3' | 'local'
    bucket TEXT NULL,
    region TEXT NULL,
    endpoint TEXT NULL,
    access_key TEXT NULL,
    secret_key TEXT NULL, -- sealed by the vault
    path_prefix TEXT NULL
);

CREATE TABLE IF NOT EXISTS backup_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    database_id INTEGER NOT NULL UNIQUE REFERENCES databases(id) ON DELETE CASCADE,
    storage_target_id INTEGER NOT NULL REFERENCES storage_targets(id) ON DELETE RESTRICT,
    backup_kind TEXT NOT NULL, -- 'full' | 'incremental'
    cron_expression TEXT NOT NULL,
    retention_count INTEGER NOT NULL CHECK (retention_count >= 1),
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS backup_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'running',
    backup_kind TEXT NOT NULL,
    manual INTEGER NOT NULL DEFAULT 0,
    start_time TEXT NOT NULL,
    end_time TEXT NULL,
    size_bytes INTEGER NULL,
    repository_path TEXT NULL,
    log_output TEXT NOT NULL DEFAULT '',
    error_summary TEXT NULL,
    pruned INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_job_id ON backup_runs(job_id);

CREATE TABLE IF NOT EXISTS restore_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_id INTEGER NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
    kind TEXT NOT NULL, -- 'restore' | 'import'
    backup_run_id INTEGER NULL REFERENCES backup_runs(id) ON DELETE SET NULL,
    recovery_target TEXT NULL, -- RFC3339
    status TEXT NOT NULL DEFAULT 'pending',
    stage INTEGER NOT NULL DEFAULT 0,
    log_output TEXT NOT NULL DEFAULT '',
    error_detail TEXT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NULL
);

CREATE INDEX IF NOT EXISTS idx_restore_runs_database_id ON restore_runs(database_id);
"#;
