//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows and their text enums
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `sqlite.rs`: `KeeperStorage`, the only code that issues SQL

pub mod models;
pub mod schema;
pub mod sqlite;

pub use models::{
    BackupKind, BackupStatus, DbBackupJob, DbBackupRun, DbDatabase, DbDatabaseUser, DbHost,
    DbRestoreRun, DbStorageTarget, InstallState, JobSpec, NewHost, NewStorageTarget, Permission,
    RestoreKind, RestoreStatus, StorageKind,
};
pub use schema::SQLITE_INIT;
pub use sqlite::{KeeperStorage, SqlitePool};
