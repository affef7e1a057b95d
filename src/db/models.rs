use crate::error::KeeperError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Enum persisted as a lowercase text column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = KeeperError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(KeeperError::config(format!(
                        "unknown {} value {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Host bootstrap lifecycle. `Initialized` and `Failed` are terminal.
    InstallState {
        Unprovisioned => "unprovisioned",
        Provisioning => "provisioning",
        Initialized => "initialized",
        Failed => "failed",
    }
);

text_enum!(Permission {
    ReadWrite => "read_write",
    ReadOnly => "read_only",
    NoAccess => "no_access",
});

text_enum!(StorageKind {
    S3 => "s3",
    Local => "local",
});

text_enum!(BackupKind {
    Full => "full",
    Incremental => "incremental",
});

text_enum!(
    /// Backup runs only ever move `running -> success | failed`.
    BackupStatus {
        Running => "running",
        Success => "success",
        Failed => "failed",
    }
);

text_enum!(RestoreStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
});

text_enum!(RestoreKind {
    Restore => "restore",
    Import => "import",
});

impl RestoreStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreStatus::Success | RestoreStatus::Failed)
    }
}

impl BackupKind {
    /// pgBackRest `--type` argument.
    pub fn pgbackrest_type(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbHost {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    #[serde(skip)]
    pub ssh_private_key: String,
    pub host_key_fingerprint: Option<String>,
    pub pg_port: u16,
    pub pg_version: String,
    pub data_dir: Option<String>,
    pub install_state: InstallState,
    pub provision_log: String,
    pub created_at: DateTime<Utc>,
}

impl DbHost {
    /// Data directory reported by the server, or the Debian default for the version.
    pub fn pg_data_dir(&self) -> String {
        self.data_dir
            .clone()
            .unwrap_or_else(|| format!("/var/lib/postgresql/{}/main", self.pg_version))
    }
}

#[derive(Debug, Clone)]
pub struct NewHost {
    pub name: String,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    /// PEM/OpenSSH private key, plaintext until sealed by the inventory service.
    pub ssh_private_key: String,
    pub host_key_fingerprint: Option<String>,
    pub pg_port: u16,
    pub pg_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbDatabase {
    pub id: i64,
    pub host_id: i64,
    pub name: String,
    #[serde(skip)]
    pub cipher_passphrase: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbDatabaseUser {
    pub id: i64,
    pub database_id: i64,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub permission: Permission,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStorageTarget {
    pub id: i64,
    pub name: String,
    pub kind: StorageKind,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    #[serde(skip)]
    pub secret_key: Option<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStorageTarget {
    pub name: String,
    pub kind: StorageKind,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    /// Plaintext on the way in; sealed before it reaches the store.
    pub secret_key: Option<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DbBackupJob {
    pub id: i64,
    pub name: String,
    pub database_id: i64,
    pub storage_target_id: i64,
    pub backup_kind: BackupKind,
    pub cron_expression: String,
    pub retention_count: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub database_id: i64,
    pub storage_target_id: i64,
    pub backup_kind: BackupKind,
    pub cron_expression: String,
    pub retention_count: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbBackupRun {
    pub id: i64,
    pub job_id: i64,
    pub status: BackupStatus,
    pub backup_kind: BackupKind,
    pub manual: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub size_bytes: Option<i64>,
    pub repository_path: Option<String>,
    pub log_output: String,
    pub error_summary: Option<String>,
    pub pruned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbRestoreRun {
    pub id: i64,
    pub database_id: i64,
    pub kind: RestoreKind,
    pub backup_run_id: Option<i64>,
    pub recovery_target: Option<DateTime<Utc>>,
    pub status: RestoreStatus,
    pub stage: u8,
    pub log_output: String,
    pub error_detail: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}
