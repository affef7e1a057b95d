//! Backup Configuration Synthesizer: one pgBackRest stanza per database.

use crate::db::{DbBackupJob, DbDatabase, DbHost, DbStorageTarget, KeeperStorage, StorageKind};
use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{self, as_postgres, as_root, quote};
use crate::gateway::{HostTarget, RemoteCommand, RemoteExecutor};
use crate::vault::{Plaintext, SecretKind, Vault};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Differential backups kept per retained full backup.
pub const DIFF_RETENTION_MULTIPLIER: u32 = 2;

pub const CIPHER_TYPE: &str = "aes-256-cbc";

/// Largest `repo1-retention-full` pgBackRest accepts.
pub const MAX_RETENTION: u32 = 9_999_999;

const SECRET_KEYS: [&str; 2] = ["repo1-cipher-pass", "repo1-s3-key-secret"];

#[derive(Debug, Clone)]
pub struct SynthSettings {
    pub compress_type: String,
    pub compress_level: u8,
    pub local_repo_root: String,
    pub conf_dir: String,
}

pub struct StanzaInput<'a> {
    pub host: &'a DbHost,
    pub database: &'a DbDatabase,
    pub job: &'a DbBackupJob,
    pub target: &'a DbStorageTarget,
    pub cipher_passphrase: &'a Plaintext,
    pub storage_secret: Option<&'a Plaintext>,
}

/// Rendered ini section. Holds decrypted secrets, so it is never logged
/// and never persisted locally.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    stanza: String,
    entries: Vec<(&'static str, String)>,
}

impl ConfigDocument {
    pub fn stanza(&self) -> &str {
        &self.stanza
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = format!("[{}]\n", self.stanza);
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }
}

impl fmt::Debug for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"stanza", &self.stanza);
        for (k, v) in &self.entries {
            if SECRET_KEYS.contains(k) {
                map.entry(k, &"<redacted>");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

/// Stanza names follow the database name.
pub fn stanza_name(database: &DbDatabase) -> &str {
    &database.name
}

/// Build the stanza document. Pure; performs no I/O.
pub fn synthesize(input: &StanzaInput<'_>, settings: &SynthSettings) -> KeeperResult<ConfigDocument> {
    let stanza = stanza_name(input.database).to_string();
    shell::validate_identifier("stanza", &stanza)?;
    let retention = input.job.retention_count;
    validate_retention(retention)?;
    let diff_retention = retention
        .checked_mul(DIFF_RETENTION_MULTIPLIER)
        .ok_or_else(|| KeeperError::config(format!("retention count {retention} is too large")))?;

    let mut entries: Vec<(&'static str, String)> = vec![
        ("pg1-path", input.host.pg_data_dir()),
        ("pg1-port", input.host.pg_port.to_string()),
    ];

    let host_segment = &input.host.name;
    shell::validate_label("host name", host_segment)?;
    match input.target.kind {
        StorageKind::S3 => {
            let repo = S3Repo::from_target(input.target)?;
            let secret = input
                .storage_secret
                .ok_or_else(|| KeeperError::config("storage target has no secret key"))?;
            entries.push(("repo1-type", "s3".to_string()));
            entries.push(("repo1-path", format!("/{}/{host_segment}/{stanza}", repo.prefix)));
            entries.push(("repo1-s3-bucket", repo.bucket.to_string()));
            entries.push(("repo1-s3-endpoint", repo.endpoint));
            entries.push(("repo1-s3-region", repo.region.to_string()));
            entries.push(("repo1-s3-key", repo.key.to_string()));
            entries.push(("repo1-s3-key-secret", secret.expose().to_string()));
            entries.push(("repo1-s3-verify-tls", "y".to_string()));
        }
        StorageKind::Local => {
            let path = format!("{}/{stanza}", local_root(input.target, &settings.local_repo_root));
            shell::validate_path(&path)?;
            entries.push(("repo1-type", "posix".to_string()));
            entries.push(("repo1-path", path));
        }
    }

    entries.extend([
        ("repo1-cipher-type", CIPHER_TYPE.to_string()),
        ("repo1-cipher-pass", input.cipher_passphrase.expose().to_string()),
        ("compress-type", settings.compress_type.clone()),
        ("compress-level", settings.compress_level.to_string()),
        ("repo1-retention-full-type", "count".to_string()),
        ("repo1-retention-full", retention.to_string()),
        (
            "repo1-retention-diff",
            diff_retention.to_string(),
        ),
        ("repo1-retention-archive", retention.to_string()),
        ("repo1-retention-archive-type", "full".to_string()),
    ]);

    for (key, value) in &entries {
        shell::validate_ini_value(key, value)?;
    }
    Ok(ConfigDocument { stanza, entries })
}

/// `1..=MAX_RETENTION`.
pub fn validate_retention(count: u32) -> KeeperResult<()> {
    if (1..=MAX_RETENTION).contains(&count) {
        Ok(())
    } else {
        Err(KeeperError::config(format!(
            "retention count must be between 1 and {MAX_RETENTION}, got {count}"
        )))
    }
}

/// Validated S3 fields of a storage target.
struct S3Repo<'a> {
    bucket: &'a str,
    region: &'a str,
    key: &'a str,
    endpoint: String,
    prefix: &'a str,
}

impl<'a> S3Repo<'a> {
    fn from_target(target: &'a DbStorageTarget) -> KeeperResult<Self> {
        let bucket = required(&target.bucket, "bucket")?;
        shell::validate_bucket(bucket)?;
        let region = required(&target.region, "region")?;
        shell::validate_region(region)?;
        let key = required(&target.access_key, "access key")?;
        shell::validate_access_key(key)?;
        let endpoint = target
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("s3.{region}.amazonaws.com"));
        shell::validate_hostname(&endpoint)?;
        let prefix = target
            .path_prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .unwrap_or("pgkeeper");
        shell::validate_prefix(prefix)?;
        Ok(Self {
            bucket,
            region,
            key,
            endpoint,
            prefix,
        })
    }
}

fn local_root(target: &DbStorageTarget, default_root: &str) -> String {
    target
        .path_prefix
        .as_deref()
        .unwrap_or(default_root)
        .trim_end_matches('/')
        .to_string()
}

/// `pgbackrest repo-ls` against the target's base path, with the repository
/// given entirely on the command line. The S3 secret travels in the
/// environment and is masked in the display form.
pub fn repo_check_command(
    target: &DbStorageTarget,
    secret: Option<&Plaintext>,
    local_repo_root: &str,
) -> KeeperResult<RemoteCommand> {
    let (options, env) = match target.kind {
        StorageKind::S3 => {
            let repo = S3Repo::from_target(target)?;
            let secret = secret.ok_or_else(|| KeeperError::config("storage target has no secret key"))?;
            shell::validate_ini_value("repo1-s3-key-secret", secret.expose())?;
            let options = format!(
                "--repo1-type=s3 --repo1-path={} --repo1-s3-bucket={} --repo1-s3-endpoint={} \
                 --repo1-s3-region={} --repo1-s3-key={}",
                quote(&format!("/{}", repo.prefix)),
                quote(repo.bucket),
                quote(&repo.endpoint),
                quote(repo.region),
                quote(repo.key),
            );
            (options, Some(secret))
        }
        StorageKind::Local => {
            let root = local_root(target, local_repo_root);
            shell::validate_path(&root)?;
            (format!("--repo1-type=posix --repo1-path={}", quote(&root)), None)
        }
    };
    let script = |secret: &str| {
        let env = env
            .map(|_| format!("PGBACKREST_REPO1_S3_KEY_SECRET={} ", quote(secret)))
            .unwrap_or_default();
        as_postgres(&format!(
            "{env}pgbackrest {options} --log-level-console=warn repo-ls"
        ))
    };
    Ok(RemoteCommand::sensitive(
        script(env.map(Plaintext::expose).unwrap_or_default()),
        script("*****"),
    ))
}

fn required<'a>(value: &'a Option<String>, what: &str) -> KeeperResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| KeeperError::config(format!("storage target is missing its {what}")))
}

/// Everything needed to act on a job's stanza, with secrets opened just long
/// enough to render the document.
pub struct PreparedStanza {
    pub host: DbHost,
    pub database: DbDatabase,
    pub job: DbBackupJob,
    pub document: ConfigDocument,
}

pub async fn prepare(
    storage: &KeeperStorage,
    vault: &Vault,
    settings: &SynthSettings,
    job: DbBackupJob,
) -> KeeperResult<PreparedStanza> {
    let database = storage.get_database(job.database_id).await?;
    let host = storage.get_host(database.host_id).await?;
    let target = storage.get_storage_target(job.storage_target_id).await?;

    let passphrase = vault.open(SecretKind::CipherPassphrase, &database.cipher_passphrase)?;
    let secret = target
        .secret_key
        .as_deref()
        .map(|s| vault.open(SecretKind::StorageSecret, s))
        .transpose()?;

    let document = synthesize(
        &StanzaInput {
            host: &host,
            database: &database,
            job: &job,
            target: &target,
            cipher_passphrase: &passphrase,
            storage_secret: secret.as_ref(),
        },
        settings,
    )?;
    Ok(PreparedStanza {
        host,
        database,
        job,
        document,
    })
}

/// Write the document to `<conf_dir>/<stanza>.conf`, then create and check
/// the stanza. Returns the combined tool output.
pub async fn apply(
    executor: &dyn RemoteExecutor,
    host: &HostTarget,
    document: &ConfigDocument,
    conf_dir: &str,
    timeout: Duration,
) -> KeeperResult<String> {
    shell::validate_path(conf_dir)?;
    let path = format!("{conf_dir}/{}.conf", document.stanza());
    let encoded = STANDARD.encode(document.render());
    let write = RemoteCommand::sensitive(
        as_root(&format!(
            "install -d -m 750 -o postgres -g postgres {dir} && \
             printf %s {data} | base64 -d > {path}.tmp && \
             chown postgres:postgres {path}.tmp && chmod 640 {path}.tmp && \
             mv {path}.tmp {path}",
            dir = quote(conf_dir),
            data = quote(&encoded),
            path = quote(&path),
        )),
        format!("write pgBackRest stanza config {path}"),
    );
    executor.execute(host, &write, timeout).await?.check()?;
    info!(host = %host.name, stanza = %document.stanza(), "stanza config written");

    let mut log = String::new();
    for action in ["stanza-create", "check"] {
        let cmd = RemoteCommand::new(as_postgres(&format!(
            "pgbackrest --stanza={} --log-level-console=info {action}",
            document.stanza()
        )));
        let out = executor.execute(host, &cmd, timeout).await?.check()?;
        log.push_str(&out.combined());
    }
    Ok(log)
}
