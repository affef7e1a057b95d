//! Cross-source import: dump a foreign database, load it into a holding
//! database on the target host, then swap it in under the target's name.

use crate::error::{KeeperError, KeeperResult};
use crate::gateway::shell::{
    as_postgres, as_root, psql, psql_each, psql_value, quote, sql_ident, sql_literal,
    validate_hostname, validate_identifier,
};
use crate::gateway::{HostTarget, RemoteCommand, RemoteExecutor};
use crate::orchestrator::progress::{ProgressEvent, RunLog};
use crate::orchestrator::stream_to_log;
use crate::vault::Plaintext;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_PORT: u16 = 5432;
const MAX_IDENTIFIER_LEN: usize = 63;

/// Where to import from, in either accepted shape.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum ImportSource {
    Url {
        connection_url: String,
    },
    Params {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        #[serde(default)]
        password: String,
        database_name: String,
        /// Shorthand for `sslmode=require`.
        #[serde(default)]
        ssl: bool,
    },
}

impl fmt::Debug for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalize() {
            Ok(conn) => conn.fmt(f),
            Err(_) => f.write_str("ImportSource(<invalid>)"),
        }
    }
}

/// Normalized source connection parameters.
#[derive(Clone, PartialEq)]
pub struct SourceConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Plaintext,
    pub database: String,
    pub sslmode: Option<String>,
}

impl fmt::Debug for SourceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password)
            .field("database", &self.database)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

impl ImportSource {
    pub fn normalize(&self) -> KeeperResult<SourceConnection> {
        let conn = match self {
            ImportSource::Url { connection_url } => from_url(connection_url)?,
            ImportSource::Params {
                host,
                port,
                username,
                password,
                database_name,
                ssl,
            } => SourceConnection {
                host: host.trim().to_string(),
                port: port.unwrap_or(DEFAULT_PORT),
                username: username.trim().to_string(),
                password: Plaintext::new(password.clone()),
                database: database_name.trim().to_string(),
                sslmode: ssl.then(|| "require".to_string()),
            },
        };
        validate_hostname(&conn.host)?;
        if conn.username.is_empty() {
            return Err(KeeperError::config("source connection has no username"));
        }
        if conn.database.is_empty() {
            return Err(KeeperError::config("source connection has no database name"));
        }
        if conn.port == 0 {
            return Err(KeeperError::config("source port must be non-zero"));
        }
        Ok(conn)
    }
}

fn decode(part: &str, what: &str) -> KeeperResult<String> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| KeeperError::config(format!("connection URL {what} is not valid UTF-8")))
}

fn from_url(raw: &str) -> KeeperResult<SourceConnection> {
    let url = Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(KeeperError::config(format!(
            "unsupported connection URL scheme {:?}, expected postgres:// or postgresql://",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| KeeperError::config("connection URL has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let sslmode = url
        .query_pairs()
        .find(|(k, _)| k == "sslmode")
        .map(|(_, v)| v.into_owned());
    Ok(SourceConnection {
        host,
        port: url.port().unwrap_or(DEFAULT_PORT),
        username: decode(url.username(), "username")?,
        password: Plaintext::new(decode(url.password().unwrap_or(""), "password")?),
        database: decode(url.path().trim_start_matches('/'), "database name")?,
        sslmode,
    })
}

/// `<base><suffix>`, with `base` shortened so the result is a valid identifier.
pub fn derived_name(base: &str, suffix: &str) -> String {
    let room = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len());
    let cut = base.len().min(room);
    format!("{}{suffix}", &base[..cut])
}

pub fn holding_name(target: &str, stamp: i64) -> String {
    derived_name(target, &format!("_import_{stamp}"))
}

pub fn retired_name(target: &str, stamp: i64) -> String {
    derived_name(target, &format!("_old_{stamp}"))
}

pub fn dump_path(stamp: i64) -> String {
    format!("/tmp/db_import_{stamp}.dump")
}

/// `pg_dump` in custom format, run as postgres so `pg_restore` can read the file.
pub fn dump_command(source: &SourceConnection, path: &str) -> RemoteCommand {
    let build = |password: &str| {
        let mut env = format!("PGPASSWORD={}", quote(password));
        if let Some(mode) = &source.sslmode {
            env.push_str(&format!(" PGSSLMODE={}", quote(mode)));
        }
        as_postgres(&format!(
            "{env} pg_dump -Fc --no-acl --no-owner -h {} -p {} -U {} -d {} -f {}",
            quote(&source.host),
            source.port,
            quote(&source.username),
            quote(&source.database),
            quote(path),
        ))
    };
    RemoteCommand::sensitive(build(source.password.expose()), build("*****"))
}

pub struct ImportPlan {
    pub host: HostTarget,
    pub target: String,
    pub owner: Option<String>,
    pub source: SourceConnection,
    pub stamp: i64,
}

#[derive(Default)]
struct Progress {
    holding_created: bool,
    swap_started: bool,
}

/// Full import pipeline. Temporary artifacts are removed whatever the outcome.
pub async fn run_import(
    remote: &dyn RemoteExecutor,
    log: &RunLog,
    plan: &ImportPlan,
    timeout: Duration,
) -> KeeperResult<()> {
    validate_identifier("database name", &plan.target)?;
    let mut progress = Progress::default();
    let result = pipeline(remote, log, plan, timeout, &mut progress).await;

    log.line("Cleaning up temporary files").await;
    let rm = RemoteCommand::new(as_root(&format!("rm -f {}", quote(&dump_path(plan.stamp)))));
    if let Err(e) = remote.execute(&plan.host, &rm, timeout).await.and_then(|o| o.check()) {
        warn!(run_id = log.run_id(), error = %e, "failed to remove dump file");
    }
    if result.is_err() && progress.holding_created && !progress.swap_started {
        let holding = holding_name(&plan.target, plan.stamp);
        let drop = RemoteCommand::new(psql_each(
            "postgres",
            &[format!("DROP DATABASE IF EXISTS {}", sql_ident(&holding))],
        ));
        match remote.execute(&plan.host, &drop, timeout).await.and_then(|o| o.check()) {
            Ok(_) => log.line(&format!("Dropped temporary database {holding}")).await,
            Err(e) => {
                warn!(run_id = log.run_id(), error = %e, "failed to drop holding database");
                log.line(&format!("Could not drop temporary database {holding}: {e}")).await;
            }
        }
    }
    result
}

async fn pipeline(
    remote: &dyn RemoteExecutor,
    log: &RunLog,
    plan: &ImportPlan,
    timeout: Duration,
    progress: &mut Progress,
) -> KeeperResult<()> {
    let host = &plan.host;
    let holding = holding_name(&plan.target, plan.stamp);
    let path = dump_path(plan.stamp);

    log.line("Checking required database tools").await;
    let tools = RemoteCommand::new("which pg_dump pg_restore");
    remote
        .execute(host, &tools, timeout)
        .await?
        .check()
        .map_err(|_| KeeperError::config("pg_dump and pg_restore are not installed on the target host"))?;

    log.milestone(ProgressEvent::ExportStarted).await;
    info!(run_id = log.run_id(), source = %plan.source.host, database = %plan.source.database, "exporting source database");
    stream_to_log(remote, log, host, &dump_command(&plan.source, &path), timeout)
        .await?
        .check()?;
    log.milestone(ProgressEvent::ExportComplete).await;

    log.line(&format!("Creating temporary database: {holding}")).await;
    let create = RemoteCommand::new(psql_each(
        "postgres",
        &[format!("CREATE DATABASE {}", sql_ident(&holding))],
    ));
    remote.execute(host, &create, timeout).await?.check()?;
    progress.holding_created = true;
    log.milestone(ProgressEvent::TempCreated).await;

    log.milestone(ProgressEvent::ImportStarted).await;
    let restore = RemoteCommand::new(format!(
        "sudo -n -u postgres pg_restore --no-acl --no-owner -d {} {}",
        quote(&holding),
        quote(&path)
    ));
    let out = stream_to_log(remote, log, host, &restore, timeout).await?;
    if !out.success() {
        // pg_restore exits nonzero for ignorable errors too (missing roles, extensions)
        warn!(run_id = log.run_id(), exit_code = out.exit_code, "pg_restore reported errors");
        log.line(&format!(
            "Warning: Some errors occurred during import (exit code {})",
            out.exit_code
        ))
        .await;
    }
    log.milestone(ProgressEvent::ImportComplete).await;

    log.milestone(ProgressEvent::Swapping).await;
    progress.swap_started = true;
    swap(remote, log, plan, &holding, timeout).await?;

    log.milestone(ProgressEvent::Done).await;
    Ok(())
}

/// Two-phase replacement: move the live database into a retired slot, then
/// rename the holding database into place. If the second rename fails the
/// retired database is moved back. Between the two renames the target name
/// does not exist; a crash there leaves the data under the retired name.
async fn swap(
    remote: &dyn RemoteExecutor,
    log: &RunLog,
    plan: &ImportPlan,
    holding: &str,
    timeout: Duration,
) -> KeeperResult<()> {
    let host = &plan.host;
    let target = plan.target.as_str();
    let retired = retired_name(target, plan.stamp);

    let exists = RemoteCommand::new(psql_value(
        "postgres",
        &format!("SELECT 1 FROM pg_database WHERE datname = {}", sql_literal(target)),
    ));
    let target_exists = remote.execute(host, &exists, timeout).await?.check()?.stdout.trim() == "1";

    let terminate = RemoteCommand::new(psql(
        "postgres",
        &format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname IN ({}, {}) AND pid <> pg_backend_pid()",
            sql_literal(target),
            sql_literal(holding)
        ),
    ));
    remote.execute(host, &terminate, timeout).await?.check()?;

    if target_exists {
        let retire = rename(target, &retired);
        remote.execute(host, &retire, timeout).await?.check()?;
        log.line(&format!("Moved existing database to {retired}")).await;
    }

    let promote = rename(holding, target);
    if let Err(e) = remote.execute(host, &promote, timeout).await.and_then(|o| o.check()) {
        if target_exists {
            let back = rename(&retired, target);
            match remote.execute(host, &back, timeout).await.and_then(|o| o.check()) {
                Ok(_) => log.line(&format!("Restored original database {target}")).await,
                Err(e2) => {
                    log.line(&format!(
                        "Could not move {retired} back to {target}: {e2}; original data remains under {retired}"
                    ))
                    .await
                }
            }
        }
        return Err(e);
    }

    if let Some(owner) = &plan.owner {
        let chown = RemoteCommand::new(psql_each(
            "postgres",
            &[format!(
                "ALTER DATABASE {} OWNER TO {}",
                sql_ident(target),
                sql_ident(owner)
            )],
        ));
        if let Err(e) = remote.execute(host, &chown, timeout).await.and_then(|o| o.check()) {
            log.line(&format!("Warning: could not hand {target} to {owner}: {e}")).await;
        }
    }

    if target_exists {
        let drop = RemoteCommand::new(psql_each(
            "postgres",
            &[format!("DROP DATABASE IF EXISTS {}", sql_ident(&retired))],
        ));
        if let Err(e) = remote.execute(host, &drop, timeout).await.and_then(|o| o.check()) {
            warn!(run_id = log.run_id(), error = %e, "failed to drop retired database");
            log.line(&format!("Warning: previous data left in {retired}: {e}")).await;
        }
    }
    Ok(())
}

fn rename(from: &str, to: &str) -> RemoteCommand {
    RemoteCommand::new(psql_each(
        "postgres",
        &[format!(
            "ALTER DATABASE {} RENAME TO {}",
            sql_ident(from),
            sql_ident(to)
        )],
    ))
}
