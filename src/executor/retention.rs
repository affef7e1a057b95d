//! Reading `pgbackrest info --output=json` and choosing what to expire.

use crate::error::{KeeperError, KeeperResult};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoBackup {
    pub label: String,
    /// `full`, `diff` or `incr`.
    pub kind: String,
    pub stopped_at: i64,
    pub size_bytes: Option<i64>,
}

#[derive(Deserialize)]
struct StanzaInfo {
    name: String,
    #[serde(default)]
    backup: Vec<BackupInfo>,
}

#[derive(Deserialize)]
struct BackupInfo {
    label: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Timestamps,
    #[serde(default)]
    info: SizeInfo,
}

#[derive(Deserialize, Default)]
struct Timestamps {
    #[serde(default)]
    stop: i64,
}

#[derive(Deserialize, Default)]
struct SizeInfo {
    size: Option<i64>,
    repository: Option<RepositorySize>,
}

#[derive(Deserialize)]
struct RepositorySize {
    delta: Option<i64>,
}

/// Backups of `stanza`, oldest first.
pub fn parse_info(json: &str, stanza: &str) -> KeeperResult<Vec<RepoBackup>> {
    let stanzas: Vec<StanzaInfo> = serde_json::from_str(json.trim())?;
    let Some(found) = stanzas.into_iter().find(|s| s.name == stanza) else {
        return Err(KeeperError::config(format!(
            "stanza {stanza} missing from pgbackrest info"
        )));
    };
    let mut backups: Vec<RepoBackup> = found
        .backup
        .into_iter()
        .map(|b| RepoBackup {
            size_bytes: b
                .info
                .repository
                .and_then(|r| r.delta)
                .or(b.info.size),
            label: b.label,
            kind: b.kind,
            stopped_at: b.timestamp.stop,
        })
        .collect();
    backups.sort_by_key(|b| b.stopped_at);
    Ok(backups)
}

/// Labels of full backups to expire, oldest first, so that at most `keep`
/// remain. Expiring a full also removes the incrementals built on it.
pub fn plan_retention(backups: &[RepoBackup], keep: u32) -> Vec<String> {
    let keep = keep.max(1) as usize;
    let mut fulls: Vec<&RepoBackup> = backups.iter().filter(|b| b.kind == "full").collect();
    fulls.sort_by_key(|b| b.stopped_at);
    let excess = fulls.len().saturating_sub(keep);
    fulls
        .into_iter()
        .take(excess)
        .map(|b| b.label.clone())
        .collect()
}
