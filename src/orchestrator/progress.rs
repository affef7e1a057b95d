//! Structured import progress.
//!
//! Each event is written to the run log as a fixed phrase and recorded as
//! the run's numeric stage. The phrases are an external contract read by
//! polling clients; rewording one is a breaking change.

use crate::db::KeeperStorage;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEvent {
    ExportStarted,
    ExportComplete,
    TempCreated,
    ImportStarted,
    ImportComplete,
    Swapping,
    Done,
}

impl ProgressEvent {
    pub const ALL: [ProgressEvent; 7] = [
        ProgressEvent::ExportStarted,
        ProgressEvent::ExportComplete,
        ProgressEvent::TempCreated,
        ProgressEvent::ImportStarted,
        ProgressEvent::ImportComplete,
        ProgressEvent::Swapping,
        ProgressEvent::Done,
    ];

    pub fn phrase(&self) -> &'static str {
        match self {
            ProgressEvent::ExportStarted => "Starting export from source database",
            ProgressEvent::ExportComplete => "Source database exported successfully",
            ProgressEvent::TempCreated => "Temporary database created",
            ProgressEvent::ImportStarted => "Starting import to temporary database",
            ProgressEvent::ImportComplete => "Import to temporary database completed",
            ProgressEvent::Swapping => "Replacing target database",
            ProgressEvent::Done => "Database import completed successfully",
        }
    }

    /// 1-based position; stage 0 means nothing reached yet.
    pub fn ordinal(&self) -> u8 {
        *self as u8 + 1
    }

    pub fn from_ordinal(stage: u8) -> Option<ProgressEvent> {
        stage
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }
}

/// Highest stage whose phrase appears anywhere in `log`. Appending to the log
/// can only keep or raise the result.
pub fn infer_stage(log: &str) -> u8 {
    ProgressEvent::ALL
        .iter()
        .rev()
        .find(|e| log.contains(e.phrase()))
        .map(ProgressEvent::ordinal)
        .unwrap_or(0)
}

/// Log writer for one restore run.
#[derive(Clone)]
pub struct RunLog {
    storage: KeeperStorage,
    run_id: i64,
}

impl RunLog {
    pub fn new(storage: KeeperStorage, run_id: i64) -> Self {
        Self { storage, run_id }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn storage(&self) -> &KeeperStorage {
        &self.storage
    }

    /// Append `text` as one or more lines.
    pub async fn line(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut entry = text.to_string();
        if !entry.ends_with('\n') {
            entry.push('\n');
        }
        if let Err(e) = self.storage.append_restore_log(self.run_id, &entry).await {
            warn!(run_id = self.run_id, error = %e, "failed to append restore log");
        }
    }

    pub async fn milestone(&self, event: ProgressEvent) {
        self.line(event.phrase()).await;
        if let Err(e) = self.storage.advance_stage(self.run_id, event.ordinal()).await {
            warn!(run_id = self.run_id, error = %e, "failed to record progress stage");
        }
    }
}
