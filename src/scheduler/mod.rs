//! Job Scheduler: cron triggers with per-job exclusivity.
//!
//! A firing while the job's previous run is still going is skipped, never
//! queued. Slots missed while the process was down are not backfilled.

pub mod actor;
pub mod cron;

pub use actor::{RunNowOutcome, SchedulerHandle, TriggerInfo, spawn};
pub use cron::CronSchedule;

use crate::db::DbBackupRun;
use crate::error::KeeperResult;
use crate::executor::{BackupExecutor, Trigger};
use async_trait::async_trait;

/// What the scheduler starts when a trigger fires.
#[async_trait]
pub trait BackupLauncher: Send + Sync {
    async fn launch(&self, job_id: i64, trigger: Trigger) -> KeeperResult<DbBackupRun>;
}

#[async_trait]
impl BackupLauncher for BackupExecutor {
    async fn launch(&self, job_id: i64, trigger: Trigger) -> KeeperResult<DbBackupRun> {
        self.run(job_id, trigger).await
    }
}
