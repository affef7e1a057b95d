use crate::KeeperError;
use crate::db::{DbBackupJob, DbBackupRun, JobSpec};
use crate::router::KeeperState;
use crate::scheduler::{RunNowOutcome, TriggerInfo};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

pub async fn create_job(
    State(state): State<KeeperState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<DbBackupJob>), KeeperError> {
    let job = state.inventory.create_job(spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn update_job(
    State(state): State<KeeperState>,
    Path(job_id): Path<i64>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<DbBackupJob>, KeeperError> {
    Ok(Json(state.inventory.update_job(job_id, spec).await?))
}

pub async fn delete_job(
    State(state): State<KeeperState>,
    Path(job_id): Path<i64>,
) -> Result<StatusCode, KeeperError> {
    state.inventory.delete_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_enabled(
    State(state): State<KeeperState>,
    Path(job_id): Path<i64>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<DbBackupJob>, KeeperError> {
    Ok(Json(
        state.inventory.set_job_enabled(job_id, body.enabled).await?,
    ))
}

/// GET /jobs/{job_id}/runs, newest first, logs included.
pub async fn list_runs(
    State(state): State<KeeperState>,
    Path(job_id): Path<i64>,
) -> Result<Json<Vec<DbBackupRun>>, KeeperError> {
    Ok(Json(state.inventory.job_runs(job_id).await?))
}

pub async fn list_triggers(
    State(state): State<KeeperState>,
) -> Result<Json<Vec<TriggerInfo>>, KeeperError> {
    Ok(Json(state.inventory.scheduler().list_triggers().await?))
}

/// POST /jobs/{job_id}/run -> 202 when started, 409 while the job is still running.
pub async fn run_now(
    State(state): State<KeeperState>,
    Path(job_id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), KeeperError> {
    // unknown jobs are a 404, not a failed run
    state.inventory.storage().get_job(job_id).await?;
    match state.inventory.scheduler().run_now(job_id).await? {
        RunNowOutcome::Started => {
            info!(job_id, "manual backup started");
            Ok((StatusCode::ACCEPTED, Json(json!({ "started": true }))))
        }
        RunNowOutcome::AlreadyRunning => Err(KeeperError::Conflict(format!(
            "backup job {job_id} is already running"
        ))),
    }
}
