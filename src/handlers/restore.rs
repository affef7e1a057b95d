use crate::KeeperError;
use crate::db::RestoreStatus;
use crate::orchestrator::{ImportRequest, ProgressEvent, RestoreRequest};
use crate::router::KeeperState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RestoreStatusResponse {
    pub log_output: String,
    pub is_complete: bool,
    pub status: RestoreStatus,
    pub stage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<ProgressEvent>,
}

#[derive(Debug, Serialize)]
pub struct StartedRun {
    pub run_id: i64,
}

/// GET /restore-status/{run_id}
pub async fn restore_status(
    State(state): State<KeeperState>,
    Path(run_id): Path<i64>,
) -> Result<Json<RestoreStatusResponse>, KeeperError> {
    let run = state.inventory.storage().get_restore_run(run_id).await?;
    Ok(Json(RestoreStatusResponse {
        is_complete: run.status.is_terminal(),
        milestone: ProgressEvent::from_ordinal(run.stage),
        stage: run.stage,
        status: run.status,
        log_output: run.log_output,
    }))
}

/// POST /restores -> 202 with the run id; the restore continues in the background.
pub async fn start_restore(
    State(state): State<KeeperState>,
    Json(request): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<StartedRun>), KeeperError> {
    let run_id = state.orchestrator.start_restore(request).await?;
    Ok((StatusCode::ACCEPTED, Json(StartedRun { run_id })))
}

/// POST /imports -> 202 with the run id. Accepts either source shape.
pub async fn start_import(
    State(state): State<KeeperState>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<StartedRun>), KeeperError> {
    let run_id = state.orchestrator.start_import(request).await?;
    Ok((StatusCode::ACCEPTED, Json(StartedRun { run_id })))
}
