use crate::KeeperError;
use crate::db::{DbDatabase, DbDatabaseUser, DbHost, DbStorageTarget, NewStorageTarget, Permission};
use crate::router::KeeperState;
use crate::service::{HostRegistration, RecoveryPoint};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

pub async fn register_host(
    State(state): State<KeeperState>,
    Json(reg): Json<HostRegistration>,
) -> Result<(StatusCode, Json<DbHost>), KeeperError> {
    let host = state.inventory.register_host(reg).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

pub async fn list_hosts(
    State(state): State<KeeperState>,
) -> Result<Json<Vec<DbHost>>, KeeperError> {
    Ok(Json(state.inventory.list_hosts().await?))
}

/// GET /hosts/{host_id}. Carries `install_state` and `provision_log`, which is
/// how a client follows a provisioning started with a 202.
pub async fn get_host(
    State(state): State<KeeperState>,
    Path(host_id): Path<i64>,
) -> Result<Json<DbHost>, KeeperError> {
    Ok(Json(state.inventory.get_host(host_id).await?))
}

pub async fn delete_host(
    State(state): State<KeeperState>,
    Path(host_id): Path<i64>,
) -> Result<StatusCode, KeeperError> {
    state.inventory.delete_host(host_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /hosts/{host_id}/test-connection. Unreachable hosts are reported in
/// the body, not as an error status.
pub async fn test_connection(
    State(state): State<KeeperState>,
    Path(host_id): Path<i64>,
) -> Result<Json<Value>, KeeperError> {
    reachability(state.inventory.test_connection(host_id).await)
}

fn reachability(result: Result<(), KeeperError>) -> Result<Json<Value>, KeeperError> {
    match result {
        Ok(()) => Ok(Json(json!({ "reachable": true, "message": "connection successful" }))),
        Err(KeeperError::RemoteCommand { summary, .. }) => {
            Ok(Json(json!({ "reachable": false, "message": summary })))
        }
        Err(e @ (KeeperError::Connectivity(_) | KeeperError::Timeout(_))) => {
            Ok(Json(json!({ "reachable": false, "message": e.to_string() })))
        }
        Err(e) => Err(e),
    }
}

/// POST /hosts/{host_id}/provision -> 202; the steps run in the background.
pub async fn provision(
    State(state): State<KeeperState>,
    Path(host_id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), KeeperError> {
    let host = state.provisioner.begin(host_id).await?;
    info!(host_id, host = %host.name, "provisioning started");
    let provisioner = state.provisioner.clone();
    tokio::spawn(async move {
        if let Err(e) = provisioner.run(host).await {
            error!(host_id, error = %e, "provisioning ended in failure");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "provisioning": true }))))
}

#[derive(Debug, Deserialize)]
pub struct NewDatabaseBody {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Returned once, at creation; later reads only ever show the masked form.
#[derive(Debug, Serialize)]
pub struct CreatedDatabaseResponse {
    pub database: DbDatabase,
    pub primary_user: DbDatabaseUser,
    pub password: String,
}

pub async fn add_database(
    State(state): State<KeeperState>,
    Path(host_id): Path<i64>,
    Json(body): Json<NewDatabaseBody>,
) -> Result<(StatusCode, Json<CreatedDatabaseResponse>), KeeperError> {
    let created = state
        .inventory
        .add_database(host_id, body.name.trim(), body.owner.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedDatabaseResponse {
            database: created.database,
            primary_user: created.primary_user,
            password: created.password.expose().to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct NewUserBody {
    pub username: String,
    pub permission: Permission,
}

#[derive(Debug, Serialize)]
pub struct CreatedUserResponse {
    pub user: DbDatabaseUser,
    pub password: String,
}

pub async fn add_database_user(
    State(state): State<KeeperState>,
    Path(database_id): Path<i64>,
    Json(body): Json<NewUserBody>,
) -> Result<(StatusCode, Json<CreatedUserResponse>), KeeperError> {
    let (user, password) = state
        .inventory
        .add_database_user(database_id, body.username.trim(), body.permission)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedUserResponse {
            user,
            password: password.expose().to_string(),
        }),
    ))
}

/// GET /databases/{database_id}/users/{user_id}/password, masked.
pub async fn masked_user_password(
    State(state): State<KeeperState>,
    Path((database_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, KeeperError> {
    let masked = state
        .inventory
        .masked_user_password(database_id, user_id)
        .await?;
    Ok(Json(json!({ "user_id": user_id, "password": masked })))
}

pub async fn recovery_points(
    State(state): State<KeeperState>,
    Path(database_id): Path<i64>,
) -> Result<Json<Vec<RecoveryPoint>>, KeeperError> {
    Ok(Json(state.inventory.recovery_points(database_id).await?))
}

pub async fn create_storage_target(
    State(state): State<KeeperState>,
    Json(target): Json<NewStorageTarget>,
) -> Result<(StatusCode, Json<Value>), KeeperError> {
    let created: DbStorageTarget = state.inventory.create_storage_target(target).await?;
    let masked = state.inventory.masked_storage_secret(created.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "storage_target": created, "secret_key": masked })),
    ))
}

pub async fn delete_storage_target(
    State(state): State<KeeperState>,
    Path(target_id): Path<i64>,
) -> Result<StatusCode, KeeperError> {
    state.inventory.delete_storage_target(target_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CheckTargetBody {
    pub host_id: i64,
}

/// POST /storage-targets/{target_id}/test. The listing runs on the given
/// host, since that is where pgBackRest will reach the repository from.
pub async fn test_storage_target(
    State(state): State<KeeperState>,
    Path(target_id): Path<i64>,
    Json(body): Json<CheckTargetBody>,
) -> Result<Json<Value>, KeeperError> {
    reachability(
        state
            .inventory
            .check_storage_target(target_id, body.host_id)
            .await,
    )
}
