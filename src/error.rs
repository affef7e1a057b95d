use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::Error as SqlxError;
use thiserror::Error as ThisError;

pub type KeeperResult<T> = Result<T, KeeperError>;

#[derive(Debug, ThisError)]
pub enum KeeperError {
    /// Host unreachable or authentication rejected.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Remote command finished with a nonzero exit status.
    #[error("remote command failed with exit code {exit_code}: {summary}")]
    RemoteCommand { exit_code: i32, summary: String },

    /// Bound exceeded; the remote outcome is unknown.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential decryption failed: {0}")]
    CredentialDecryption(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),
}

impl KeeperError {
    pub fn config(msg: impl Into<String>) -> Self {
        KeeperError::Configuration(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        KeeperError::NotFound(what.into())
    }
}

impl IntoResponse for KeeperError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            KeeperError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            KeeperError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", self.to_string()),
            KeeperError::Configuration(_) | KeeperError::UrlParse(_) | KeeperError::Json(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONFIGURATION_ERROR",
                self.to_string(),
            ),
            KeeperError::Connectivity(_) | KeeperError::RemoteCommand { .. } => (
                StatusCode::BAD_GATEWAY,
                "REMOTE_ERROR",
                self.to_string(),
            ),
            KeeperError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
                self.to_string(),
            ),
            KeeperError::CredentialDecryption(_)
            | KeeperError::DatabaseError(_)
            | KeeperError::RactorError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred.".to_string(),
            ),
        };
        let body = ApiErrorResponse {
            error: ApiErrorBody {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}
