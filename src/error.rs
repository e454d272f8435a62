use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CrError {
    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    #[error("Snapshot engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Failed to create mount source {path}: {source}")]
    MountSourceCreationFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot engine failure: {0}")]
    SnapshotEngineFailure(String),

    #[error("Checkpoint incomplete: {0}")]
    CheckpointIncomplete(String),

    #[error("Restore verification warning: {0}")]
    RestoreVerificationWarning(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CrError>;

impl CrError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ContainerNotRunning(_) => StatusCode::CONFLICT,
            Self::CheckpointIncomplete(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::EngineUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CrError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiResponse::<()>::error(&self.to_string());
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }
    }
}
