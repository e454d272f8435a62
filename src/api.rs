use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::{CheckpointConfig, RestoreConfig};
use crate::error::{ApiResponse, CrError};
use crate::state::AppState;
use crate::storage::{list_checkpoints, CheckpointDir};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Checkpoints
        .route("/checkpoints", post(create_checkpoint))
        .route("/checkpoints", get(list_all_checkpoints))
        .route("/checkpoints/:container/:name", get(get_checkpoint))
        // Restores
        .route("/restores", post(create_restore))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub container: String,
    #[serde(flatten)]
    pub options: CheckpointConfig,
}

// ── Health ─────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "container-cr",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "runtime": state.runtime_name,
        "engine_strategies": state.engine.strategy_names(),
        "engine_available": state.engine.ensure_available().is_ok(),
        "output_dir": state.config.output_dir,
    }))
}

// ── Checkpoints ────────────────────────────────────────────────

async fn create_checkpoint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckpointRequest>,
) -> Result<impl IntoResponse, CrError> {
    if req.container.is_empty() {
        return Err(CrError::InvalidConfig("container cannot be empty".into()));
    }

    // the service only writes under its own output directory
    let mut options = req.options;
    options.output_dir = state.config.output_dir.clone();

    let artifact = state.checkpointer.checkpoint(&req.container, &options).await?;
    tracing::info!(container = %req.container, path = %artifact.checkpoint_path, "Checkpoint created via API");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(artifact))))
}

async fn list_all_checkpoints(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, CrError> {
    let checkpoints = list_checkpoints(&state.config.output_dir)?;
    Ok(Json(ApiResponse::ok(checkpoints)))
}

async fn get_checkpoint(
    State(state): State<Arc<AppState>>,
    Path((container, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, CrError> {
    if container.contains("..") || name.contains("..") {
        return Err(CrError::InvalidConfig("invalid checkpoint path".into()));
    }
    let dir = CheckpointDir::new(state.config.checkpoint_dir(&container, &name));
    if !dir.path().is_dir() {
        return Err(CrError::NotFound(format!("Checkpoint not found: {}/{}", container, name)));
    }
    dir.validate()?;
    Ok(Json(ApiResponse::ok(dir.load_artifact()?)))
}

// ── Restores ───────────────────────────────────────────────────

async fn create_restore(
    State(state): State<Arc<AppState>>,
    Json(config): Json<RestoreConfig>,
) -> Result<impl IntoResponse, CrError> {
    let outcome = state.restorer.restore(&config).await?;
    tracing::info!(container = %outcome.container_name, verified = outcome.verified, "Restore completed via API");
    Ok(Json(ApiResponse::ok(outcome)))
}
