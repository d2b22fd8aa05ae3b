//! Session API handlers
//!
//! POST /sessions, GET /sessions/:session_id
//!
//! Uploading images into `images_dir` is left to the caller.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::{api::parse_session_id, error::ApiResult, models::ArtifactStatus, AppState};

/// POST /sessions response
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    /// Directory the caller fills with input images
    pub images_dir: PathBuf,
}

/// GET /sessions/:session_id response
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: Uuid,
    /// True while a pipeline is running for this session
    pub running: bool,
    pub artifacts: ArtifactStatus,
}

/// POST /sessions
///
/// Create a session working directory. Returns 201 Created.
pub async fn create_session(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    let workspace = state.sessions.create()?;
    info!(session_id = %workspace.id(), "Session created via API");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: workspace.id(),
            images_dir: workspace.images_dir(),
        }),
    ))
}

/// GET /sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let session_id = parse_session_id(&session_id)?;
    let workspace = state.sessions.open(session_id)?;
    let artifacts = workspace.artifacts()?;
    let running = state.active_pipelines.read().await.contains_key(&session_id);

    Ok(Json(SessionStatusResponse {
        session_id,
        running,
        artifacts,
    }))
}

/// Build session routes
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(get_session))
}
