//! Pipeline API handlers
//!
//! GET /process/:session_id starts the pipeline and streams its events as
//! SSE. POST /process/:session_id/cancel stops it.
//!
//! One subscriber per session: a second GET while the pipeline runs is
//! rejected with 409. The pipeline keeps running if the subscriber goes away.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use recon_common::{events::event_channel, sse::session_sse_stream};
use serde::Serialize;
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::parse_session_id,
    error::{ApiError, ApiResult},
    services::run_session,
    AppState,
};

/// POST /process/:session_id/cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub session_id: Uuid,
    pub cancelled: bool,
}

/// GET /process/:session_id
///
/// Run the pipeline for an existing session, streaming progress and log
/// events until the terminal event.
pub async fn process_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session_id = parse_session_id(&session_id)?;
    let workspace = state.sessions.open(session_id)?;

    let cancel = CancellationToken::new();
    {
        let mut active = state.active_pipelines.write().await;
        if active.contains_key(&session_id) {
            return Err(ApiError::Conflict(format!(
                "Pipeline already running for session {}",
                session_id
            )));
        }
        active.insert(session_id, cancel.clone());
    }

    let (publisher, events) = event_channel(state.event_queue_capacity);

    let task_state = state.clone();
    tokio::spawn(async move {
        let result = run_session(
            task_state.orchestrator.clone(),
            workspace,
            publisher,
            cancel,
        )
        .await;

        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "Session pipeline failed");
            *task_state.last_error.write().await = Some(format!("session {}: {}", session_id, e));
        }
        task_state.active_pipelines.write().await.remove(&session_id);
    });

    info!(session_id = %session_id, "Pipeline started");
    Ok(session_sse_stream(session_id.to_string(), events))
}

/// POST /process/:session_id/cancel
///
/// Returns 202 Accepted; the stream ends with a failure once the running
/// stage has been stopped.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let session_id = parse_session_id(&session_id)?;
    let active = state.active_pipelines.read().await;
    let token = active.get(&session_id).ok_or_else(|| {
        ApiError::NotFound(format!("No running pipeline for session {}", session_id))
    })?;

    token.cancel();
    info!(session_id = %session_id, "Pipeline cancellation requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            session_id,
            cancelled: true,
        }),
    ))
}

/// Build pipeline routes
pub fn process_routes() -> Router<AppState> {
    Router::new()
        .route("/process/:session_id", get(process_session))
        .route("/process/:session_id/cancel", post(cancel_session))
}
