//! recon-pipeline library interface
//!
//! Session processing pipeline for 3D reconstruction: structure-from-motion
//! stages, manifest build, NeRF training and mesh export, with progress
//! streamed to the client over SSE.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult, PipelineError};

use axum::Router;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::SessionStore;
use crate::services::PipelineOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Session directory lookup
    pub sessions: Arc<SessionStore>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Cancellation tokens of running pipelines, one per session
    pub active_pipelines: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// Capacity of each per-session event queue
    pub event_queue_capacity: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last pipeline failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(sessions: SessionStore, config: PipelineConfig, event_queue_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(sessions),
            orchestrator: Arc::new(PipelineOrchestrator::new(Arc::new(config))),
            active_pipelines: Arc::new(RwLock::new(HashMap::new())),
            event_queue_capacity: event_queue_capacity.max(1),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Cancel every running pipeline
    pub async fn cancel_all(&self) -> usize {
        let active = self.active_pipelines.read().await;
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::session_routes())
        .merge(api::process_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
