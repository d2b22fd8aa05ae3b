//! Error types for recon-pipeline
//!
//! - [`PipelineError`]: every way a pipeline run can stop. All variants are
//!   fatal to the run; there is no retry or partial resume.
//! - [`ApiError`]: HTTP-facing errors with a JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::PipelineState;
use crate::services::manifest_builder::ManifestError;

/// Pipeline failure, attributed to the state it happened in
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The stage's program could not be found
    #[error("{stage}: executable not found: {}", .program.display())]
    MissingExecutable {
        stage: PipelineState,
        program: PathBuf,
    },

    /// The stage's program exited unsuccessfully
    #[error("{stage}: process exited with {}", describe_exit(.code))]
    ProcessExitNonZero {
        stage: PipelineState,
        /// `None` when the process was terminated by a signal
        code: Option<i32>,
    },

    /// A required input or output artifact does not exist
    #[error("{stage}: expected artifact missing: {}", .path.display())]
    ArtifactMissing { stage: PipelineState, path: PathBuf },

    /// Reconstruction text output could not be turned into a manifest
    #[error("manifest build: {0}")]
    Manifest(#[from] ManifestError),

    /// Launching, reading or preparing directories failed
    #[error("{stage}: file system error: {source}")]
    FileSystem {
        stage: PipelineState,
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled while this state was active
    #[error("{stage}: cancelled")]
    Cancelled { stage: PipelineState },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

impl PipelineError {
    /// State the failure is attributed to
    pub fn stage(&self) -> PipelineState {
        match self {
            PipelineError::MissingExecutable { stage, .. }
            | PipelineError::ProcessExitNonZero { stage, .. }
            | PipelineError::ArtifactMissing { stage, .. }
            | PipelineError::FileSystem { stage, .. }
            | PipelineError::Cancelled { stage } => *stage,
            PipelineError::Manifest(_) => PipelineState::ManifestBuild,
        }
    }

    /// Wrap an I/O error with the state it happened in
    pub fn fs(stage: PipelineState, source: std::io::Error) -> Self {
        PipelineError::FileSystem { stage, source }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - e.g., pipeline already running for the session
    #[error("Conflict: {0}")]
    Conflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// recon-common error
    #[error("Common error: {0}")]
    Common(#[from] recon_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Common(recon_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
