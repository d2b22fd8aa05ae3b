//! HTTP API handlers for recon-pipeline

pub mod health;
pub mod process;
pub mod sessions;

pub use health::health_routes;
pub use process::process_routes;
pub use sessions::session_routes;

use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Parse the `:session_id` path segment
///
/// Session ids name directories under the upload root, so only canonical
/// UUIDs are accepted.
pub(crate) fn parse_session_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id: {}", raw)))
}
