//! Session supervisor
//!
//! Runs a pipeline in its own task and guarantees the session stream ends
//! with a terminal event even when the pipeline task panics or returns
//! without reporting.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use recon_common::events::EventPublisher;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{PipelineMachine, SessionWorkspace};
use crate::services::PipelineOrchestrator;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Await `task` on its own tokio task and close the stream if it did not
///
/// Returns the failure description, if any.
pub async fn supervise<F>(session_id: Uuid, publisher: EventPublisher, task: F) -> Result<(), String>
where
    F: Future<Output = Result<PipelineMachine, PipelineError>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            let summary = e.to_string();
            if !publisher.is_terminated() {
                publisher
                    .fail_with_diagnostic(&summary, None, format!("Failed during {}", e.stage()))
                    .await;
            }
            Err(summary)
        }
        Err(join_error) => {
            let detail = if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                join_error.to_string()
            };
            error!(session_id = %session_id, detail = %detail, "Pipeline task aborted");

            if !publisher.is_terminated() {
                publisher
                    .fail_with_diagnostic(
                        "pipeline aborted unexpectedly",
                        Some(&detail),
                        "Processing aborted",
                    )
                    .await;
            }
            Err(format!("pipeline aborted: {}", detail))
        }
    }
}

/// Run the full pipeline for `workspace` under supervision
pub async fn run_session(
    orchestrator: Arc<PipelineOrchestrator>,
    workspace: SessionWorkspace,
    publisher: EventPublisher,
    cancel: CancellationToken,
) -> Result<(), String> {
    let session_id = workspace.id();
    let task_publisher = publisher.clone();
    let task = async move {
        orchestrator
            .run(&workspace, &task_publisher, &cancel)
            .await
    };

    let result = supervise(session_id, publisher, task).await;
    info!(
        session_id = %session_id,
        success = result.is_ok(),
        "Session pipeline finished"
    );
    result
}
