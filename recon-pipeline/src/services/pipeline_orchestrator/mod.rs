//! Pipeline orchestrator
//!
//! Drives one session through the reconstruction pipeline.
//!
//! # State Progression
//! FEATURE_EXTRACTION → MATCHING → RECONSTRUCTION → TEXT_CONVERSION →
//! MANIFEST_BUILD → TRAINING → MESH_EXPORT → DONE
//!
//! Each state is looked up in [`PIPELINE`], which names its executor and the
//! progress checkpoint reported on entry. Stages run strictly one after
//! another. The first failure moves the run to FAILED, reports it, and
//! nothing after it runs.

use std::sync::Arc;

use recon_common::events::EventPublisher;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{
    PipelineMachine, PipelineState, SessionWorkspace, StateTransition, TransitionError,
};
use crate::services::manifest_builder::ManifestBuilder;
use crate::services::mesh_converter;
use crate::services::stage_runner::{StageRunner, StageSpec};

mod stages;

/// What a state does
#[derive(Clone, Copy)]
enum StepExecutor {
    /// External program built from an argument template
    External(fn(&PipelineConfig, &SessionWorkspace) -> StageSpec),
    /// In-process manifest build
    BuildManifest,
}

/// One row of the transition table
#[derive(Clone, Copy)]
struct Step {
    state: PipelineState,
    /// Progress checkpoint emitted when the state is entered
    percent: u8,
    text: &'static str,
    executor: StepExecutor,
}

/// Transition table, in state order
const PIPELINE: [Step; 7] = [
    Step {
        state: PipelineState::FeatureExtraction,
        percent: 5,
        text: "Extracting features",
        executor: StepExecutor::External(stages::feature_extraction),
    },
    Step {
        state: PipelineState::Matching,
        percent: 15,
        text: "Matching features",
        executor: StepExecutor::External(stages::matching),
    },
    Step {
        state: PipelineState::Reconstruction,
        percent: 25,
        text: "Running sparse reconstruction",
        executor: StepExecutor::External(stages::reconstruction),
    },
    Step {
        state: PipelineState::TextConversion,
        percent: 40,
        text: "Converting reconstruction to text",
        executor: StepExecutor::External(stages::text_conversion),
    },
    Step {
        state: PipelineState::ManifestBuild,
        percent: 45,
        text: "Building scene manifest",
        executor: StepExecutor::BuildManifest,
    },
    Step {
        state: PipelineState::Training,
        percent: 50,
        text: "Training NeRF",
        executor: StepExecutor::External(stages::training),
    },
    Step {
        state: PipelineState::MeshExport,
        percent: 90,
        text: "Exporting mesh",
        executor: StepExecutor::External(stages::mesh_export),
    },
];

/// Final progress text of a successful run
pub const SUCCESS_TEXT: &str = "Processing complete";

/// Pipeline orchestrator service
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    runner: StageRunner,
    manifest_builder: ManifestBuilder,
}

impl PipelineOrchestrator {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            runner: StageRunner::new(),
            manifest_builder: ManifestBuilder::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute the complete pipeline for one session
    ///
    /// Always ends the event stream with a terminal progress event: success
    /// after the last stage, or a diagnostic log plus a failed event at the
    /// first failure. The error is also returned to the caller.
    pub async fn run(
        &self,
        workspace: &SessionWorkspace,
        publisher: &EventPublisher,
        cancel: &CancellationToken,
    ) -> Result<PipelineMachine, PipelineError> {
        let session_id = workspace.id();
        let mut machine = PipelineMachine::new();
        info!(session_id = %session_id, "Starting reconstruction pipeline");

        for step in PIPELINE.iter() {
            record(machine.advance());
            let result = self.execute(step, workspace, publisher, cancel).await;

            if let Err(e) = result {
                record(machine.fail());
                error!(
                    session_id = %session_id,
                    stage = %e.stage(),
                    error = %e,
                    "Pipeline failed"
                );
                report_failure(&e, publisher).await;
                return Err(e);
            }
        }

        record(machine.advance());
        publisher.succeed(SUCCESS_TEXT).await;

        let elapsed = machine
            .ended_at()
            .map(|end| (end - machine.started_at()).num_seconds())
            .unwrap_or_default();
        info!(
            session_id = %session_id,
            elapsed_seconds = elapsed,
            transitions = machine.transitions().len(),
            "Reconstruction pipeline completed"
        );
        Ok(machine)
    }

    async fn execute(
        &self,
        step: &Step,
        workspace: &SessionWorkspace,
        publisher: &EventPublisher,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: step.state });
        }

        publisher.progress(step.percent, step.text).await;
        publisher.log(format!("==> {}", step.text)).await;
        prepare_directories(step.state, workspace).await?;

        match step.executor {
            StepExecutor::External(template) => {
                let spec = template(&self.config, workspace);
                self.runner.run(&spec, publisher, cancel).await?;
            }
            StepExecutor::BuildManifest => {
                let manifest = self.manifest_builder.build(workspace).await?;
                publisher
                    .log(format!(
                        "Wrote {} with {} frames",
                        workspace.manifest_path().display(),
                        manifest.frames.len()
                    ))
                    .await;
            }
        }

        if step.state == PipelineState::MeshExport {
            convert_mesh(workspace, publisher).await;
        }
        Ok(())
    }
}

/// The table follows the state machine's order, so a rejected transition
/// is only logged
fn record(transition: Result<StateTransition, TransitionError>) {
    if let Err(e) = transition {
        warn!(error = %e, "Unexpected pipeline transition");
    }
}

/// Create the output directory a stage writes into
async fn prepare_directories(
    state: PipelineState,
    workspace: &SessionWorkspace,
) -> Result<(), PipelineError> {
    let dir = match state {
        PipelineState::Reconstruction => workspace.sparse_dir(),
        PipelineState::TextConversion => workspace.text_dir(),
        PipelineState::Training => workspace.nerf_output_dir(),
        _ => return Ok(()),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| PipelineError::fs(state, e))
}

/// Convert the exported PLY to OBJ; failure only warns
async fn convert_mesh(workspace: &SessionWorkspace, publisher: &EventPublisher) {
    let ply = workspace.mesh_ply_path();
    let obj = workspace.mesh_obj_path();
    let result = tokio::task::spawn_blocking(move || mesh_converter::convert_ply_to_obj(&ply, &obj)).await;

    match result {
        Ok(Ok((vertices, faces))) => {
            publisher
                .log(format!(
                    "Converted mesh to OBJ ({} vertices, {} faces)",
                    vertices, faces
                ))
                .await;
        }
        Ok(Err(e)) => {
            warn!(session_id = %workspace.id(), error = %e, "OBJ conversion failed");
            publisher
                .log(format!("Warning: OBJ conversion failed: {}", e))
                .await;
        }
        Err(e) => {
            warn!(session_id = %workspace.id(), error = %e, "OBJ conversion task failed");
            publisher
                .log(format!("Warning: OBJ conversion failed: {}", e))
                .await;
        }
    }
}

/// Diagnostic log line(s) and terminal failure event for `error`
async fn report_failure(error: &PipelineError, publisher: &EventPublisher) {
    let detail = match error {
        PipelineError::MissingExecutable { .. } => {
            Some("Check the [tools] section of the configuration.".to_string())
        }
        PipelineError::ArtifactMissing {
            stage: PipelineState::Reconstruction,
            ..
        } => Some("Reconstruction produced no model; the images may not overlap enough.".to_string()),
        PipelineError::FileSystem { source, .. } => Some(source.to_string()),
        _ => None,
    };

    publisher
        .fail_with_diagnostic(
            &error.to_string(),
            detail.as_deref(),
            format!("Failed during {}", error.stage()),
        )
        .await;
}
