//! Pipeline services

pub mod manifest_builder;
pub mod mesh_converter;
pub mod pipeline_orchestrator;
pub mod session_runner;
pub mod stage_runner;

pub use manifest_builder::{ManifestBuilder, ManifestError};
pub use mesh_converter::{convert_ply_to_obj, MeshError};
pub use pipeline_orchestrator::PipelineOrchestrator;
pub use session_runner::{run_session, supervise};
pub use stage_runner::{ArtifactCheck, StageProcess, StageRunner, StageSpec};
