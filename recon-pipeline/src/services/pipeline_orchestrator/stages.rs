//! Argument templates for the external stages
//!
//! These follow the COLMAP and instant-ngp command line interfaces and must
//! match them exactly. All paths are absolute (the session directory is
//! canonicalized by the store), so the working directory only matters for
//! the NeRF script, which runs from `nerf_root`.

use crate::config::PipelineConfig;
use crate::models::{PipelineState, SessionWorkspace};
use crate::services::stage_runner::{ArtifactCheck, StageSpec};

fn colmap(config: &PipelineConfig, workspace: &SessionWorkspace, state: PipelineState) -> StageSpec {
    StageSpec::new(state, &config.colmap, workspace.dir())
}

fn nerf_script(config: &PipelineConfig, state: PipelineState) -> StageSpec {
    StageSpec::new(state, &config.python, &config.nerf_root).arg(&config.nerf_script)
}

pub(super) fn feature_extraction(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    colmap(config, workspace, PipelineState::FeatureExtraction)
        .arg("feature_extractor")
        .arg("--database_path")
        .arg(workspace.database_path())
        .arg("--image_path")
        .arg(workspace.images_dir())
        .arg("--ImageReader.camera_model")
        .arg(&config.camera_model)
        .requires(workspace.images_dir())
}

pub(super) fn matching(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    colmap(config, workspace, PipelineState::Matching)
        .arg("exhaustive_matcher")
        .arg("--database_path")
        .arg(workspace.database_path())
}

pub(super) fn reconstruction(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    colmap(config, workspace, PipelineState::Reconstruction)
        .arg("mapper")
        .arg("--database_path")
        .arg(workspace.database_path())
        .arg("--image_path")
        .arg(workspace.images_dir())
        .arg("--output_path")
        .arg(workspace.sparse_dir())
        .produces(ArtifactCheck::NonEmptyDir(workspace.sparse_dir()))
}

pub(super) fn text_conversion(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    colmap(config, workspace, PipelineState::TextConversion)
        .arg("model_converter")
        .arg("--input_path")
        .arg(workspace.sparse_model_dir())
        .arg("--output_path")
        .arg(workspace.text_dir())
        .arg("--output_type")
        .arg("TXT")
        .requires(workspace.sparse_model_dir())
        .produces(ArtifactCheck::File(workspace.images_txt()))
}

pub(super) fn training(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    let mut training_data = std::ffi::OsString::from("--training_data=");
    training_data.push(workspace.manifest_path());

    nerf_script(config, PipelineState::Training)
        .arg(training_data)
        .arg("--n_steps")
        .arg(config.training_steps.to_string())
        .arg("--save_snapshot")
        .arg(workspace.snapshot_path())
        .requires(workspace.manifest_path())
        .produces(ArtifactCheck::File(workspace.snapshot_path()))
}

pub(super) fn mesh_export(config: &PipelineConfig, workspace: &SessionWorkspace) -> StageSpec {
    nerf_script(config, PipelineState::MeshExport)
        .arg("--load_snapshot")
        .arg(workspace.snapshot_path())
        .arg("--save_mesh")
        .arg(workspace.mesh_ply_path())
        .arg("--marching_cubes_res")
        .arg(config.mesh_resolution.to_string())
        .requires(workspace.snapshot_path())
        .produces(ArtifactCheck::File(workspace.mesh_ply_path()))
}
