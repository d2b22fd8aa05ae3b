//! Pipeline configuration
//!
//! [`PipelineConfig`] is built once from the bootstrap TOML and handed to
//! the orchestrator at construction. Stages never read process-wide state.

use recon_common::config::TomlConfig;
use std::path::PathBuf;

/// External tool locations and run parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// COLMAP executable
    pub colmap: PathBuf,
    /// Python interpreter for the NeRF scripts
    pub python: PathBuf,
    /// instant-ngp checkout, used as working directory for training/export
    pub nerf_root: PathBuf,
    /// Training/export script relative to `nerf_root`
    pub nerf_script: PathBuf,
    /// Camera model for feature extraction
    pub camera_model: String,
    pub training_steps: u32,
    /// Marching cubes resolution for mesh export
    pub mesh_resolution: u32,
}

impl PipelineConfig {
    pub fn from_toml(config: &TomlConfig) -> Self {
        Self {
            colmap: config.tools.colmap.clone(),
            python: config.tools.python.clone(),
            nerf_root: config.tools.nerf_root.clone(),
            nerf_script: config.tools.nerf_script.clone(),
            camera_model: config.tools.camera_model.clone(),
            training_steps: config.training.steps,
            mesh_resolution: config.training.mesh_resolution,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_toml(&TomlConfig::default())
    }
}
