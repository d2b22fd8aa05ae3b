//! Configuration loading and config file resolution
//!
//! Bootstrap configuration comes from a TOML file. Every field has a
//! compiled default, so a missing default config file is not fatal.
//!
//! # Config file priority
//! 1. Command-line argument (highest priority)
//! 2. `RECON_CONFIG` environment variable
//! 3. `<platform config dir>/recon/recon.toml` (only if it exists)
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RECON_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and session storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Parent directory of all session working directories
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
}

/// Locations of the external reconstruction/training programs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// COLMAP executable (bare name is looked up on PATH)
    #[serde(default = "default_colmap")]
    pub colmap: PathBuf,

    /// Python interpreter used to run the NeRF scripts
    #[serde(default = "default_python")]
    pub python: PathBuf,

    /// instant-ngp checkout; working directory for training and mesh export
    #[serde(default = "default_nerf_root")]
    pub nerf_root: PathBuf,

    /// Training/export script, relative to `nerf_root`
    #[serde(default = "default_nerf_script")]
    pub nerf_script: PathBuf,

    /// Camera model passed to the feature extractor
    #[serde(default = "default_camera_model")]
    pub camera_model: String,
}

/// Training and mesh export parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_training_steps")]
    pub steps: u32,

    /// Marching cubes grid resolution for mesh export
    #[serde(default = "default_mesh_resolution")]
    pub mesh_resolution: u32,
}

/// Event stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Capacity of each per-session event queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_upload_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("recon").join("uploads"))
        .unwrap_or_else(|| PathBuf::from("./uploads"))
}

fn default_colmap() -> PathBuf {
    PathBuf::from("colmap")
}

fn default_python() -> PathBuf {
    PathBuf::from("python3")
}

fn default_nerf_root() -> PathBuf {
    PathBuf::from("./instant-ngp")
}

fn default_nerf_script() -> PathBuf {
    PathBuf::from("scripts/run.py")
}

fn default_camera_model() -> String {
    "OPENCV".to_string()
}

fn default_training_steps() -> u32 {
    3500
}

fn default_mesh_resolution() -> u32 {
    256
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upload_root: default_upload_root(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            colmap: default_colmap(),
            python: default_python(),
            nerf_root: default_nerf_root(),
            nerf_script: default_nerf_script(),
            camera_model: default_camera_model(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: default_training_steps(),
            mesh_resolution: default_mesh_resolution(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Reject values no pipeline run could work with
    pub fn validate(&self) -> Result<()> {
        if self.training.steps == 0 {
            return Err(Error::Config("training.steps must be greater than 0".to_string()));
        }
        if self.training.mesh_resolution == 0 {
            return Err(Error::Config(
                "training.mesh_resolution must be greater than 0".to_string(),
            ));
        }
        if self.events.queue_capacity == 0 {
            return Err(Error::Config(
                "events.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.tools.camera_model.trim().is_empty() {
            return Err(Error::Config("tools.camera_model must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Platform default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("recon").join("recon.toml"))
}

/// Where the config file should come from, if anywhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Named on the command line or via `RECON_CONFIG`; must exist
    Explicit(PathBuf),
    /// Platform default location; may be absent
    Default(PathBuf),
    /// No file, compiled defaults only
    None,
}

/// Resolve the config file source following the priority order
pub fn resolve_config_source(cli_arg: Option<&Path>) -> ConfigSource {
    if let Some(path) = cli_arg {
        return ConfigSource::Explicit(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return ConfigSource::Explicit(PathBuf::from(path));
        }
    }

    match default_config_path() {
        Some(path) => ConfigSource::Default(path),
        None => ConfigSource::None,
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from this file
    File(PathBuf),
    /// Compiled defaults, with the reason no file was read
    Defaults(String),
}

impl ConfigOrigin {
    /// Report the origin; the defaults fallback is a warning
    ///
    /// Call after the tracing subscriber is installed.
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!("Loaded configuration from {}", path.display()),
            ConfigOrigin::Defaults(reason) => warn!("{}, using compiled defaults", reason),
        }
    }
}

/// Validated configuration plus its origin
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TomlConfig,
    pub origin: ConfigOrigin,
}

/// Load configuration from the resolved source
///
/// A missing default file falls back to compiled defaults, reported through
/// [`ConfigOrigin::Defaults`]. A missing or malformed explicit file is an
/// error.
pub fn load_config(source: &ConfigSource) -> Result<LoadedConfig> {
    let (config, origin) = match source {
        ConfigSource::Explicit(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Read config {} failed: {}", path.display(), e))
            })?;
            (
                TomlConfig::from_toml_str(&content)?,
                ConfigOrigin::File(path.clone()),
            )
        }
        ConfigSource::Default(path) if path.exists() => {
            let content = std::fs::read_to_string(path)?;
            (
                TomlConfig::from_toml_str(&content)?,
                ConfigOrigin::File(path.clone()),
            )
        }
        ConfigSource::Default(path) => (
            TomlConfig::default(),
            ConfigOrigin::Defaults(format!("No config file at {}", path.display())),
        ),
        ConfigSource::None => (
            TomlConfig::default(),
            ConfigOrigin::Defaults("Could not determine config directory".to_string()),
        ),
    };

    config.validate()?;
    Ok(LoadedConfig { config, origin })
}
