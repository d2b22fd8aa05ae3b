//! Data models for the reconstruction pipeline

pub mod manifest;
pub mod pipeline_state;
pub mod session;

pub use manifest::{
    compose_transform, CameraIntrinsics, PoseFrame, Quaternion, SceneManifest, TransformMatrix,
    AABB_SCALE,
};
pub use pipeline_state::{
    PipelineMachine, PipelineState, StageOutcome, StateTransition, TransitionError,
};
pub use session::{ArtifactStatus, SessionStore, SessionWorkspace};
