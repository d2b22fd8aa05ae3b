//! Pipeline state machine
//!
//! A session run progresses through fixed states:
//! IDLE → FEATURE_EXTRACTION → MATCHING → RECONSTRUCTION → TEXT_CONVERSION →
//! MANIFEST_BUILD → TRAINING → MESH_EXPORT → DONE
//!
//! FAILED is reachable from any non-terminal state. DONE and FAILED are
//! terminal; nothing transitions out of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::error::PipelineError;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Not started
    Idle,
    /// Keypoint detection over the session images
    FeatureExtraction,
    /// Exhaustive pairwise feature matching
    Matching,
    /// Sparse reconstruction (camera poses + point cloud)
    Reconstruction,
    /// Binary sparse model → text files
    TextConversion,
    /// Text files → transforms.json
    ManifestBuild,
    /// NeRF training to a snapshot
    Training,
    /// Snapshot → mesh
    MeshExport,
    /// All stages succeeded
    Done,
    /// A stage failed; the run halted
    Failed,
}

impl PipelineState {
    /// Next state on success, `None` for terminal states
    pub fn next(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Idle => Some(FeatureExtraction),
            FeatureExtraction => Some(Matching),
            Matching => Some(Reconstruction),
            Reconstruction => Some(TextConversion),
            TextConversion => Some(ManifestBuild),
            ManifestBuild => Some(Training),
            Training => Some(MeshExport),
            MeshExport => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Whether `new_state` is a legal successor of `self`
    pub fn can_transition_to(self, new_state: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        new_state == PipelineState::Failed || self.next() == Some(new_state)
    }

    /// Short name used in logs and diagnostics
    pub fn name(self) -> &'static str {
        use PipelineState::*;
        match self {
            Idle => "idle",
            FeatureExtraction => "feature extraction",
            Matching => "feature matching",
            Reconstruction => "sparse reconstruction",
            TextConversion => "model text conversion",
            ManifestBuild => "manifest build",
            Training => "NeRF training",
            MeshExport => "mesh export",
            Done => "done",
            Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State transition record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub old_state: PipelineState,
    pub new_state: PipelineState,
    pub transitioned_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal pipeline transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// In-memory state of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineMachine {
    state: PipelineState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    transitions: Vec<StateTransition>,
}

impl Default for PipelineMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMachine {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            started_at: Utc::now(),
            ended_at: None,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Every transition taken so far, oldest first
    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transition to `new_state` if legal
    pub fn transition_to(
        &mut self,
        new_state: PipelineState,
    ) -> Result<StateTransition, TransitionError> {
        if !self.state.can_transition_to(new_state) {
            return Err(TransitionError {
                from: self.state,
                to: new_state,
            });
        }

        let transition = StateTransition {
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;
        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }
        self.transitions.push(transition.clone());

        Ok(transition)
    }

    /// Move to the successor state
    pub fn advance(&mut self) -> Result<StateTransition, TransitionError> {
        match self.state.next() {
            Some(next) => self.transition_to(next),
            None => Err(TransitionError {
                from: self.state,
                to: self.state,
            }),
        }
    }

    /// Move to FAILED
    pub fn fail(&mut self) -> Result<StateTransition, TransitionError> {
        self.transition_to(PipelineState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Result of one external stage invocation
///
/// Transient: drives orchestrator branching and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Non-zero exit; `None` when killed by a signal
    ProcessFailed(Option<i32>),
    /// Exit was clean but the required artifact is absent
    ArtifactMissing(PathBuf),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    /// Convert a non-success outcome into the pipeline error for `stage`
    pub fn into_result(self, stage: PipelineState) -> Result<(), PipelineError> {
        match self {
            StageOutcome::Success => Ok(()),
            StageOutcome::ProcessFailed(code) => {
                Err(PipelineError::ProcessExitNonZero { stage, code })
            }
            StageOutcome::ArtifactMissing(path) => {
                Err(PipelineError::ArtifactMissing { stage, path })
            }
        }
    }
}
