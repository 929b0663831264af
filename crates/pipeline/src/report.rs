//! Per-scene and per-batch results.

use std::path::PathBuf;

use serde::Serialize;
use storyframe_backends::BackendError;
use storyframe_core::types::SceneIndex;

/// Where a completed scene's image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneSource {
    Cache,
    Generated,
}

/// Why a scene produced no image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ResourceExhausted,
    BackendUnavailable,
    GenerationFailed,
    Validation,
    OutputFailed,
    Cancelled,
}

impl From<&BackendError> for FailureReason {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::ResourceExhausted { .. } => Self::ResourceExhausted,
            BackendError::Unavailable(_) => Self::BackendUnavailable,
            BackendError::Failed(_) => Self::GenerationFailed,
            BackendError::Validation(_) => Self::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl SceneFailure {
    pub fn cancelled() -> Self {
        Self {
            reason: FailureReason::Cancelled,
            message: "batch cancelled".to_string(),
        }
    }
}

impl From<BackendError> for SceneFailure {
    fn from(err: BackendError) -> Self {
        Self {
            reason: FailureReason::from(&err),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedScene {
    pub path: PathBuf,
    pub source: SceneSource,
    pub backend: String,
    pub score: Option<f64>,
    /// Refinements performed after the initial attempt.
    pub iterations: u32,
    /// The refinement budget ran out and the best candidate was kept.
    pub gave_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SceneOutcome {
    Completed(CompletedScene),
    Failed(SceneFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneReport {
    pub index: SceneIndex,
    pub description: String,
    #[serde(flatten)]
    pub outcome: SceneOutcome,
}

impl SceneReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SceneOutcome::Completed(_))
    }

    pub fn completed(&self) -> Option<&CompletedScene> {
        match &self.outcome {
            SceneOutcome::Completed(c) => Some(c),
            SceneOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SceneFailure> {
        match &self.outcome {
            SceneOutcome::Failed(f) => Some(f),
            SceneOutcome::Completed(_) => None,
        }
    }
}

/// Result of one batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub scenes: Vec<SceneReport>,
    /// Input scenes dropped by the max-scenes budget.
    pub truncated: usize,
    pub cancelled: bool,
    pub peak_memory_bytes: u64,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.scenes.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.scenes.len() - self.succeeded()
    }

    /// Scenes that ran (not skipped by cancellation).
    pub fn attempted(&self) -> usize {
        self.scenes
            .iter()
            .filter(|s| s.failure().is_none_or(|f| f.reason != FailureReason::Cancelled))
            .count()
    }
}
