use storyframe_backends::BackendError;
use storyframe_core::error::CoreError;

use crate::report::BatchReport;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Every attempted scene failed. The report lists the reason per scene.
    #[error("All {attempted} scenes failed")]
    AllScenesFailed {
        attempted: usize,
        report: Box<BatchReport>,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}
