//! Scene orchestration for the storyframe pipeline.
//!
//! [`orchestrator::SceneOrchestrator`] turns a list of scene descriptions
//! into accepted images: cache lookup, prompt adaptation, continuity
//! guidance, primary/secondary backend fallback, the quality-gated
//! refinement loop, upscaling and persistence. All shared state lives in
//! one [`context::PipelineContext`] per batch run.

pub mod chain;
pub mod collaborators;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod prompt_adapter;
pub mod refinement;
pub mod report;

pub use context::PipelineContext;
pub use error::PipelineError;
pub use orchestrator::SceneOrchestrator;
pub use report::BatchReport;
