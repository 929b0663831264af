//! Primary/secondary backend fallback.
//!
//! The primary backend is tried first. On any error that permits fallback
//! the secondary is tried exactly once; its outcome is final. Validation
//! errors are returned immediately.

use std::sync::Arc;
use std::time::Instant;

use storyframe_backends::{BackendError, GenerationBackend};
use storyframe_core::generation::{GenerationRequest, GenerationResult};

/// The backends one scene may use, in order.
#[derive(Clone)]
pub struct BackendChain {
    primary: Arc<dyn GenerationBackend>,
    secondary: Option<Arc<dyn GenerationBackend>>,
}

impl std::fmt::Debug for BackendChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendChain")
            .field("primary", &self.primary.id())
            .field("secondary", &self.secondary.as_ref().map(|b| b.id()))
            .finish()
    }
}

impl BackendChain {
    pub fn new(
        primary: Arc<dyn GenerationBackend>,
        secondary: Option<Arc<dyn GenerationBackend>>,
    ) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &Arc<dyn GenerationBackend> {
        &self.primary
    }

    /// Generate with fallback. Returns the result and the backend that produced it.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<(GenerationResult, Arc<dyn GenerationBackend>), BackendError> {
        let primary_err = match timed(&self.primary, request).await {
            Ok(result) => return Ok((result, Arc::clone(&self.primary))),
            Err(e) => e,
        };

        if !primary_err.allows_fallback() {
            return Err(primary_err);
        }
        let Some(secondary) = &self.secondary else {
            tracing::warn!(
                scene_index = request.scene_index,
                backend = self.primary.id(),
                error = %primary_err,
                "Generation failed and no fallback backend is configured",
            );
            return Err(primary_err);
        };

        tracing::warn!(
            scene_index = request.scene_index,
            primary = self.primary.id(),
            secondary = secondary.id(),
            error = %primary_err,
            "Primary backend failed, falling back",
        );

        match timed(secondary, request).await {
            Ok(result) => Ok((result, Arc::clone(secondary))),
            Err(e) => {
                tracing::error!(
                    scene_index = request.scene_index,
                    backend = secondary.id(),
                    error = %e,
                    "Fallback backend failed",
                );
                Err(e)
            }
        }
    }
}

/// Run one backend call and wrap its image in a [`GenerationResult`].
pub async fn timed(
    backend: &Arc<dyn GenerationBackend>,
    request: &GenerationRequest,
) -> Result<GenerationResult, BackendError> {
    let start = Instant::now();
    let image = backend.generate(request).await?;
    let wall_time = start.elapsed();
    tracing::info!(
        scene_index = request.scene_index,
        backend = backend.id(),
        elapsed_ms = wall_time.as_millis() as u64,
        "Generation finished",
    );
    Ok(GenerationResult {
        image,
        backend_used: backend.id().to_string(),
        wall_time,
        raw_score: None,
    })
}
