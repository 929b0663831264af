//! The backend contract shared by every generation variant.

use async_trait::async_trait;
use storyframe_core::generation::{GenerationRequest, RawImage};

use crate::error::BackendError;

/// One concrete way of turning a [`GenerationRequest`] into an image.
///
/// Adding a backend means adding an implementation of this trait; callers
/// never branch on which variant they hold.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Stable identifier used in logs, reports and cache keys.
    fn id(&self) -> &str;

    /// Run one generation.
    async fn generate(&self, request: &GenerationRequest) -> Result<RawImage, BackendError>;
}
