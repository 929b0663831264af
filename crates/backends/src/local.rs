//! In-process inference on the local accelerator.
//!
//! [`LocalEngine`] loads its inference pipeline lazily on first use and
//! keeps it loaded across calls. The loaded pipeline is owned by a
//! resource guard, so releasing it (after a failure, on shutdown or via
//! the registry's `cleanup_all`) runs the loader's cleanup exactly once.
//!
//! Every call is gated by the memory accountant: the admission is sized
//! from the request's width, height and steps (plus the pipeline footprint
//! when a load is needed) and the ticket is held for exactly the duration
//! of the call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use storyframe_core::config::BackendKind;
use storyframe_core::generation::{GenerationRequest, RawImage, PIPELINE_FOOTPRINT_MB};
use storyframe_core::guard::{Guard, ResourceRegistry};
use storyframe_core::memory::MemoryAccountant;
use storyframe_core::types::BYTES_PER_MB;
use tokio::sync::Mutex;

use crate::backend::GenerationBackend;
use crate::error::BackendError;

/// A loaded inference pipeline.
#[async_trait]
pub trait InferencePipeline: Send + Sync {
    async fn run(&self, request: &GenerationRequest) -> Result<RawImage, BackendError>;
}

/// A pipeline together with the guard that unloads it.
pub struct LoadedPipeline {
    pub pipeline: Arc<dyn InferencePipeline>,
    pub guard: Guard,
}

impl std::fmt::Debug for LoadedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPipeline")
            .field("guard", &self.guard.name())
            .field("released", &self.guard.is_released())
            .finish_non_exhaustive()
    }
}

/// Knows how to bring an inference pipeline up.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    /// Load the pipeline, registering its cleanup with `registry`.
    async fn load(&self, registry: &Arc<ResourceRegistry>) -> Result<LoadedPipeline, BackendError>;

    /// Device memory the loaded pipeline occupies.
    fn footprint_bytes(&self) -> u64 {
        PIPELINE_FOOTPRINT_MB * BYTES_PER_MB
    }
}

/// Local inference backend.
pub struct LocalEngine {
    loader: Arc<dyn PipelineLoader>,
    accountant: Arc<MemoryAccountant>,
    registry: Arc<ResourceRegistry>,
    /// Memoized pipeline. The lock also serializes calls on the device.
    loaded: Mutex<Option<LoadedPipeline>>,
    loads: AtomicU32,
}

impl LocalEngine {
    pub fn new(
        loader: Arc<dyn PipelineLoader>,
        accountant: Arc<MemoryAccountant>,
        registry: Arc<ResourceRegistry>,
    ) -> Self {
        Self {
            loader,
            accountant,
            registry,
            loaded: Mutex::new(None),
            loads: AtomicU32::new(0),
        }
    }

    /// How many times the pipeline has been loaded.
    pub fn load_count(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Whether a live pipeline is currently held.
    pub async fn is_loaded(&self) -> bool {
        self.loaded
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.guard.is_released())
    }

    /// Drop the loaded pipeline, running its cleanup.
    pub async fn unload(&self) {
        if let Some(loaded) = self.loaded.lock().await.take() {
            tracing::info!(resource = loaded.guard.name(), "Unloading local pipeline");
            loaded.guard.release();
        }
    }
}

#[async_trait]
impl GenerationBackend for LocalEngine {
    fn id(&self) -> &str {
        BackendKind::Local.id()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<RawImage, BackendError> {
        request.validate()?;

        let mut slot = self.loaded.lock().await;
        // A guard released from outside (e.g. cleanup_all) means the pipeline is gone.
        let needs_load = slot.as_ref().is_none_or(|p| p.guard.is_released());

        let mut required = request.activation_bytes();
        if needs_load {
            required += self.loader.footprint_bytes();
        }
        let ticket = self.accountant.admit(required)?;

        if needs_load {
            slot.take();
            tracing::info!(scene_index = request.scene_index, "Loading local inference pipeline");
            let loaded = self.loader.load(&self.registry).await?;
            self.loads.fetch_add(1, Ordering::SeqCst);
            *slot = Some(loaded);
        }

        let pipeline = match slot.as_ref() {
            Some(loaded) => Arc::clone(&loaded.pipeline),
            None => return Err(BackendError::Unavailable("pipeline not loaded".to_string())),
        };

        let result = pipeline.run(request).await;
        drop(ticket);

        match result {
            Ok(img) => Ok(img),
            Err(BackendError::Validation(msg)) => Err(BackendError::Validation(msg)),
            Err(e) => {
                tracing::warn!(
                    scene_index = request.scene_index,
                    error = %e,
                    "Local generation failed, freeing pipeline",
                );
                if let Some(loaded) = slot.take() {
                    loaded.guard.release();
                }
                Err(BackendError::Failed(e.to_string()))
            }
        }
    }
}
