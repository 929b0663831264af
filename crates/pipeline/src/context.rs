//! Explicitly owned state for one batch run.
//!
//! A [`PipelineContext`] is built once per run and shared by handle. It
//! owns the memory accountant, the resource registry, the optional
//! result cache and the cancellation token, and knows how to build the
//! configured backends and collaborators.

use std::sync::Arc;

use storyframe_backends::command::CommandLoader;
use storyframe_backends::{GenerationBackend, LocalEngine, RemoteService};
use storyframe_core::cache::ResultCache;
use storyframe_core::clock::Clock;
use storyframe_core::config::{BackendKind, PipelineConfig};
use storyframe_core::guard::ResourceRegistry;
use storyframe_core::memory::{DeviceMemory, MemoryAccountant};
use tokio_util::sync::CancellationToken;

use crate::chain::BackendChain;
use crate::collaborators::{HttpPromptWriter, HttpQualityScorer, PromptWriter, QualityScorer};
use crate::error::PipelineError;
use crate::prompt_adapter::PromptAdapter;
use crate::refinement::RefinementController;

pub struct PipelineContext {
    pub config: PipelineConfig,
    pub accountant: Arc<MemoryAccountant>,
    pub registry: Arc<ResourceRegistry>,
    /// `None` when caching is disabled.
    pub cache: Option<ResultCache>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("accountant", &self.accountant)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Validate `config`, open the cache if enabled and set up shared state.
    pub async fn new(
        config: PipelineConfig,
        device: Arc<dyn DeviceMemory>,
    ) -> Result<Arc<Self>, PipelineError> {
        config.validate()?;
        let cache = if config.cache_enabled {
            Some(ResultCache::open(&config.cache_dir).await?)
        } else {
            None
        };
        Ok(Self::assemble(config, device, cache))
    }

    /// Like [`new`](Self::new) with an explicit clock for the cache.
    pub async fn with_clock(
        config: PipelineConfig,
        device: Arc<dyn DeviceMemory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, PipelineError> {
        config.validate()?;
        let cache = if config.cache_enabled {
            Some(ResultCache::with_clock(&config.cache_dir, clock).await?)
        } else {
            None
        };
        Ok(Self::assemble(config, device, cache))
    }

    fn assemble(
        config: PipelineConfig,
        device: Arc<dyn DeviceMemory>,
        cache: Option<ResultCache>,
    ) -> Arc<Self> {
        let accountant = MemoryAccountant::new(device, config.memory_safety_margin_bytes);
        Arc::new(Self {
            config,
            accountant,
            registry: ResourceRegistry::new(),
            cache,
            cancel: CancellationToken::new(),
        })
    }

    /// Request cooperative cancellation of the running batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Release every resource still held. Returns how many cleanups ran.
    pub fn shutdown(&self) -> usize {
        self.registry.cleanup_all()
    }

    // ---- builders ----

    pub fn build_backend(
        &self,
        kind: BackendKind,
    ) -> Result<Arc<dyn GenerationBackend>, PipelineError> {
        let backend: Arc<dyn GenerationBackend> = match kind {
            BackendKind::Remote => Arc::new(RemoteService::new(
                self.config.remote_host.clone(),
                self.config.request_timeout,
            )?),
            BackendKind::Local => {
                let loader = CommandLoader::new(
                    self.config.local_engine.clone(),
                    self.config.request_timeout,
                );
                Arc::new(LocalEngine::new(
                    Arc::new(loader),
                    Arc::clone(&self.accountant),
                    Arc::clone(&self.registry),
                ))
            }
        };
        Ok(backend)
    }

    /// Primary and optional secondary backend from config.
    pub fn backend_chain(&self) -> Result<BackendChain, PipelineError> {
        let primary = self.build_backend(self.config.primary_backend)?;
        let secondary = match self.config.secondary_backend {
            Some(kind) => Some(self.build_backend(kind)?),
            None => None,
        };
        Ok(BackendChain::new(primary, secondary))
    }

    /// Prompt adapter, using the prompt service when one is configured.
    ///
    /// A client that cannot be built is logged and the template is used.
    pub fn prompt_adapter(&self) -> PromptAdapter {
        let params = &self.config.generation;
        let writer = self.config.prompt_service_url.as_ref().and_then(|url| {
            match HttpPromptWriter::new(url.clone(), self.config.collaborator_timeout) {
                Ok(w) => Some(Arc::new(w) as Arc<dyn PromptWriter>),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Prompt service client unavailable");
                    None
                }
            }
        });
        PromptAdapter::new(writer, params.width, params.height)
    }

    /// Refinement controller, scoring through the scoring service when enabled.
    pub fn refinement_controller(&self) -> RefinementController {
        let scorer = if self.config.scoring_enabled {
            self.config.scoring_service_url.as_ref().and_then(|url| {
                match HttpQualityScorer::new(url.clone(), self.config.collaborator_timeout) {
                    Ok(s) => Some(Arc::new(s) as Arc<dyn QualityScorer>),
                    Err(e) => {
                        tracing::warn!(
                            url = %url,
                            error = %e,
                            "Scoring service client unavailable",
                        );
                        None
                    }
                }
            })
        } else {
            None
        };
        RefinementController::new(
            scorer,
            self.config.quality_threshold,
            self.config.max_refinement_iterations,
        )
    }
}
