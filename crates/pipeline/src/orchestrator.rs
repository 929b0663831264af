//! Batch driver: scene descriptions in, per-scene results out.
//!
//! For each scene, in input order:
//!
//! 1. Derive the cache key; on a hit, reuse the cached image.
//! 2. Otherwise adapt the prompt and build continuity guidance from the
//!    previous accepted image (or the reference image for scene 0).
//! 3. Generate through the backend chain, then run the refinement loop
//!    on the backend that succeeded.
//! 4. Upscale, save and cache the final image on a background task, and
//!    hand the image to the next scene as continuity context.
//!
//! Only one generation call is ever in flight. The background task of
//! scene `i` is joined before scene `i + 1` reaches the device, so
//! persistence overlaps only with the next scene's preparation.
//!
//! A failed scene is recorded and the batch moves on. The batch itself
//! fails only when every attempted scene failed.

use std::sync::Arc;
use std::time::Duration;

use storyframe_core::cache::{CacheEntry, ResultCache};
use storyframe_core::continuity::ContinuityGuide;
use storyframe_core::generation::{GenerationRequest, RawImage};
use storyframe_core::hashing::{cache_key, CacheKeyInput};
use storyframe_core::prompt::{template_prompt, NarrativeContext};
use storyframe_core::types::SceneIndex;
use tokio::task::JoinHandle;

use crate::chain::BackendChain;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::output;
use crate::prompt_adapter::PromptAdapter;
use crate::refinement::{RefinementController, RefinementStatus, SceneAttempt};
use crate::report::{
    BatchReport, CompletedScene, FailureReason, SceneFailure, SceneOutcome, SceneReport,
    SceneSource,
};

// ---------------------------------------------------------------------------
// Continuity context
// ---------------------------------------------------------------------------

/// The single most recently accepted image of the running sequence.
#[derive(Debug, Default)]
pub struct ContinuityContext {
    previous: Option<Arc<RawImage>>,
    reference: Option<Arc<RawImage>>,
}

impl ContinuityContext {
    pub fn new(reference: Option<Arc<RawImage>>) -> Self {
        Self {
            previous: None,
            reference,
        }
    }

    /// Replace the held image with a scene's final output.
    pub fn accept(&mut self, image: Arc<RawImage>) {
        self.previous = Some(image);
    }

    pub fn previous(&self) -> Option<&Arc<RawImage>> {
        self.previous.as_ref()
    }

    /// Image to derive guidance from for scene `index`.
    pub fn source_for(&self, index: SceneIndex) -> Option<Arc<RawImage>> {
        match (&self.previous, &self.reference) {
            (Some(prev), _) => Some(Arc::clone(prev)),
            (None, Some(reference)) if index == 0 => Some(Arc::clone(reference)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Persistence of one scene still running in the background.
struct PendingScene {
    index: SceneIndex,
    description: String,
    key: String,
    handle: JoinHandle<SceneReport>,
}

/// Finished generation handed to the persistence task.
struct FinalImage {
    image: Arc<RawImage>,
    backend: String,
    score: f64,
    iterations: u32,
    gave_up: bool,
}

pub struct SceneOrchestrator {
    ctx: Arc<PipelineContext>,
    chain: BackendChain,
    prompts: PromptAdapter,
    refiner: RefinementController,
}

impl SceneOrchestrator {
    pub fn new(
        ctx: Arc<PipelineContext>,
        chain: BackendChain,
        prompts: PromptAdapter,
        refiner: RefinementController,
    ) -> Self {
        Self {
            ctx,
            chain,
            prompts,
            refiner,
        }
    }

    /// Build backends and collaborators from the context's config.
    pub fn from_context(ctx: Arc<PipelineContext>) -> Result<Self, PipelineError> {
        let chain = ctx.backend_chain()?;
        let prompts = ctx.prompt_adapter();
        let refiner = ctx.refinement_controller();
        Ok(Self::new(ctx, chain, prompts, refiner))
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Run one batch.
    pub async fn generate_scenes(
        &self,
        scenes: &[String],
        narrative: Option<&NarrativeContext>,
        reference: Option<RawImage>,
    ) -> Result<BatchReport, PipelineError> {
        let config = &self.ctx.config;
        config.generation.validate()?;

        let max_scenes = config.max_scenes;
        let batch = &scenes[..scenes.len().min(max_scenes)];
        let truncated = scenes.len() - batch.len();
        if truncated > 0 {
            tracing::info!(
                requested = scenes.len(),
                max_scenes,
                dropped = truncated,
                "Scene list truncated to budget",
            );
        }

        self.ctx.accountant.reset();
        self.purge_stale_cache().await;
        let mut report = BatchReport {
            truncated,
            ..Default::default()
        };
        let mut continuity = ContinuityContext::new(reference.map(Arc::new));
        let mut pending: Option<PendingScene> = None;

        for (index, description) in batch.iter().enumerate() {
            if self.ctx.is_cancelled() {
                break;
            }
            tracing::info!(scene_index = index, total = batch.len(), "Processing scene");

            let key = self.cache_key(description, narrative, self.chain.primary().id());
            if pending.as_ref().is_some_and(|p| p.key == key) {
                // The identical previous scene must be cached before looking it up.
                flush(&mut pending, &mut report).await;
            }

            if let Some((entry, image)) = self.lookup(&key).await {
                flush(&mut pending, &mut report).await;
                let scene = self
                    .report_cached(index, description, &entry, Arc::clone(&image))
                    .await;
                if scene.is_success() {
                    continuity.accept(image);
                }
                report.scenes.push(scene);
                continue;
            }

            let prompt = self.prompts.adapt(description, narrative).await;
            let guide = self.guide_for(index, &continuity).await;
            let request = GenerationRequest::from_params(
                index,
                prompt.positive_prompt.clone(),
                prompt.negative_prompt.clone(),
                &config.generation,
            )
            .with_guide(guide.clone());

            // Join point: previous persistence finishes before the device is used.
            flush(&mut pending, &mut report).await;

            let (initial, backend) = match self.chain.generate(&request).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::error!(scene_index = index, error = %e, "Scene failed");
                    report.scenes.push(SceneReport {
                        index,
                        description: description.clone(),
                        outcome: SceneOutcome::Failed(SceneFailure::from(e)),
                    });
                    continue;
                }
            };

            let attempt = SceneAttempt {
                scene_index: index,
                scene_description: description,
                narrative,
                params: &config.generation,
                guide,
                prompt,
            };
            let outcome = self.refiner.run(&backend, &attempt, initial, &self.ctx.cancel).await;
            if outcome.status == RefinementStatus::Cancelled {
                report.scenes.push(cancelled(index, description));
                continue;
            }

            // Stored under the backend that produced the image, so a fallback
            // result is never served as the primary's.
            let store_key = self.cache_key(description, narrative, backend.id());
            let image = Arc::new(outcome.result.image);
            continuity.accept(Arc::clone(&image));
            pending = Some(self.spawn_persist(
                index,
                description,
                store_key,
                FinalImage {
                    image,
                    backend: outcome.result.backend_used,
                    score: outcome.analysis.overall_score,
                    iterations: outcome.iterations,
                    gave_up: outcome.status == RefinementStatus::GivenUp,
                },
            ));
        }

        flush(&mut pending, &mut report).await;

        if self.ctx.is_cancelled() {
            for (index, description) in batch.iter().enumerate().skip(report.scenes.len()) {
                report.scenes.push(cancelled(index, description));
            }
            report.cancelled = true;
            let held = self.ctx.registry.held_names();
            let released = self.ctx.shutdown();
            tracing::warn!(
                completed = report.succeeded(),
                released,
                resources = ?held,
                "Batch cancelled, resources released",
            );
        }

        report.peak_memory_bytes = self.ctx.accountant.peak_usage();
        tracing::info!(
            scenes = report.scenes.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            truncated = report.truncated,
            peak_memory_bytes = report.peak_memory_bytes,
            "Batch finished",
        );

        let attempted = report.attempted();
        if !report.cancelled && attempted > 0 && report.succeeded() == 0 {
            return Err(PipelineError::AllScenesFailed {
                attempted,
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    // ---- private helpers ----

    /// Key over the scene, its deterministic prompt, every output parameter
    /// and the backend that generates it.
    fn cache_key(
        &self,
        description: &str,
        narrative: Option<&NarrativeContext>,
        backend_id: &str,
    ) -> String {
        let params = &self.ctx.config.generation;
        let template = template_prompt(description, narrative, params.width, params.height);
        cache_key(&CacheKeyInput {
            scene_description: description,
            prompt: &template.positive_prompt,
            negative_prompt: &template.negative_prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            guidance_scale: params.guidance_scale,
            sampler: &params.sampler,
            seed: params.seed,
            backend_id,
        })
    }

    async fn lookup(&self, key: &str) -> Option<(CacheEntry, Arc<RawImage>)> {
        let cache = self.ctx.cache.as_ref()?;
        let Some(entry) = cache.get(key).await else {
            tracing::debug!(key, "Cache miss");
            return None;
        };
        let image = cache.load_image(&entry).await?;

        let params = &self.ctx.config.generation;
        if (image.width(), image.height()) != (params.width, params.height) {
            tracing::warn!(
                key,
                width = image.width(),
                height = image.height(),
                "Cached image has the wrong resolution, discarding",
            );
            cache.invalidate(key).await;
            return None;
        }
        tracing::info!(key, backend = %entry.backend_used, "Cache hit");
        Some((entry, Arc::new(image)))
    }

    /// Drop expired entries left behind by earlier batches. Failures are logged.
    async fn purge_stale_cache(&self) {
        let Some(cache) = &self.ctx.cache else {
            return;
        };
        match cache.purge_expired().await {
            Ok(removed) => tracing::debug!(removed, "Cache purge finished"),
            Err(e) => tracing::warn!(error = %e, "Cache purge failed"),
        }
    }

    async fn report_cached(
        &self,
        index: SceneIndex,
        description: &str,
        entry: &CacheEntry,
        image: Arc<RawImage>,
    ) -> SceneReport {
        let config = &self.ctx.config;
        let saved = output::save_scene(
            image,
            index,
            config.output_dir.clone(),
            config.output_width,
            config.output_height,
        )
        .await;
        let outcome = match saved {
            Ok(path) => SceneOutcome::Completed(CompletedScene {
                path,
                source: SceneSource::Cache,
                backend: entry.backend_used.clone(),
                score: entry.score,
                iterations: 0,
                gave_up: false,
            }),
            Err(e) => output_failure(index, &e),
        };
        SceneReport {
            index,
            description: description.to_string(),
            outcome,
        }
    }

    async fn guide_for(
        &self,
        index: SceneIndex,
        continuity: &ContinuityContext,
    ) -> Option<Arc<ContinuityGuide>> {
        if !self.ctx.config.continuity_enabled {
            return None;
        }
        let source = continuity.source_for(index)?;
        let params = &self.ctx.config.generation;
        let (width, height) = (params.width, params.height);

        let built =
            tokio::task::spawn_blocking(move || ContinuityGuide::from_image(&source, width, height))
                .await;
        match built {
            Ok(Ok(guide)) => Some(Arc::new(guide)),
            Ok(Err(e)) => {
                tracing::warn!(
                    scene_index = index,
                    error = %e,
                    "Continuity guide failed, generating without",
                );
                None
            }
            Err(e) => {
                tracing::warn!(scene_index = index, error = %e, "Continuity guide task failed");
                None
            }
        }
    }

    /// Upscale, save and cache a final image on a background task.
    fn spawn_persist(
        &self,
        index: SceneIndex,
        description: &str,
        key: String,
        final_image: FinalImage,
    ) -> PendingScene {
        let ctx = Arc::clone(&self.ctx);
        let description = description.to_string();
        let task_key = key.clone();
        let task_description = description.clone();

        let handle = tokio::spawn(async move {
            let config = &ctx.config;
            let saved = output::save_scene(
                Arc::clone(&final_image.image),
                index,
                config.output_dir.clone(),
                config.output_width,
                config.output_height,
            )
            .await;

            let outcome = match saved {
                Ok(path) => {
                    if let Some(cache) = &ctx.cache {
                        store(cache, &task_key, &final_image, config.cache_ttl).await;
                    }
                    SceneOutcome::Completed(CompletedScene {
                        path,
                        source: SceneSource::Generated,
                        backend: final_image.backend,
                        score: Some(final_image.score),
                        iterations: final_image.iterations,
                        gave_up: final_image.gave_up,
                    })
                }
                Err(e) => output_failure(index, &e),
            };
            SceneReport {
                index,
                description: task_description,
                outcome,
            }
        });

        PendingScene {
            index,
            description,
            key,
            handle,
        }
    }
}

/// Write the generation-resolution image to the cache. Failures are logged.
async fn store(cache: &ResultCache, key: &str, final_image: &FinalImage, ttl: Duration) {
    let png = match output::encode_png_async(Arc::clone(&final_image.image)).await {
        Ok(png) => png,
        Err(e) => {
            tracing::warn!(key, error = %e, "Could not encode image for cache");
            return;
        }
    };
    if let Err(e) = cache
        .put(key, &png, &final_image.backend, Some(final_image.score), ttl)
        .await
    {
        tracing::warn!(key, error = %e, "Cache write failed");
    }
}

/// Wait for the background persistence of the previous scene, if any.
async fn flush(pending: &mut Option<PendingScene>, report: &mut BatchReport) {
    let Some(scene) = pending.take() else {
        return;
    };
    let entry = match scene.handle.await {
        Ok(entry) => entry,
        Err(e) => SceneReport {
            index: scene.index,
            description: scene.description,
            outcome: output_failure(scene.index, &PipelineError::Task(e.to_string())),
        },
    };
    report.scenes.push(entry);
}

fn cancelled(index: SceneIndex, description: &str) -> SceneReport {
    SceneReport {
        index,
        description: description.to_string(),
        outcome: SceneOutcome::Failed(SceneFailure::cancelled()),
    }
}

fn output_failure(index: SceneIndex, err: &PipelineError) -> SceneOutcome {
    tracing::error!(scene_index = index, error = %err, "Could not write scene output");
    SceneOutcome::Failed(SceneFailure {
        reason: FailureReason::OutputFailed,
        message: err.to_string(),
    })
}
