//! End-to-end batch runs against in-memory backends and scorers.
//!
//! Every test runs in its own temp directory, so cache and output files
//! never leak between tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use storyframe_backends::local::{InferencePipeline, LoadedPipeline, PipelineLoader};
use storyframe_backends::{BackendError, GenerationBackend, LocalEngine};
use storyframe_core::clock::{Clock, ManualClock, SystemClock};
use storyframe_core::config::PipelineConfig;
use storyframe_core::generation::{GenerationParams, GenerationRequest, RawImage};
use storyframe_core::guard::ResourceRegistry;
use storyframe_core::hashing::{cache_key, CacheKeyInput};
use storyframe_core::memory::FixedDevice;
use storyframe_core::prompt::template_prompt;
use storyframe_core::quality_gate::QualityAnalysis;
use storyframe_pipeline::chain::BackendChain;
use storyframe_pipeline::collaborators::{CollaboratorError, QualityScorer, ScoringInput};
use storyframe_pipeline::prompt_adapter::PromptAdapter;
use storyframe_pipeline::refinement::RefinementController;
use storyframe_pipeline::report::{FailureReason, SceneSource};
use storyframe_pipeline::{PipelineContext, PipelineError, SceneOrchestrator};
use tokio_util::sync::CancellationToken;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 96;
const GIB: u64 = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBackend {
    id: &'static str,
    calls: AtomicU32,
    guided_calls: AtomicU32,
    /// Fail every call with this error.
    fail_with: Option<BackendError>,
    /// Fail calls whose prompt contains this word.
    fail_on: Option<&'static str>,
    /// Cancelled on the first call.
    cancel_on_call: Option<CancellationToken>,
}

impl FakeBackend {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn failing(id: &'static str, err: BackendError) -> Self {
        Self {
            id,
            fail_with: Some(err),
            ..Default::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn id(&self) -> &str {
        self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<RawImage, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.continuity_guide.is_some() {
            self.guided_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        if self.fail_on.is_some_and(|word| request.prompt.contains(word)) {
            return Err(BackendError::Failed("model crashed".into()));
        }
        Ok(RawImage::ImageRgb8(image::RgbImage::from_pixel(
            request.width,
            request.height,
            image::Rgb([40, 80, 120]),
        )))
    }
}

/// Returns scripted scores in order, repeating the last one.
struct ScriptedScorer {
    scores: Mutex<VecDeque<f64>>,
}

impl ScriptedScorer {
    fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl QualityScorer for ScriptedScorer {
    async fn score(&self, _input: ScoringInput<'_>) -> Result<QualityAnalysis, CollaboratorError> {
        let mut scores = self.scores.lock().unwrap();
        let score = if scores.len() > 1 {
            scores.pop_front().unwrap()
        } else {
            *scores.front().unwrap()
        };
        Ok(QualityAnalysis {
            overall_score: score,
            refinement_suggestions: vec!["sharper focus".into()],
            ..QualityAnalysis::fallback()
        })
    }
}

struct CountingLoader {
    loads: AtomicU32,
}

struct SolidPipeline;

#[async_trait]
impl InferencePipeline for SolidPipeline {
    async fn run(&self, request: &GenerationRequest) -> Result<RawImage, BackendError> {
        Ok(RawImage::new_rgb8(request.width, request.height))
    }
}

#[async_trait]
impl PipelineLoader for CountingLoader {
    async fn load(&self, registry: &Arc<ResourceRegistry>) -> Result<LoadedPipeline, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedPipeline {
            pipeline: Arc::new(SolidPipeline),
            guard: registry.acquire("solid-pipeline", || Ok(())),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        cache_dir: dir.join("cache"),
        output_dir: dir.join("out"),
        generation: GenerationParams {
            width: WIDTH,
            height: HEIGHT,
            steps: 4,
            seed: Some(7),
            ..Default::default()
        },
        output_width: WIDTH * 2,
        output_height: HEIGHT * 2,
        scoring_enabled: false,
        ..Default::default()
    }
}

async fn context(config: PipelineConfig, device_bytes: u64) -> Arc<PipelineContext> {
    PipelineContext::new(config, Arc::new(FixedDevice::new(device_bytes)))
        .await
        .unwrap()
}

fn orchestrator(
    ctx: &Arc<PipelineContext>,
    primary: Arc<dyn GenerationBackend>,
    secondary: Option<Arc<dyn GenerationBackend>>,
    scorer: Option<Arc<dyn QualityScorer>>,
) -> SceneOrchestrator {
    let refiner = RefinementController::new(
        scorer,
        ctx.config.quality_threshold,
        ctx.config.max_refinement_iterations,
    );
    SceneOrchestrator::new(
        Arc::clone(ctx),
        BackendChain::new(primary, secondary),
        PromptAdapter::template(WIDTH, HEIGHT),
        refiner,
    )
}

fn scenes(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// -- cache --

#[tokio::test]
async fn repeated_scene_is_served_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));
    let orch = orchestrator(&ctx, backend.clone(), None, None);

    let report = orch
        .generate_scenes(&scenes(&["sunset", "city", "sunset"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
    assert_eq!(report.succeeded(), 3);
    let third = report.scenes[2].completed().unwrap();
    assert_matches!(third.source, SceneSource::Cache);
    assert_eq!(third.backend, "remote");
    assert_eq!(third.iterations, 0);
    assert_matches!(report.scenes[0].completed().unwrap().source, SceneSource::Generated);
}

#[tokio::test]
async fn identical_consecutive_scenes_hit_the_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));
    let orch = orchestrator(&ctx, backend.clone(), None, None);

    let report = orch
        .generate_scenes(&scenes(&["harbor", "harbor"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_matches!(report.scenes[1].completed().unwrap().source, SceneSource::Cache);
}

#[tokio::test]
async fn cache_persists_across_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new("remote"));

    let first = context(config(tmp.path()), 16 * GIB).await;
    orchestrator(&first, backend.clone(), None, None)
        .generate_scenes(&scenes(&["forest"]), None, None)
        .await
        .unwrap();

    let second = context(config(tmp.path()), 16 * GIB).await;
    let report = orchestrator(&second, backend.clone(), None, None)
        .generate_scenes(&scenes(&["forest"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_matches!(report.scenes[0].completed().unwrap().source, SceneSource::Cache);
}

#[tokio::test]
async fn disabled_cache_always_generates() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.cache_enabled = false;
    let ctx = context(cfg, 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["sunset", "sunset"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn fallback_images_are_cached_under_the_backend_that_made_them() {
    let tmp = tempfile::tempdir().unwrap();
    let primary_down = Arc::new(FakeBackend::failing(
        "remote",
        BackendError::Unavailable("connection refused".into()),
    ));
    let secondary = Arc::new(FakeBackend::new("local"));

    let first = context(config(tmp.path()), 16 * GIB).await;
    orchestrator(
        &first,
        primary_down,
        Some(secondary.clone() as Arc<dyn GenerationBackend>),
        None,
    )
    .generate_scenes(&scenes(&["sunset"]), None, None)
    .await
    .unwrap();

    // A healthy primary must not be handed the secondary's image.
    let healthy = Arc::new(FakeBackend::new("remote"));
    let second = context(config(tmp.path()), 16 * GIB).await;
    let report = orchestrator(
        &second,
        healthy.clone(),
        Some(secondary.clone() as Arc<dyn GenerationBackend>),
        None,
    )
    .generate_scenes(&scenes(&["sunset"]), None, None)
    .await
    .unwrap();

    assert_eq!(healthy.calls(), 1);
    let scene = report.scenes[0].completed().unwrap();
    assert_matches!(scene.source, SceneSource::Generated);
    assert_eq!(scene.backend, "remote");

    // With the secondary as primary, its own entry is reused.
    let local_primary = Arc::new(FakeBackend::new("local"));
    let third = context(config(tmp.path()), 16 * GIB).await;
    let report = orchestrator(&third, local_primary.clone(), None, None)
        .generate_scenes(&scenes(&["sunset"]), None, None)
        .await
        .unwrap();

    assert_eq!(local_primary.calls(), 0);
    let scene = report.scenes[0].completed().unwrap();
    assert_matches!(scene.source, SceneSource::Cache);
    assert_eq!(scene.backend, "local");
}

#[tokio::test]
async fn cached_image_with_wrong_resolution_is_regenerated() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let params = cfg.generation.clone();
    let ctx = context(cfg, 16 * GIB).await;

    let template = template_prompt("sunset", None, WIDTH, HEIGHT);
    let key = cache_key(&CacheKeyInput {
        scene_description: "sunset",
        prompt: &template.positive_prompt,
        negative_prompt: &template.negative_prompt,
        width: params.width,
        height: params.height,
        steps: params.steps,
        guidance_scale: params.guidance_scale,
        sampler: &params.sampler,
        seed: params.seed,
        backend_id: "remote",
    });
    let mut png = std::io::Cursor::new(Vec::new());
    RawImage::new_rgb8(8, 8)
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();
    let cache = ctx.cache.as_ref().unwrap();
    cache
        .put(&key, png.get_ref(), "remote", None, Duration::from_secs(60))
        .await
        .unwrap();

    let backend = Arc::new(FakeBackend::new("remote"));
    let report = orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["sunset"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_matches!(report.scenes[0].completed().unwrap().source, SceneSource::Generated);
    let cached = cache.get(&key).await.unwrap();
    let image = cache.load_image(&cached).await.unwrap();
    assert_eq!((image.width(), image.height()), (WIDTH, HEIGHT));
}

#[tokio::test]
async fn batch_purges_expired_entries_for_other_scenes() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let ctx = PipelineContext::with_clock(
        config(tmp.path()),
        Arc::new(FixedDevice::new(16 * GIB)),
        clock.clone(),
    )
    .await
    .unwrap();

    let cache = ctx.cache.as_ref().unwrap();
    cache
        .put("ab12cd", b"stale", "remote", None, Duration::from_secs(60))
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(120));

    let stale_record = tmp.path().join("cache/ab12cd.cache");
    assert!(stale_record.exists());

    orchestrator(&ctx, Arc::new(FakeBackend::new("remote")), None, None)
        .generate_scenes(&scenes(&["harbor"]), None, None)
        .await
        .unwrap();

    assert!(!stale_record.exists());
    assert!(!tmp.path().join("cache/ab12cd.png").exists());
}

// -- budget --

#[tokio::test]
async fn scene_list_is_truncated_to_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.max_scenes = 2;
    let ctx = context(cfg, 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    let report = orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["a", "b", "c", "d", "e"]), None, None)
        .await
        .unwrap();

    assert_eq!(report.scenes.len(), 2);
    assert_eq!(report.truncated, 3);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn empty_batch_is_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    let report = orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&[], None, None)
        .await
        .unwrap();

    assert!(report.scenes.is_empty());
    assert_eq!(backend.calls(), 0);
}

// -- memory --

#[tokio::test]
async fn exhausted_memory_is_recorded_not_raised() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 0).await;
    let loader = Arc::new(CountingLoader {
        loads: AtomicU32::new(0),
    });
    let engine = Arc::new(LocalEngine::new(
        loader.clone(),
        Arc::clone(&ctx.accountant),
        Arc::clone(&ctx.registry),
    ));

    let result = orchestrator(&ctx, engine, None, None)
        .generate_scenes(&scenes(&["a quiet street"]), None, None)
        .await;

    let report = assert_matches!(
        result,
        Err(PipelineError::AllScenesFailed { attempted: 1, report }) => report
    );
    let failure = report.scenes[0].failure().unwrap();
    assert_matches!(failure.reason, FailureReason::ResourceExhausted);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.accountant.outstanding(), 0);
}

#[tokio::test]
async fn local_engine_loads_once_per_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.memory_safety_margin_bytes = 0;
    let ctx = context(cfg, 16 * GIB).await;
    let loader = Arc::new(CountingLoader {
        loads: AtomicU32::new(0),
    });
    let engine = Arc::new(LocalEngine::new(
        loader.clone(),
        Arc::clone(&ctx.accountant),
        Arc::clone(&ctx.registry),
    ));

    let report = orchestrator(&ctx, engine, None, None)
        .generate_scenes(&scenes(&["dawn", "noon", "dusk"]), None, None)
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert!(report.peak_memory_bytes > 0);
    assert_eq!(ctx.accountant.outstanding(), 0);
}

// -- fallback --

#[tokio::test]
async fn unavailable_primary_falls_back_once_per_scene() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let primary = Arc::new(FakeBackend::failing(
        "remote",
        BackendError::Unavailable("connection refused".into()),
    ));
    let secondary = Arc::new(FakeBackend::new("local"));

    let report = orchestrator(
        &ctx,
        primary.clone(),
        Some(secondary.clone() as Arc<dyn GenerationBackend>),
        None,
    )
    .generate_scenes(&scenes(&["mountain", "river"]), None, None)
    .await
    .unwrap();

    assert_eq!(primary.calls(), 2);
    assert_eq!(secondary.calls(), 2);
    assert!(report
        .scenes
        .iter()
        .all(|s| s.completed().is_some_and(|c| c.backend == "local")));
}

#[tokio::test]
async fn both_backends_failing_fails_the_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let primary = Arc::new(FakeBackend::failing(
        "remote",
        BackendError::Unavailable("connection refused".into()),
    ));
    let secondary = Arc::new(FakeBackend::failing(
        "local",
        BackendError::Failed("driver error".into()),
    ));

    let result = orchestrator(
        &ctx,
        primary.clone(),
        Some(secondary.clone() as Arc<dyn GenerationBackend>),
        None,
    )
    .generate_scenes(&scenes(&["mountain", "river"]), None, None)
    .await;

    let report = assert_matches!(
        result,
        Err(PipelineError::AllScenesFailed { attempted: 2, report }) => report
    );
    assert_eq!(primary.calls(), 2);
    assert_eq!(secondary.calls(), 2);
    assert_matches!(
        report.scenes[0].failure().unwrap().reason,
        FailureReason::GenerationFailed
    );
}

#[tokio::test]
async fn one_failed_scene_does_not_fail_the_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend {
        id: "remote",
        fail_on: Some("storm"),
        ..Default::default()
    });

    let report = orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["calm sea", "storm", "lighthouse"]), None, None)
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.scenes[1].index, 1);
    assert!(!report.scenes[1].is_success());
    assert!(!tmp.path().join("out/scene_001.png").exists());
}

// -- refinement --

#[tokio::test]
async fn low_scores_stop_after_the_refinement_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.scoring_enabled = true;
    let ctx = context(cfg, 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));
    let scorer: Arc<dyn QualityScorer> = Arc::new(ScriptedScorer::new(&[4.0, 6.0, 5.0]));

    let report = orchestrator(&ctx, backend.clone(), None, Some(scorer))
        .generate_scenes(&scenes(&["crowded market"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 3);
    let scene = report.scenes[0].completed().unwrap();
    assert!(scene.gave_up);
    assert_eq!(scene.iterations, 2);
    assert_eq!(scene.score, Some(6.0));
}

#[tokio::test]
async fn passing_score_is_accepted_without_refinement() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.scoring_enabled = true;
    let ctx = context(cfg, 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));
    let scorer: Arc<dyn QualityScorer> = Arc::new(ScriptedScorer::new(&[8.2]));

    let report = orchestrator(&ctx, backend.clone(), None, Some(scorer))
        .generate_scenes(&scenes(&["library"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    let scene = report.scenes[0].completed().unwrap();
    assert!(!scene.gave_up);
    assert_eq!(scene.score, Some(8.2));
}

// -- continuity --

#[tokio::test]
async fn later_scenes_are_guided_by_the_previous_image() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["one", "two", "three"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 3);
    assert_eq!(backend.guided_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reference_image_guides_the_first_scene() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));
    let reference = RawImage::new_rgb8(WIDTH, HEIGHT);

    orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["one"]), None, Some(reference))
        .await
        .unwrap();

    assert_eq!(backend.guided_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn continuity_can_be_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.continuity_enabled = false;
    let ctx = context(cfg, 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["one", "two"]), None, None)
        .await
        .unwrap();

    assert_eq!(backend.guided_calls.load(Ordering::SeqCst), 0);
}

// -- output --

#[tokio::test]
async fn outputs_are_written_at_output_resolution() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend::new("remote"));

    let report = orchestrator(&ctx, backend, None, None)
        .generate_scenes(&scenes(&["one", "two"]), None, None)
        .await
        .unwrap();

    for (i, scene) in report.scenes.iter().enumerate() {
        let path = &scene.completed().unwrap().path;
        assert_eq!(path, &tmp.path().join(format!("out/scene_{i:03}.png")));
        let written = image::open(path).unwrap();
        assert_eq!((written.width(), written.height()), (WIDTH * 2, HEIGHT * 2));
    }
}

// -- cancellation --

#[tokio::test]
async fn cancellation_stops_the_batch_and_releases_resources() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(config(tmp.path()), 16 * GIB).await;
    let backend = Arc::new(FakeBackend {
        id: "remote",
        cancel_on_call: Some(ctx.cancel.clone()),
        ..Default::default()
    });
    let released = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&released);
    let _guard = ctx.registry.acquire("scratch", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = orchestrator(&ctx, backend.clone(), None, None)
        .generate_scenes(&scenes(&["one", "two", "three"]), None, None)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(backend.calls(), 1);
    assert_eq!(report.scenes.len(), 3);
    assert!(report.scenes[0].is_success());
    assert_matches!(
        report.scenes[2].failure().unwrap().reason,
        FailureReason::Cancelled
    );
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.registry.held_count(), 0);
}
