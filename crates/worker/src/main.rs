//! `storyframe-worker` -- runs one scene batch from a JSON job file.
//!
//! ```text
//! storyframe-worker <job.json>
//! storyframe-worker --clear-cache
//! ```
//!
//! Configuration comes from the environment (see `PipelineConfig::from_env`).
//! The per-scene report is printed to stdout as JSON. Ctrl-C cancels the
//! batch cooperatively: the current backend call finishes, remaining
//! scenes are reported as cancelled.
//!
//! | Variable    | Default | Description                      |
//! |-------------|---------|----------------------------------|
//! | `GPU_INDEX` | `0`     | NVML device used for admission   |

mod job;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use storyframe_core::cache::ResultCache;
use storyframe_core::config::PipelineConfig;
use storyframe_gpu::NvmlDevice;
use storyframe_pipeline::{PipelineContext, PipelineError, SceneOrchestrator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::job::Job;

const CLEAR_CACHE_FLAG: &str = "--clear-cache";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storyframe_worker=info,storyframe_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let arg = std::env::args()
        .nth(1)
        .context("usage: storyframe-worker <job.json> | --clear-cache")?;
    let config = PipelineConfig::from_env()?;

    if arg == CLEAR_CACHE_FLAG {
        let removed = clear_cache(&config).await?;
        tracing::info!(removed, cache_dir = %config.cache_dir.display(), "Cache cleared");
        return Ok(());
    }

    let job = Job::load(&PathBuf::from(arg)).await?;
    let reference = job.reference()?;

    let gpu_index: u32 = match std::env::var("GPU_INDEX") {
        Ok(v) => v.parse().context("GPU_INDEX must be a non-negative integer")?,
        Err(_) => 0,
    };

    let device = NvmlDevice::new(gpu_index);
    for gpu in device.list_devices() {
        tracing::info!(
            gpu_index = gpu.gpu_index,
            name = %gpu.name,
            vram_used_mb = gpu.vram_used_mb,
            vram_total_mb = gpu.vram_total_mb,
            "GPU detected",
        );
    }

    tracing::info!(
        scenes = job.scenes.len(),
        primary = config.primary_backend.id(),
        secondary = config.secondary_backend.map(|k| k.id()),
        output_dir = %config.output_dir.display(),
        "Starting storyframe-worker",
    );

    let ctx = PipelineContext::new(config, Arc::new(device)).await?;
    let orchestrator = SceneOrchestrator::from_context(Arc::clone(&ctx))?;

    let interrupt = Arc::clone(&ctx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling batch");
            interrupt.cancel();
        }
    });

    let result = orchestrator
        .generate_scenes(&job.scenes, job.narrative.as_ref(), reference)
        .await;
    let released = ctx.shutdown();
    tracing::debug!(released, "Resources released");

    let (report, all_failed) = match result {
        Ok(report) => (report, false),
        Err(PipelineError::AllScenesFailed { report, .. }) => (*report, true),
        Err(e) => return Err(e.into()),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if all_failed {
        anyhow::bail!("All {} attempted scenes failed", report.attempted());
    }
    Ok(())
}

/// Remove every cached result under the configured cache directory.
async fn clear_cache(config: &PipelineConfig) -> anyhow::Result<usize> {
    let cache = ResultCache::open(&config.cache_dir).await?;
    Ok(cache.clear().await?)
}
