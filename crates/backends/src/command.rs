//! Local inference through an external stable-diffusion executable.
//!
//! [`CommandLoader`] checks the model weights and creates a private
//! scratch directory; the directory is removed when the pipeline's guard
//! is released. [`CommandPipeline`] runs one process per generation and
//! reads the image it writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storyframe_core::config::LocalEngineConfig;
use storyframe_core::generation::{GenerationRequest, RawImage};
use storyframe_core::guard::ResourceRegistry;
use tokio::process::Command;

use crate::error::BackendError;
use crate::local::{InferencePipeline, LoadedPipeline, PipelineLoader};

/// Loads a [`CommandPipeline`] for the configured executable and model.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    config: LocalEngineConfig,
    timeout: Duration,
}

impl CommandLoader {
    pub fn new(config: LocalEngineConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl PipelineLoader for CommandLoader {
    async fn load(&self, registry: &Arc<ResourceRegistry>) -> Result<LoadedPipeline, BackendError> {
        if !tokio::fs::try_exists(&self.config.model_path).await.unwrap_or(false) {
            return Err(BackendError::Unavailable(format!(
                "model weights not found at {}",
                self.config.model_path.display()
            )));
        }

        let scratch = self
            .config
            .work_dir
            .join(format!("storyframe-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await.map_err(|e| {
            BackendError::Unavailable(format!(
                "cannot create scratch dir {}: {e}",
                scratch.display()
            ))
        })?;

        let dir = scratch.clone();
        let guard = registry.acquire(format!("local-pipeline:{}", scratch.display()), move || {
            std::fs::remove_dir_all(&dir)?;
            Ok(())
        });

        tracing::info!(
            command = %self.config.command,
            model = %self.config.model_path.display(),
            "Local pipeline ready",
        );

        Ok(LoadedPipeline {
            pipeline: Arc::new(CommandPipeline {
                command: self.config.command.clone(),
                model_path: self.config.model_path.clone(),
                scratch,
                timeout: self.timeout,
            }),
            guard,
        })
    }
}

/// One loaded executable + model pair.
#[derive(Debug)]
pub struct CommandPipeline {
    command: String,
    model_path: PathBuf,
    scratch: PathBuf,
    timeout: Duration,
}

impl CommandPipeline {
    fn output_path(&self, request: &GenerationRequest) -> PathBuf {
        self.scratch
            .join(format!("scene-{}-{}.png", request.scene_index, request.seed))
    }

    fn control_path(&self, request: &GenerationRequest) -> PathBuf {
        self.scratch
            .join(format!("control-{}-{}.png", request.scene_index, request.seed))
    }
}

/// Command-line arguments for one generation.
pub fn build_args(
    model_path: &Path,
    request: &GenerationRequest,
    output: &Path,
    control: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        model_path.display().to_string(),
        "-p".to_string(),
        request.prompt.clone(),
        "-n".to_string(),
        request.negative_prompt.clone(),
        "-W".to_string(),
        request.width.to_string(),
        "-H".to_string(),
        request.height.to_string(),
        "--steps".to_string(),
        request.steps.to_string(),
        "--cfg-scale".to_string(),
        request.guidance_scale.to_string(),
        "--sampling-method".to_string(),
        request.sampler.clone(),
        "-s".to_string(),
        request.seed.to_string(),
        "-o".to_string(),
        output.display().to_string(),
    ];
    if let Some(control) = control {
        args.push("--control-image".to_string());
        args.push(control.display().to_string());
    }
    args
}

#[async_trait]
impl InferencePipeline for CommandPipeline {
    async fn run(&self, request: &GenerationRequest) -> Result<RawImage, BackendError> {
        let output = self.output_path(request);

        let control = match &request.continuity_guide {
            Some(guide) => {
                let path = self.control_path(request);
                tokio::fs::write(&path, guide.edge_png()?)
                    .await
                    .map_err(|e| BackendError::Failed(format!("cannot write control image: {e}")))?;
                Some(path)
            }
            None => None,
        };

        let args = build_args(&self.model_path, request, &output, control.as_deref());
        let start = std::time::Instant::now();

        tracing::debug!(
            scene_index = request.scene_index,
            command = %self.command,
            "Running local generation",
        );

        let result = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                tracing::error!(
                    scene_index = request.scene_index,
                    elapsed_ms,
                    stderr = %stderr.trim(),
                    "Local generation exited with failure",
                );
                Err(BackendError::Failed(format!(
                    "{} exited with {}: {}",
                    self.command,
                    out.status.code().unwrap_or(-1),
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => Err(BackendError::Unavailable(format!(
                "failed to execute {}: {e}",
                self.command
            ))),
            Err(_) => Err(BackendError::Failed(format!(
                "{} timed out after {}s",
                self.command,
                self.timeout.as_secs()
            ))),
        };

        if let Some(control) = &control {
            let _ = tokio::fs::remove_file(control).await;
        }
        outcome?;

        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| BackendError::Failed(format!("no output image written: {e}")))?;
        let _ = tokio::fs::remove_file(&output).await;

        tracing::debug!(scene_index = request.scene_index, elapsed_ms, "Local generation finished");

        image::load_from_memory(&bytes)
            .map_err(|e| BackendError::Failed(format!("output image could not be decoded: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use storyframe_core::generation::GenerationParams;

    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::from_params(
            1,
            "a quiet street".into(),
            "text".into(),
            &GenerationParams {
                width: 64,
                height: 64,
                steps: 4,
                seed: Some(42),
                ..Default::default()
            },
        )
    }

    #[test]
    fn args_carry_every_parameter() {
        let args = build_args(
            Path::new("/models/m.safetensors"),
            &request(),
            Path::new("/tmp/out.png"),
            None,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-m /models/m.safetensors"));
        assert!(joined.contains("-W 64 -H 64"));
        assert!(joined.contains("--steps 4"));
        assert!(joined.contains("--cfg-scale 7.5"));
        assert!(joined.contains("-s 42"));
        assert!(joined.ends_with("-o /tmp/out.png"));
        assert!(!joined.contains("--control-image"));

        let with_control = build_args(
            Path::new("m"),
            &request(),
            Path::new("o.png"),
            Some(Path::new("c.png")),
        );
        assert_eq!(with_control[with_control.len() - 2], "--control-image");
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = CommandLoader::new(
            LocalEngineConfig {
                command: "sd".into(),
                model_path: tmp.path().join("absent.safetensors"),
                work_dir: tmp.path().to_path_buf(),
            },
            Duration::from_secs(5),
        );
        let registry = ResourceRegistry::new();
        assert_matches!(
            loader.load(&registry).await,
            Err(BackendError::Unavailable(_))
        );
        assert_eq!(registry.held_count(), 0);
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("m.safetensors");
        std::fs::write(&model, b"weights").unwrap();
        let loader = CommandLoader::new(
            LocalEngineConfig {
                command: tmp.path().join("no-such-binary").display().to_string(),
                model_path: model,
                work_dir: tmp.path().to_path_buf(),
            },
            Duration::from_secs(5),
        );
        let registry = ResourceRegistry::new();
        let loaded = loader.load(&registry).await.unwrap();
        assert_matches!(
            loaded.pipeline.run(&request()).await,
            Err(BackendError::Unavailable(_))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_engine_output_is_decoded_and_scratch_removed() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("m.safetensors");
        std::fs::write(&model, b"weights").unwrap();

        let fixture = tmp.path().join("fixture.png");
        image::RgbImage::from_pixel(64, 64, image::Rgb([200, 100, 50]))
            .save(&fixture)
            .unwrap();

        // Copies the fixture to whatever follows `-o`.
        let script = tmp.path().join("fake-sd.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then cp {} \"$2\"; fi\n  shift\ndone\n",
                fixture.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let work_dir = tmp.path().join("work");
        let loader = CommandLoader::new(
            LocalEngineConfig {
                command: script.display().to_string(),
                model_path: model,
                work_dir: work_dir.clone(),
            },
            Duration::from_secs(10),
        );
        let registry = ResourceRegistry::new();
        let loaded = loader.load(&registry).await.unwrap();

        let img = loaded.pipeline.run(&request()).await.unwrap();
        assert_eq!((img.width(), img.height()), (64, 64));
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 1);

        assert!(loaded.guard.release());
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("m.safetensors");
        std::fs::write(&model, b"weights").unwrap();
        let loader = CommandLoader::new(
            LocalEngineConfig {
                command: "false".into(),
                model_path: model,
                work_dir: tmp.path().to_path_buf(),
            },
            Duration::from_secs(5),
        );
        let registry = ResourceRegistry::new();
        let loaded = loader.load(&registry).await.unwrap();
        assert_matches!(
            loaded.pipeline.run(&request()).await,
            Err(BackendError::Failed(_))
        );
    }
}
