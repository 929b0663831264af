//! Pipeline configuration loaded from environment variables.
//!
//! All fields have defaults suitable for local development. A value that
//! is present but malformed is a [`CoreError::Validation`] naming the
//! offending variable rather than a silent fallback.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::generation::GenerationParams;
use crate::types::BYTES_PER_MB;

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 7.5;
pub const DEFAULT_MAX_REFINEMENT_ITERATIONS: u32 = 2;
pub const DEFAULT_MAX_SCENES: usize = 3;
pub const DEFAULT_SAFETY_MARGIN_MB: u64 = 1024;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_OUTPUT_WIDTH: u32 = 1080;
pub const DEFAULT_OUTPUT_HEIGHT: u32 = 1920;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_COLLABORATOR_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// BackendKind
// ---------------------------------------------------------------------------

/// Which generation backend variant to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// HTTP inference service.
    Remote,
    /// In-process inference engine on the local accelerator.
    Local,
}

impl BackendKind {
    /// Stable identifier, also used in cache keys.
    pub fn id(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "webui" | "http" => Ok(Self::Remote),
            "local" | "engine" => Ok(Self::Local),
            other => Err(CoreError::Validation(format!(
                "Unknown backend '{other}'. Must be one of: remote, local"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Settings for the external-command local inference pipeline.
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    /// Executable to invoke for each generation.
    pub command: String,
    /// Model weights passed to the executable.
    pub model_path: PathBuf,
    /// Parent directory for per-load scratch space.
    pub work_dir: PathBuf,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            command: "sd".to_string(),
            model_path: PathBuf::from("models/model.safetensors"),
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Configuration for one batch run of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub quality_threshold: f64,
    pub max_refinement_iterations: u32,
    pub max_scenes: usize,
    pub memory_safety_margin_bytes: u64,
    pub primary_backend: BackendKind,
    /// `None` disables fallback.
    pub secondary_backend: Option<BackendKind>,
    pub continuity_enabled: bool,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub generation: GenerationParams,
    pub output_width: u32,
    pub output_height: u32,
    pub remote_host: String,
    pub request_timeout: Duration,
    pub prompt_service_url: Option<String>,
    pub scoring_enabled: bool,
    pub scoring_service_url: Option<String>,
    pub collaborator_timeout: Duration,
    pub local_engine: LocalEngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_refinement_iterations: DEFAULT_MAX_REFINEMENT_ITERATIONS,
            max_scenes: DEFAULT_MAX_SCENES,
            memory_safety_margin_bytes: DEFAULT_SAFETY_MARGIN_MB * BYTES_PER_MB,
            primary_backend: BackendKind::Remote,
            secondary_backend: Some(BackendKind::Local),
            continuity_enabled: true,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_dir: PathBuf::from(".cache/storyframe"),
            output_dir: PathBuf::from("output"),
            generation: GenerationParams::default(),
            output_width: DEFAULT_OUTPUT_WIDTH,
            output_height: DEFAULT_OUTPUT_HEIGHT,
            remote_host: "http://127.0.0.1:7860".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            prompt_service_url: None,
            scoring_enabled: true,
            scoring_service_url: None,
            collaborator_timeout: Duration::from_secs(DEFAULT_COLLABORATOR_TIMEOUT_SECS),
            local_engine: LocalEngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                    |
    /// |-----------------------------|----------------------------|
    /// | `QUALITY_THRESHOLD`         | `7.5`                      |
    /// | `MAX_REFINEMENT_ITERATIONS` | `2`                        |
    /// | `MAX_SCENES`                | `3`                        |
    /// | `MEMORY_SAFETY_MARGIN_MB`   | `1024`                     |
    /// | `PRIMARY_BACKEND`           | `remote`                   |
    /// | `SECONDARY_BACKEND`         | `local` (`none` disables)  |
    /// | `CONTINUITY_ENABLED`        | `true`                     |
    /// | `CACHE_ENABLED`             | `true`                     |
    /// | `CACHE_TTL_SECONDS`         | `604800`                   |
    /// | `CACHE_DIR`                 | `.cache/storyframe`        |
    /// | `OUTPUT_DIR`                | `output`                   |
    /// | `GENERATION_WIDTH`          | `512`                      |
    /// | `GENERATION_HEIGHT`         | `768`                      |
    /// | `OUTPUT_WIDTH`              | `1080`                     |
    /// | `OUTPUT_HEIGHT`             | `1920`                     |
    /// | `GENERATION_STEPS`          | `30`                       |
    /// | `GUIDANCE_SCALE`            | `7.5`                      |
    /// | `SAMPLER`                   | `DPM++ 2M Karras`          |
    /// | `SEED`                      | `-1` (random)              |
    /// | `REMOTE_HOST`               | `http://127.0.0.1:7860`    |
    /// | `REQUEST_TIMEOUT_SECS`      | `120`                      |
    /// | `PROMPT_SERVICE_URL`        | unset                      |
    /// | `SCORING_ENABLED`           | `true`                     |
    /// | `SCORING_SERVICE_URL`       | unset                      |
    /// | `COLLABORATOR_TIMEOUT_SECS` | `30`                       |
    /// | `LOCAL_ENGINE_COMMAND`      | `sd`                       |
    /// | `LOCAL_MODEL_PATH`          | `models/model.safetensors` |
    /// | `LOCAL_WORK_DIR`            | system temp dir            |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let gen_defaults = &defaults.generation;

        let secondary_backend = match env_opt("SECONDARY_BACKEND") {
            None => defaults.secondary_backend,
            Some(v) if v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v.parse()?),
        };

        let seed: i64 = env_parse("SEED", -1)?;
        let seed = u64::try_from(seed).ok();

        let generation = GenerationParams {
            width: env_parse("GENERATION_WIDTH", gen_defaults.width)?,
            height: env_parse("GENERATION_HEIGHT", gen_defaults.height)?,
            steps: env_parse("GENERATION_STEPS", gen_defaults.steps)?,
            guidance_scale: env_parse("GUIDANCE_SCALE", gen_defaults.guidance_scale)?,
            sampler: env_opt("SAMPLER").unwrap_or_else(|| gen_defaults.sampler.clone()),
            seed,
        };

        let local_engine = LocalEngineConfig {
            command: env_opt("LOCAL_ENGINE_COMMAND")
                .unwrap_or(defaults.local_engine.command.clone()),
            model_path: env_opt("LOCAL_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_engine.model_path.clone()),
            work_dir: env_opt("LOCAL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_engine.work_dir.clone()),
        };

        let config = Self {
            quality_threshold: env_parse("QUALITY_THRESHOLD", defaults.quality_threshold)?,
            max_refinement_iterations: env_parse(
                "MAX_REFINEMENT_ITERATIONS",
                defaults.max_refinement_iterations,
            )?,
            max_scenes: env_parse("MAX_SCENES", defaults.max_scenes)?,
            memory_safety_margin_bytes: env_parse("MEMORY_SAFETY_MARGIN_MB", DEFAULT_SAFETY_MARGIN_MB)?
                * BYTES_PER_MB,
            primary_backend: env_parse("PRIMARY_BACKEND", defaults.primary_backend)?,
            secondary_backend,
            continuity_enabled: env_bool("CONTINUITY_ENABLED", defaults.continuity_enabled)?,
            cache_enabled: env_bool("CACHE_ENABLED", defaults.cache_enabled)?,
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL_SECS)?),
            cache_dir: env_opt("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            output_dir: env_opt("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            generation,
            output_width: env_parse("OUTPUT_WIDTH", defaults.output_width)?,
            output_height: env_parse("OUTPUT_HEIGHT", defaults.output_height)?,
            remote_host: env_opt("REMOTE_HOST")
                .unwrap_or(defaults.remote_host)
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            prompt_service_url: env_opt("PROMPT_SERVICE_URL"),
            scoring_enabled: env_bool("SCORING_ENABLED", defaults.scoring_enabled)?,
            scoring_service_url: env_opt("SCORING_SERVICE_URL"),
            collaborator_timeout: Duration::from_secs(env_parse(
                "COLLABORATOR_TIMEOUT_SECS",
                DEFAULT_COLLABORATOR_TIMEOUT_SECS,
            )?),
            local_engine,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        crate::quality_gate::validate_threshold(self.quality_threshold)?;
        self.generation.validate()?;
        crate::generation::validate_dimensions(self.output_width, self.output_height)?;
        if self.secondary_backend == Some(self.primary_backend) {
            return Err(CoreError::Validation(format!(
                "secondary_backend must differ from primary_backend ({})",
                self.primary_backend.id()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

/// Read a variable, treating unset and blank the same.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value: '{raw}'"))),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, CoreError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => parse_bool(&raw)
            .ok_or_else(|| CoreError::Validation(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
