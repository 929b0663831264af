//! Generation request model, validation and memory sizing.
//!
//! A [`GenerationRequest`] is built fresh for every attempt (initial or
//! refinement) and dropped when the attempt ends. The result of a
//! backend call is a [`GenerationResult`], which is moved from stage to
//! stage rather than shared.

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::continuity::ContinuityGuide;
use crate::error::CoreError;
use crate::types::{SceneIndex, BYTES_PER_MB};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 768;
pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;
pub const DEFAULT_SAMPLER: &str = "DPM++ 2M Karras";

/// Latent space downsampling factor; image dimensions must be multiples of it.
pub const DIMENSION_ALIGNMENT: u32 = 8;

/// Resident size of a loaded diffusion pipeline (weights + VAE + text encoder).
pub const PIPELINE_FOOTPRINT_MB: u64 = 2560;
/// Activation memory per megapixel of output.
pub const ACTIVATION_MB_PER_MEGAPIXEL: u64 = 1536;
/// Scheduler state kept per denoising step.
pub const PER_STEP_OVERHEAD_MB: u64 = 2;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Resolved generation parameters shared by every scene in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub sampler: String,
    /// `None` draws a fresh random seed for every attempt.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            sampler: DEFAULT_SAMPLER.to_string(),
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_dimensions(self.width, self.height)?;
        validate_steps(self.steps)?;
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(CoreError::Validation(format!(
                "guidance_scale must be positive, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// One backend call's worth of input.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub scene_index: SceneIndex,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub sampler: String,
    pub seed: u64,
    pub continuity_guide: Option<Arc<ContinuityGuide>>,
}

impl GenerationRequest {
    /// Build a request from batch parameters and an adapted prompt pair.
    ///
    /// A random seed is drawn when `params.seed` is `None`.
    pub fn from_params(
        scene_index: SceneIndex,
        prompt: String,
        negative_prompt: String,
        params: &GenerationParams,
    ) -> Self {
        Self {
            scene_index,
            prompt,
            negative_prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            guidance_scale: params.guidance_scale,
            sampler: params.sampler.clone(),
            seed: params.seed.unwrap_or_else(random_seed),
            continuity_guide: None,
        }
    }

    /// Attach continuity guidance derived from the previous frame.
    pub fn with_guide(mut self, guide: Option<Arc<ContinuityGuide>>) -> Self {
        self.continuity_guide = guide;
        self
    }

    /// Check the request invariants: dimensions multiple of 8, at least one step.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_dimensions(self.width, self.height)?;
        validate_steps(self.steps)?;
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation("prompt must not be empty".to_string()));
        }
        Ok(())
    }

    /// Device memory this request needs, excluding an already-loaded pipeline.
    pub fn activation_bytes(&self) -> u64 {
        estimate_activation_bytes(self.width, self.height, self.steps)
    }
}

/// A decoded image as returned by a backend.
pub type RawImage = DynamicImage;

/// A decoded image together with how it was produced.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: RawImage,
    pub backend_used: String,
    pub wall_time: Duration,
    pub raw_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Width and height must be non-zero multiples of [`DIMENSION_ALIGNMENT`].
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    for (name, value) in [("width", width), ("height", height)] {
        if value == 0 || value % DIMENSION_ALIGNMENT != 0 {
            return Err(CoreError::Validation(format!(
                "{name} must be a positive multiple of {DIMENSION_ALIGNMENT}, got {value}"
            )));
        }
    }
    Ok(())
}

pub fn validate_steps(steps: u32) -> Result<(), CoreError> {
    if steps == 0 {
        return Err(CoreError::Validation("steps must be at least 1".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Memory sizing
// ---------------------------------------------------------------------------

/// Activation memory for one generation at the given size.
pub fn estimate_activation_bytes(width: u32, height: u32, steps: u32) -> u64 {
    let pixels = u64::from(width) * u64::from(height);
    // Round up to whole MB so tiny requests never estimate to zero.
    let activation_mb = (pixels * ACTIVATION_MB_PER_MEGAPIXEL).div_ceil(1_000_000);
    (activation_mb + u64::from(steps) * PER_STEP_OVERHEAD_MB) * BYTES_PER_MB
}

/// Total device memory for a generation including loading the pipeline.
pub fn estimate_generation_bytes(width: u32, height: u32, steps: u32) -> u64 {
    PIPELINE_FOOTPRINT_MB * BYTES_PER_MB + estimate_activation_bytes(width, height, steps)
}

fn random_seed() -> u64 {
    // A v4 UUID carries 122 random bits; 32 of them make a portable seed.
    let bits = uuid::Uuid::new_v4().as_u128();
    (bits as u64) & u64::from(u32::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
